use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use ingest_agent::{AgentConfig, ChangeStore, DeliveryStatus, EventBroadcaster, WatchManager};

#[derive(Parser)]
#[command(name = "ingest-agent")]
#[command(about = "Watch document folders and stream their text to an ingestion service", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(short, long, global = true, default_value = "ingest-agent.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the configured roots until Ctrl-C
    Run {
        /// Additional directory to watch (repeatable)
        #[arg(short, long)]
        root: Vec<PathBuf>,

        /// Ingestion service base URL (overrides config)
        #[arg(short, long)]
        server: Option<String>,

        /// Data directory for state and logs (overrides config)
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Print tracked-file counts by delivery status
    Status {
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Write a default config file
    InitConfig {
        /// Destination (defaults to --config)
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AgentConfig::load(&cli.config)?;

    match cli.command {
        Commands::Run {
            root,
            server,
            data_dir,
        } => {
            config.roots.extend(root);
            if server.is_some() {
                config.server_url = server;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }

            let _guards = init_logging(&config.log_dir())?;
            run(config).await
        }
        Commands::Status { data_dir } => {
            if let Some(data_dir) = data_dir {
                config.data_dir = data_dir;
            }
            print_status(&config)
        }
        Commands::InitConfig { path } => {
            let path = path.unwrap_or(cli.config);
            AgentConfig::default().save(&path)?;
            println!("Wrote default config to {}", path.display());
            Ok(())
        }
    }
}

async fn run(config: AgentConfig) -> Result<()> {
    info!("Starting Ingest Agent v{}", env!("CARGO_PKG_VERSION"));

    let broadcaster = Arc::new(EventBroadcaster::new(config.subscriber_capacity));
    let manager = WatchManager::from_config(&config, broadcaster.clone())?;

    let server = config.server_url.as_deref().unwrap_or_default();
    match manager.check_server().await {
        Some(true) => info!("Ingestion service at {} is reachable", server),
        Some(false) => warn!(
            "Ingestion service at {} is not reachable, deliveries will fail until it is",
            server
        ),
        None => {}
    }

    // Follow connectivity changes of the delivering client
    let connectivity_log = manager.server_status().map(|status| {
        let mut changes = status.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let now = *changes.borrow_and_update();
                info!("Ingestion service is now {:?}", now);
            }
        })
    });

    // Mirror pipeline events into the log
    let mut subscription = broadcaster.subscribe();
    let event_log = tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            debug!("[{}] {}", event.kind, event.message);
        }
    });

    let shutdown = CancellationToken::new();
    manager.start(shutdown.clone()).await?;

    let status = manager.status().await;
    if status.active_roots.is_empty() {
        warn!("No active roots - add one with --root or in the config file");
    }
    for root in &status.active_roots {
        info!("Watching {}", root.display());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    shutdown.cancel();
    manager.stop().await?;
    event_log.abort();
    if let Some(task) = connectivity_log {
        task.abort();
    }

    info!("Ingest Agent stopped");
    Ok(())
}

fn print_status(config: &AgentConfig) -> Result<()> {
    let db_path = config.db_path();
    if !db_path.exists() {
        println!("No state database at {}", db_path.display());
        return Ok(());
    }

    let store = ChangeStore::open(&db_path)
        .with_context(|| format!("Failed to open {}", db_path.display()))?;

    println!("Tracked files: {}", store.count()?);
    for status in DeliveryStatus::ALL {
        let count = store.count_by_status(status)?;
        if count > 0 {
            println!("  {:<14} {}", status.as_str(), count);
        }
    }

    store.close()?;
    Ok(())
}

/// Console plus daily-rolling file output. The guards must outlive the program.
fn init_logging(logs_dir: &Path) -> Result<(WorkerGuard, WorkerGuard)> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("ingest_agent=info"))
        .context("Invalid log filter")?;

    fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create logs directory {}", logs_dir.display()))?;

    let file_appender = rolling::daily(logs_dir, "agent.log");
    let (non_blocking_file, file_guard) = non_blocking(file_appender);
    let (non_blocking_console, console_guard) = non_blocking(std::io::stdout());

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking_console)
                .with_target(false)
                .with_ansi(true),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_target(true)
                .with_ansi(false)
                .with_file(true)
                .with_line_number(true),
        )
        .init();

    info!("Logging to {}", logs_dir.join("agent.log").display());
    Ok((console_guard, file_guard))
}
