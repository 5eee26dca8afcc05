//! Agent configuration
//!
//! Stored as TOML. Every field has a default so a partial file (or none at
//! all) still yields a runnable watch-only agent.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::chunker::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, TextChunker};
use crate::events::DEFAULT_SUBSCRIBER_CAPACITY;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directories to watch
    pub roots: Vec<PathBuf>,

    /// Known roots that are currently not watched
    pub disabled_roots: Vec<PathBuf>,

    /// Where the state database and logs live
    pub data_dir: PathBuf,

    pub debounce_ms: u64,

    pub chunk_size: usize,
    pub chunk_overlap: usize,

    /// Total time budget for delivering all chunks of one file
    pub delivery_timeout_secs: u64,

    /// Ingestion service base URL; unset means watch-only mode
    pub server_url: Option<String>,

    /// Identifier sent with every chunk
    pub client_id: String,

    /// Extra extensions treated as plain text, on top of the built-in set
    pub extra_text_extensions: Vec<String>,

    pub subscriber_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            roots: vec![],
            disabled_roots: vec![],
            data_dir: PathBuf::from(".ingest-agent"),
            debounce_ms: 500,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            delivery_timeout_secs: 300,
            server_url: None,
            client_id: "ingest-agent".to_string(),
            extra_text_extensions: vec![],
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl AgentConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(
                "No config at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }

        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, raw).with_context(|| format!("Failed to write config {}", path.display()))?;
        info!("Saved config to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.chunker()
            .validate()
            .context("Invalid chunking configuration")?;
        if self.debounce_ms == 0 {
            bail!("debounce_ms must be greater than zero");
        }
        if self.delivery_timeout_secs == 0 {
            bail!("delivery_timeout_secs must be greater than zero");
        }
        Ok(())
    }

    pub fn chunker(&self) -> TextChunker {
        TextChunker::new(self.chunk_size, self.chunk_overlap)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout_secs)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}
