//! Watch Manager - recursive directory watching and pipeline orchestration
//!
//! # Architecture
//!
//! Each enabled root gets its own native watcher registered non-recursively on
//! the root and on every subdirectory; directories created later are registered
//! as their creation events arrive. Per root:
//!
//! 1. **Drain task** → waits on the watcher's event stream, its error stream and
//!    the shutdown token, filters events and feeds candidate files to the debouncer
//! 2. **Debouncer** → fires once a path has been quiet for the configured period
//! 3. **Processing task** → one per fire, runs `FileProcessor::process`
//!
//! Existing files ride the same debounce path on startup. The root set and the
//! per-root watcher handles sit behind one `RwLock`: event dispatch and status
//! take it shared, reload/toggle/add/remove take it exclusively.

pub mod filtering;
pub mod pipeline;
pub mod types;

use anyhow::Context;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::AgentConfig;
use crate::debounce::Debouncer;
use crate::decision::DecisionEngine;
use crate::error::WatchError;
use crate::events::{EventBroadcaster, EventType};
use crate::extract::{ExtractorRegistry, PlainTextExtractor, TextExtractor};
use crate::ingest::{HttpIngestionClient, IngestionClient, ServerStatus};
use crate::store::ChangeStore;

pub use filtering::{FileFilter, is_supported_file, is_temporary_file};
pub use pipeline::{FileProcessor, ProcessOutcome};
pub use types::{WatchRoot, WatchStatus};

type SharedWatcher = Arc<StdMutex<RecommendedWatcher>>;
type RegisteredDirs = Arc<StdMutex<HashSet<PathBuf>>>;

/// Native watcher plus bookkeeping for one active root
struct RootWatch {
    /// Path the watcher was registered on (absolute, symlinks resolved)
    watch_path: PathBuf,
    watcher: SharedWatcher,
    registered: RegisteredDirs,
    cancel: CancellationToken,
    drain: JoinHandle<()>,
}

/// State that exists only between `start` and `stop`
struct RunState {
    shutdown: CancellationToken,
    debouncer: Arc<Debouncer>,
    watches: HashMap<PathBuf, RootWatch>,
}

struct ManagerState {
    roots: Vec<WatchRoot>,
    run: Option<RunState>,
}

struct ManagerInner {
    processor: Arc<FileProcessor>,
    filter: FileFilter,
    debounce: Duration,
    state: RwLock<ManagerState>,
    /// Per-file processing and startup scan tasks
    tasks: TaskTracker,
}

/// Orchestrates watching, debouncing and processing for a set of roots
#[derive(Clone)]
pub struct WatchManager {
    inner: Arc<ManagerInner>,
}

impl WatchManager {
    pub fn new(
        roots: Vec<WatchRoot>,
        processor: FileProcessor,
        filter: FileFilter,
        debounce: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                processor: Arc::new(processor),
                filter,
                debounce,
                state: RwLock::new(ManagerState {
                    roots: dedup_roots(roots),
                    run: None,
                }),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Wire up store, extractors, chunker and (optionally) the HTTP client from config
    pub fn from_config(
        config: &AgentConfig,
        broadcaster: Arc<EventBroadcaster>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = Arc::new(
            ChangeStore::open(config.db_path())
                .with_context(|| format!("Failed to open {}", config.db_path().display()))?,
        );

        let mut registry = ExtractorRegistry::with_plain_text();
        let plain: Arc<dyn TextExtractor> = Arc::new(PlainTextExtractor);
        for ext in &config.extra_text_extensions {
            registry.register(ext, plain.clone());
        }
        let filter = FileFilter::from_registry(&registry);

        let client: Option<Arc<dyn IngestionClient>> = match &config.server_url {
            Some(url) => Some(Arc::new(
                HttpIngestionClient::new(url.as_str()).context("Failed to build HTTP client")?,
            )),
            None => {
                warn!("No server_url configured - running in watch-only mode");
                None
            }
        };

        let processor = FileProcessor::new(
            DecisionEngine::new(store),
            Arc::new(registry),
            config.chunker(),
            client,
            broadcaster,
            config.delivery_timeout(),
            config.client_id.clone(),
        );

        Ok(Self::new(
            roots_from(&config.roots, &config.disabled_roots),
            processor,
            filter,
            config.debounce(),
        ))
    }

    pub fn processor(&self) -> &Arc<FileProcessor> {
        &self.inner.processor
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        self.inner.processor.broadcaster()
    }

    pub fn store(&self) -> &Arc<ChangeStore> {
        self.inner.processor.engine().store()
    }

    /// Connectivity of the client that delivers chunks, if it tracks any
    pub fn server_status(&self) -> Option<ServerStatus> {
        self.inner
            .processor
            .client()
            .and_then(|client| client.server_status())
            .cloned()
    }

    /// Check the ingestion service through the delivering client.
    /// `None` in watch-only mode.
    pub async fn check_server(&self) -> Option<bool> {
        match self.inner.processor.client() {
            Some(client) => Some(client.check_health().await),
            None => None,
        }
    }

    /// Register every enabled root and queue its existing files.
    ///
    /// `shutdown` is the process-wide cancellation signal; cancelling it stops
    /// all drain tasks, but `stop` must still be called to release resources.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<(), WatchError> {
        let mut state = self.inner.state.write().await;
        if state.run.is_some() {
            debug!("Watch manager already running");
            return Ok(());
        }

        // A previous stop closed the store
        self.store().reopen()?;

        let processor = Arc::clone(&self.inner.processor);
        let tasks = self.inner.tasks.clone();
        let debouncer = Arc::new(Debouncer::new(
            self.inner.debounce,
            Arc::new(move |path: PathBuf| {
                let processor = Arc::clone(&processor);
                tasks.spawn(async move {
                    processor.process(path).await;
                });
            }),
        ));

        let mut run = RunState {
            shutdown,
            debouncer,
            watches: HashMap::new(),
        };

        let enabled: Vec<PathBuf> = state
            .roots
            .iter()
            .filter(|root| root.enabled)
            .map(|root| root.path.clone())
            .collect();

        for root in enabled {
            if let Err(e) = self.activate_root(&mut run, &root).await {
                // A broken root must not take the others down with it
                error!("Failed to watch {}: {}", root.display(), e);
            }
        }

        info!("Watch manager started with {} active roots", run.watches.len());
        state.run = Some(run);
        Ok(())
    }

    /// Stop watching, let in-flight files finish, then close the change store
    pub async fn stop(&self) -> Result<(), WatchError> {
        self.teardown().await;
        self.store().close()?;
        info!("Watch manager stopped");
        Ok(())
    }

    /// Replace the root set and restart. The change store stays open.
    pub async fn reload(
        &self,
        roots: Vec<PathBuf>,
        disabled_roots: Vec<PathBuf>,
    ) -> Result<(), WatchError> {
        let shutdown = {
            let state = self.inner.state.read().await;
            state.run.as_ref().map(|run| run.shutdown.clone())
        };

        self.teardown().await;

        {
            let mut state = self.inner.state.write().await;
            state.roots = roots_from(&roots, &disabled_roots);
        }
        info!("Reloading watch manager with {} roots", roots.len());

        // Only restart if we were running and the process is not shutting down
        match shutdown {
            Some(shutdown) if !shutdown.is_cancelled() => self.start(shutdown).await,
            _ => Ok(()),
        }
    }

    /// Enable or disable one known root in place
    pub async fn toggle_path(&self, path: &Path, enabled: bool) -> Result<(), WatchError> {
        let key = absolute(path)?;
        let mut state = self.inner.state.write().await;

        let root = state
            .roots
            .iter_mut()
            .find(|root| root.path == key)
            .ok_or_else(|| WatchError::UnknownRoot(key.clone()))?;
        if root.enabled == enabled {
            return Ok(());
        }
        root.enabled = enabled;
        info!(
            "{} {}",
            if enabled { "Enabling" } else { "Disabling" },
            key.display()
        );

        let Some(run) = state.run.as_mut() else {
            return Ok(());
        };

        if enabled {
            self.activate_root(run, &key).await
        } else {
            let removed = run.watches.remove(&key);
            if let Some(watch) = &removed {
                forget_pending(run, watch);
            }
            drop(state);
            if let Some(watch) = removed {
                deactivate(watch).await;
            }
            Ok(())
        }
    }

    /// Add a new enabled root, watching it immediately if running
    pub async fn add_path(&self, path: &Path) -> Result<(), WatchError> {
        let key = absolute(path)?;
        let mut state = self.inner.state.write().await;
        if state.roots.iter().any(|root| root.path == key) {
            drop(state);
            return self.toggle_path(&key, true).await;
        }

        state.roots.push(WatchRoot::enabled(key.clone()));
        info!("Added root {}", key.display());

        match state.run.as_mut() {
            Some(run) => self.activate_root(run, &key).await,
            None => Ok(()),
        }
    }

    /// Forget a root entirely. Its tracked-file records are kept.
    pub async fn remove_path(&self, path: &Path) -> Result<(), WatchError> {
        let key = absolute(path)?;
        let mut state = self.inner.state.write().await;

        let before = state.roots.len();
        state.roots.retain(|root| root.path != key);
        if state.roots.len() == before {
            return Err(WatchError::UnknownRoot(key));
        }

        let removed = state.run.as_mut().and_then(|run| run.watches.remove(&key));
        if let (Some(run), Some(watch)) = (state.run.as_ref(), removed.as_ref()) {
            forget_pending(run, watch);
        }
        drop(state);
        if let Some(watch) = removed {
            deactivate(watch).await;
        }
        info!("Removed root {}", key.display());
        Ok(())
    }

    pub async fn status(&self) -> WatchStatus {
        let state = self.inner.state.read().await;
        let mut active_roots: Vec<PathBuf> = state
            .run
            .as_ref()
            .map(|run| run.watches.keys().cloned().collect())
            .unwrap_or_default();
        active_roots.sort();

        WatchStatus {
            running: state.run.is_some(),
            active_roots,
            roots: state.roots.clone(),
            ingestion_enabled: self.inner.processor.has_client(),
            server: self.server_status().map(|status| status.get()),
        }
    }

    /// Stop every drain task and debounce timer, drop the native watchers and
    /// wait for in-flight processing tasks.
    async fn teardown(&self) {
        let run = self.inner.state.write().await.run.take();

        if let Some(run) = run {
            run.debouncer.stop_all();
            let watches: Vec<RootWatch> = run.watches.into_values().collect();
            for watch in &watches {
                watch.cancel.cancel();
            }
            for watch in watches {
                deactivate(watch).await;
            }
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();
    }

    /// Create the root's watcher, register its tree and spawn its drain task
    /// and startup scan. Caller holds the state lock exclusively.
    async fn activate_root(&self, run: &mut RunState, root: &Path) -> Result<(), WatchError> {
        if run.watches.contains_key(root) {
            return Ok(());
        }

        tokio::fs::create_dir_all(root).await?;
        let watch_path = tokio::fs::canonicalize(root).await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<Event>();
        let (error_tx, error_rx) = mpsc::unbounded_channel::<notify::Error>();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Receivers are gone once the drain task exits
            match res {
                Ok(event) => {
                    let _ = event_tx.send(event);
                }
                Err(e) => {
                    let _ = error_tx.send(e);
                }
            }
        })?;

        let watcher: SharedWatcher = Arc::new(StdMutex::new(watcher));
        let registered: RegisteredDirs = Arc::new(StdMutex::new(HashSet::new()));

        let count = {
            let (watcher, registered, watch_path) =
                (watcher.clone(), registered.clone(), watch_path.clone());
            tokio::task::spawn_blocking(move || {
                register_tree(&watcher, &registered, &watch_path, true)
            })
            .await
            .map_err(|e| WatchError::Io(std::io::Error::other(e)))??
            .0
        };
        info!("Watching {} ({} directories)", root.display(), count);

        let cancel = run.shutdown.child_token();
        let drain = tokio::spawn(drain_root(
            Arc::clone(&self.inner),
            root.to_path_buf(),
            event_rx,
            error_rx,
            cancel.clone(),
        ));

        self.spawn_initial_scan(watch_path.clone(), Arc::clone(&run.debouncer), cancel.clone());

        run.watches.insert(
            root.to_path_buf(),
            RootWatch {
                watch_path,
                watcher,
                registered,
                cancel,
                drain,
            },
        );
        Ok(())
    }

    /// Walk the tree once and debounce every candidate file found
    fn spawn_initial_scan(
        &self,
        root: PathBuf,
        debouncer: Arc<Debouncer>,
        cancel: CancellationToken,
    ) {
        let filter = self.inner.filter.clone();
        self.inner.tasks.spawn(async move {
            let scan_root = root.clone();
            let scan_cancel = cancel.clone();
            let files = tokio::task::spawn_blocking(move || {
                WalkDir::new(&scan_root)
                    .into_iter()
                    .filter_map(|entry| match entry {
                        Ok(entry) => Some(entry),
                        Err(e) => {
                            warn!("Skipping unreadable entry during scan: {}", e);
                            None
                        }
                    })
                    .take_while(|_| !scan_cancel.is_cancelled())
                    .filter(|entry| entry.file_type().is_file())
                    .map(|entry| entry.into_path())
                    .filter(|path| filter.is_candidate(path))
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap_or_default();

            if cancel.is_cancelled() {
                return;
            }
            info!(
                "Startup scan of {} queued {} files",
                root.display(),
                files.len()
            );
            for path in files {
                debouncer.trigger(path);
            }
        });
    }
}

impl ManagerInner {
    async fn handle_event(&self, root: &Path, event: Event) {
        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
                for path in event.paths {
                    self.handle_removal(root, &path).await;
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                let mut paths = event.paths.into_iter();
                if let Some(from) = paths.next() {
                    self.handle_removal(root, &from).await;
                }
                for path in paths {
                    self.handle_created(root, path).await;
                }
            }
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                for path in event.paths {
                    self.handle_created(root, path).await;
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(_) => {
                for path in event.paths {
                    self.dispatch_file(root, path).await;
                }
            }
            _ => debug!("Ignoring event kind: {:?}", event.kind),
        }
    }

    async fn handle_created(&self, root: &Path, path: PathBuf) {
        if path.is_dir() {
            self.register_new_directory(root, path).await;
        } else {
            self.dispatch_file(root, path).await;
        }
    }

    /// Filter a changed file and hand it to the debouncer
    async fn dispatch_file(&self, root: &Path, path: PathBuf) {
        if !self.filter.is_candidate(&path) || !path.is_file() {
            return;
        }

        let state = self.state.read().await;
        let Some(run) = state.run.as_ref().filter(|run| run.watches.contains_key(root)) else {
            return;
        };

        // Announce once per burst; later events in the window only reset the timer
        if !run.debouncer.is_pending(&path) {
            debug!("Detected change: {}", path.display());
            self.processor.broadcaster().broadcast_json(
                EventType::FileDetected,
                format!(
                    "Detected {}",
                    path.file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default()
                ),
                serde_json::json!({ "path": path.display().to_string(), "root": root.display().to_string() }),
            );
        }
        run.debouncer.trigger(path);
    }

    /// Register a directory created after startup, plus anything already inside it
    async fn register_new_directory(&self, root: &Path, dir: PathBuf) {
        let (watcher, registered) = {
            let state = self.state.read().await;
            match state.run.as_ref().and_then(|run| run.watches.get(root)) {
                Some(watch) => (watch.watcher.clone(), watch.registered.clone()),
                None => return,
            }
        };

        let walk_dir = dir.clone();
        let result = tokio::task::spawn_blocking(move || {
            register_tree(&watcher, &registered, &walk_dir, false)
        })
        .await;

        match result {
            Ok(Ok((count, files))) => {
                debug!(
                    "Registered {} new directories under {}",
                    count,
                    dir.display()
                );
                // Files may have landed before the watch was in place
                for file in files {
                    self.dispatch_file(root, file).await;
                }
            }
            Ok(Err(e)) => warn!("Failed to watch new directory {}: {}", dir.display(), e),
            Err(e) => warn!("Directory registration task failed: {}", e),
        }
    }

    async fn handle_removal(&self, root: &Path, path: &Path) {
        {
            let state = self.state.read().await;
            let Some(run) = state.run.as_ref() else {
                return;
            };
            run.debouncer.cancel(path);
            if let Some(watch) = run.watches.get(root) {
                let mut registered = watch
                    .registered
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                // The OS drops watches on deleted directories by itself
                registered.retain(|dir| !dir.starts_with(path));
            }
        }

        // Editors that replace files via delete + recreate must not lose their record
        if !self.filter.is_supported_file(path) || path.exists() {
            return;
        }
        match self.processor.engine().store().delete(path) {
            Ok(true) => info!("Untracked removed file {}", path.display()),
            Ok(false) => {}
            Err(e) => warn!("Failed to untrack {}: {}", path.display(), e),
        }
    }
}

/// Drain one root's native event stream until cancelled
async fn drain_root(
    inner: Arc<ManagerInner>,
    root: PathBuf,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut errors: mpsc::UnboundedReceiver<notify::Error>,
    cancel: CancellationToken,
) {
    debug!("Event drain for {} started", root.display());
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(event) = events.recv() => inner.handle_event(&root, event).await,
            Some(e) = errors.recv() => warn!("Watcher error under {}: {}", root.display(), e),
            else => break,
        }
    }
    debug!("Event drain for {} stopped", root.display());
}

/// Drop debounce timers for files under a root that is going away
fn forget_pending(run: &RunState, watch: &RootWatch) {
    let dropped = run.debouncer.cancel_under(&watch.watch_path);
    if dropped > 0 {
        debug!(
            "Dropped {} pending files under {}",
            dropped,
            watch.watch_path.display()
        );
    }
}

/// Cancel a root's drain task, drop its native watcher and wait for the task
async fn deactivate(watch: RootWatch) {
    let RootWatch {
        watch_path,
        watcher,
        cancel,
        drain,
        ..
    } = watch;

    cancel.cancel();
    drop(watcher);
    if let Err(e) = drain.await {
        warn!("Drain task for {} ended abnormally: {}", watch_path.display(), e);
    }
    debug!("Stopped watching {}", watch_path.display());
}

/// Register `dir` and every directory beneath it non-recursively.
///
/// Returns the number of newly registered directories and, for directories
/// discovered at runtime, the regular files already inside them. On initial
/// registration a failure on `dir` itself is an error; failures below it are
/// always logged and skipped.
fn register_tree(
    watcher: &SharedWatcher,
    registered: &RegisteredDirs,
    dir: &Path,
    initial: bool,
) -> Result<(usize, Vec<PathBuf>), WatchError> {
    let mut watcher = watcher
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut registered = registered
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    let mut count = 0;
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable path under {}: {}", dir.display(), e);
                continue;
            }
        };

        if entry.file_type().is_file() {
            if !initial {
                files.push(entry.into_path());
            }
            continue;
        }
        if !entry.file_type().is_dir() || registered.contains(entry.path()) {
            continue;
        }

        match watcher.watch(entry.path(), RecursiveMode::NonRecursive) {
            Ok(()) => {
                registered.insert(entry.path().to_path_buf());
                count += 1;
            }
            Err(e) if initial && entry.depth() == 0 => return Err(e.into()),
            Err(e) => warn!("Failed to watch {}: {}", entry.path().display(), e),
        }
    }

    Ok((count, files))
}

/// Resolve `path` against the current directory without touching the filesystem
fn absolute(path: &Path) -> Result<PathBuf, WatchError> {
    Ok(std::path::absolute(path)?)
}

fn roots_from(roots: &[PathBuf], disabled: &[PathBuf]) -> Vec<WatchRoot> {
    let disabled: Vec<PathBuf> = disabled
        .iter()
        .filter_map(|path| absolute(path).ok())
        .collect();

    let mut result: Vec<WatchRoot> = roots
        .iter()
        .filter_map(|path| absolute(path).ok())
        .map(|path| {
            let enabled = !disabled.contains(&path);
            WatchRoot { path, enabled }
        })
        .collect();

    // Disabled roots stay known even when missing from the active list
    for path in disabled {
        if !result.iter().any(|root| root.path == path) {
            result.push(WatchRoot::disabled(path));
        }
    }

    dedup_roots(result)
}

fn dedup_roots(roots: Vec<WatchRoot>) -> Vec<WatchRoot> {
    let mut seen = HashSet::new();
    roots
        .into_iter()
        .filter_map(|root| {
            let path = absolute(&root.path).ok()?;
            seen.insert(path.clone()).then_some(WatchRoot {
                path,
                enabled: root.enabled,
            })
        })
        .collect()
}
