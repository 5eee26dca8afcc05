//! Per-path event debouncing
//!
//! Every `trigger` for a path (re)starts that path's quiet-period timer; the
//! shared callback fires once the path has been quiet for the whole period.
//! Timers are tokio tasks, so the callback runs outside the debouncer lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_millis(500);

pub type DebounceCallback = Arc<dyn Fn(PathBuf) + Send + Sync>;

/// Pending timer for one path
struct DebounceEntry {
    generation: u64,
    handle: JoinHandle<()>,
}

pub struct Debouncer {
    quiet_period: Duration,
    callback: DebounceCallback,
    pending: Arc<Mutex<HashMap<PathBuf, DebounceEntry>>>,
    next_generation: AtomicU64,
    stopped: AtomicBool,
}

impl Debouncer {
    pub fn new(quiet_period: Duration, callback: DebounceCallback) -> Self {
        Self {
            quiet_period,
            callback,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Schedule the callback for `key`, replacing any timer already pending for it.
    ///
    /// Must be called from within a tokio runtime. Ignored after `stop_all`.
    pub fn trigger(&self, key: PathBuf) {
        if self.stopped.load(Ordering::Acquire) {
            trace!("Debouncer stopped, ignoring {}", key.display());
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let callback = Arc::clone(&self.callback);
        let quiet_period = self.quiet_period;
        let timer_key = key.clone();

        let mut entries = lock(&self.pending);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(quiet_period).await;

            // A newer trigger may have replaced us after the sleep finished
            let fire = {
                let mut entries = lock(&pending);
                match entries.get(&timer_key) {
                    Some(entry) if entry.generation == generation => {
                        entries.remove(&timer_key);
                        true
                    }
                    _ => false,
                }
            };

            if fire {
                trace!("Debounce fired for {}", timer_key.display());
                callback(timer_key);
            }
        });

        if let Some(previous) = entries.insert(key, DebounceEntry { generation, handle }) {
            previous.handle.abort();
        }
    }

    /// Drop the pending timer for `key` without firing. Returns true if one was pending.
    pub fn cancel(&self, key: &Path) -> bool {
        match lock(&self.pending).remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Drop every pending timer for a key under `prefix`. Returns how many were dropped.
    pub fn cancel_under(&self, prefix: &Path) -> usize {
        let mut entries = lock(&self.pending);
        let before = entries.len();
        entries.retain(|key, entry| {
            let keep = !key.starts_with(prefix);
            if !keep {
                entry.handle.abort();
            }
            keep
        });
        before - entries.len()
    }

    /// Cancel every pending timer and refuse further triggers
    pub fn stop_all(&self) {
        self.stopped.store(true, Ordering::Release);
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        if !drained.is_empty() {
            debug!("Debouncer dropped {} pending timers", drained.len());
        }
        for (_, entry) in drained {
            entry.handle.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_pending(&self, key: &Path) -> bool {
        lock(&self.pending).contains_key(key)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn lock(
    pending: &Mutex<HashMap<PathBuf, DebounceEntry>>,
) -> MutexGuard<'_, HashMap<PathBuf, DebounceEntry>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
