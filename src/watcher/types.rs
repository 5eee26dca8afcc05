//! Type definitions for watch roots and manager status

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ingest::Connectivity;

/// A configured top-level directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRoot {
    pub path: PathBuf,
    pub enabled: bool,
}

impl WatchRoot {
    pub fn enabled(path: PathBuf) -> Self {
        Self {
            path,
            enabled: true,
        }
    }

    pub fn disabled(path: PathBuf) -> Self {
        Self {
            path,
            enabled: false,
        }
    }
}

/// Point-in-time snapshot for the control plane
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatus {
    pub running: bool,
    /// Roots with a live native watcher, sorted
    pub active_roots: Vec<PathBuf>,
    /// Every known root, in configuration order
    pub roots: Vec<WatchRoot>,
    /// False when running in watch-only mode
    pub ingestion_enabled: bool,
    /// Last observed reachability of the ingestion service, when tracked
    pub server: Option<Connectivity>,
}
