//! Ingestion client boundary
//!
//! The remote service receives one call per chunk. `HttpIngestionClient` is
//! the production implementation; tests plug in recording doubles.

mod http;

pub use http::HttpIngestionClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::IngestError;

/// Per-chunk metadata sent alongside the text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub filename: String,
    pub path: String,
    pub extension: String,
    pub hash: String,
    pub change_type: String,
    pub client_id: String,
    pub chunk_count: usize,
}

#[async_trait]
pub trait IngestionClient: Send + Sync {
    /// Deliver one chunk. Implementations must give up once `deadline` passes.
    async fn ingest_chunk(
        &self,
        deadline: Instant,
        document_id: &str,
        chunk_text: &str,
        chunk_index: usize,
        metadata: &ChunkMetadata,
    ) -> Result<(), IngestError>;

    /// Reachability as observed by this client, for clients that track it
    fn server_status(&self) -> Option<&ServerStatus> {
        None
    }

    /// Check the service once. Clients without a health endpoint report healthy.
    async fn check_health(&self) -> bool {
        true
    }
}

/// Stable document identifier for a path: hex SHA-256 of the path string,
/// so an updated file replaces the same logical document upstream.
pub fn document_id(path: &Path) -> String {
    hex::encode(Sha256::digest(path.to_string_lossy().as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
    Unknown,
    Connected,
    Disconnected,
}

/// Last known reachability of the ingestion service, observable by the control plane
#[derive(Debug, Clone)]
pub struct ServerStatus {
    tx: watch::Sender<Connectivity>,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStatus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Connectivity::Unknown);
        Self { tx }
    }

    pub fn get(&self) -> Connectivity {
        *self.tx.borrow()
    }

    pub fn set(&self, connectivity: Connectivity) {
        self.tx.send_if_modified(|current| {
            if *current == connectivity {
                false
            } else {
                *current = connectivity;
                true
            }
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.tx.subscribe()
    }
}
