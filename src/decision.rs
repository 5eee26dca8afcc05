//! Content-hash change detection
//!
//! A file is identified by the SHA-256 of its bytes, not by mtime or size, so
//! touching a file or restoring it from backup does not cause re-ingestion.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{DecisionError, StoreError};
use crate::store::{ChangeStore, DeliveryStatus};

const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Update,
    Unchanged,
    /// Zero-length file; never hashed or looked up
    Empty,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::New => "new",
            Classification::Update => "update",
            Classification::Unchanged => "unchanged",
            Classification::Empty => "empty",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one `decide` call; input to `mark_processed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDecision {
    pub path: PathBuf,
    /// Hex SHA-256 of the file, empty for `Classification::Empty`
    pub hash: String,
    pub classification: Classification,
    pub should_process: bool,
    pub reason: String,
}

#[derive(Clone)]
pub struct DecisionEngine {
    store: Arc<ChangeStore>,
}

impl DecisionEngine {
    pub fn new(store: Arc<ChangeStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ChangeStore> {
        &self.store
    }

    /// Classify `path` against its stored record. Does not write to the store.
    pub async fn decide(&self, path: &Path) -> Result<FileDecision, DecisionError> {
        let metadata = tokio::fs::metadata(path).await.map_err(|source| DecisionError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if metadata.len() == 0 {
            return Ok(FileDecision {
                path: path.to_path_buf(),
                hash: String::new(),
                classification: Classification::Empty,
                should_process: false,
                reason: "empty file".to_string(),
            });
        }

        let hash = hash_file(path).await.map_err(|source| DecisionError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let (classification, should_process, reason) = match self.store.get(path)? {
            None => (Classification::New, true, "new file".to_string()),
            Some(record) if record.hash != hash => (
                Classification::Update,
                true,
                format!("content changed since last {} attempt", record.status),
            ),
            Some(record) => (
                Classification::Unchanged,
                false,
                format!("content unchanged (last status: {})", record.status),
            ),
        };

        debug!(
            "Decision for {}: {} ({})",
            path.display(),
            classification,
            reason
        );

        Ok(FileDecision {
            path: path.to_path_buf(),
            hash,
            classification,
            should_process,
            reason,
        })
    }

    /// Persist the outcome of a completed processing attempt
    pub fn mark_processed(
        &self,
        decision: &FileDecision,
        status: DeliveryStatus,
    ) -> Result<(), StoreError> {
        self.store.upsert(&decision.path, &decision.hash, status)
    }
}

/// Stream `path` through SHA-256 and return the hex digest
pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}
