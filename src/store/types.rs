// Change store type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// Terminal outcome of the last completed processing attempt for a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Partial,
    Failed,
    NoContent,
    ChunkFailed,
    NoServer,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 7] = [
        DeliveryStatus::Pending,
        DeliveryStatus::Success,
        DeliveryStatus::Partial,
        DeliveryStatus::Failed,
        DeliveryStatus::NoContent,
        DeliveryStatus::ChunkFailed,
        DeliveryStatus::NoServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Partial => "partial",
            DeliveryStatus::Failed => "failed",
            DeliveryStatus::NoContent => "no_content",
            DeliveryStatus::ChunkFailed => "chunk_failed",
            DeliveryStatus::NoServer => "no_server",
        }
    }

    /// Status for a file whose `succeeded` out of `total` chunks were delivered
    pub fn from_delivery(succeeded: usize, total: usize) -> Self {
        if succeeded == 0 {
            DeliveryStatus::Failed
        } else if succeeded >= total {
            DeliveryStatus::Success
        } else {
            DeliveryStatus::Partial
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeliveryStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| StoreError::InvalidStatus(s.to_string()))
    }
}

/// Persisted record of the last completed decision/ingestion for a path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub path: String,
    /// Hex-encoded SHA-256 of the file bytes
    pub hash: String,
    pub last_processed: DateTime<Utc>,
    pub status: DeliveryStatus,
}
