//! Error types for the watch-decide-ingest pipeline
//!
//! Each stage owns its error enum so the pipeline can map failures onto the
//! delivery status it records (extraction → `failed`, chunking → `chunk_failed`,
//! and so on). Application glue in the binary uses `anyhow` instead.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown delivery status: {0}")]
    InvalidStatus(String),

    #[error("Path is not valid UTF-8: {}", .0.display())]
    NonUtf8Path(PathBuf),

    #[error("Unknown schema migration version: {0}")]
    UnknownMigration(i32),

    #[error("Change store has been closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("No extractor registered for {0}")]
    Unsupported(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not valid UTF-8 text")]
    InvalidEncoding(PathBuf),

    #[error("Extraction failed: {0}")]
    Other(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("Chunk size must be greater than zero")]
    ZeroSize,

    #[error("Chunk overlap ({overlap}) must be smaller than chunk size ({size})")]
    OverlapTooLarge { size: usize, overlap: usize },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Ingestion service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Delivery deadline elapsed")]
    DeadlineElapsed,
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Path is not a configured root: {0}")]
    UnknownRoot(PathBuf),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
