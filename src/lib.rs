// Ingest Agent - Document Watching & Ingestion Library
//!
//! Watches directory trees, detects new or changed documents by content hash,
//! and streams their extracted text in overlapping chunks to a remote
//! ingestion service.

pub mod chunker;
pub mod config;
pub mod debounce;
pub mod decision;
pub mod error;
pub mod events;
pub mod extract;
pub mod ingest;
pub mod store;
pub mod watcher;

#[cfg(test)]
pub mod tests;

// Re-export common types
pub use config::AgentConfig;
pub use decision::{Classification, DecisionEngine, FileDecision};
pub use events::{Event, EventBroadcaster, EventType, Subscription};
pub use store::{ChangeStore, DeliveryStatus, TrackedFile};
pub use watcher::{WatchManager, WatchRoot, WatchStatus};
