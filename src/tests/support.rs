//! Shared test doubles and helpers

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

use crate::chunker::TextChunker;
use crate::decision::DecisionEngine;
use crate::error::{ExtractError, IngestError};
use crate::events::{Event, EventBroadcaster, EventType, Subscription};
use crate::extract::{ExtractorRegistry, TextExtractor};
use crate::ingest::{ChunkMetadata, IngestionClient};
use crate::store::ChangeStore;
use crate::watcher::FileProcessor;

/// Upper bound for anything a test waits on
pub const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RecordedChunk {
    pub document_id: String,
    pub chunk_text: String,
    pub chunk_index: usize,
    pub metadata: ChunkMetadata,
}

/// Ingestion client that records every call and fails selected chunk indexes
#[derive(Default)]
pub struct RecordingClient {
    calls: Mutex<Vec<RecordedChunk>>,
    fail_indexes: HashSet<usize>,
    fail_all: bool,
    delay: Option<Duration>,
}

impl RecordingClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(indexes: &[usize]) -> Self {
        Self {
            fail_indexes: indexes.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_all: true,
            ..Self::default()
        }
    }

    /// Every call sleeps this long before answering
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<RecordedChunk> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl IngestionClient for RecordingClient {
    async fn ingest_chunk(
        &self,
        _deadline: Instant,
        document_id: &str,
        chunk_text: &str,
        chunk_index: usize,
        metadata: &ChunkMetadata,
    ) -> Result<(), IngestError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.calls.lock().unwrap().push(RecordedChunk {
            document_id: document_id.to_string(),
            chunk_text: chunk_text.to_string(),
            chunk_index,
            metadata: metadata.clone(),
        });

        if self.fail_all || self.fail_indexes.contains(&chunk_index) {
            return Err(IngestError::Status {
                status: 500,
                body: "boom".to_string(),
            });
        }
        Ok(())
    }
}

/// Extractor that always fails, as a parser would on a corrupt document
pub struct BrokenExtractor;

#[async_trait]
impl TextExtractor for BrokenExtractor {
    async fn extract(&self, _path: &Path) -> Result<String, ExtractError> {
        Err(ExtractError::Other("corrupt document".to_string()))
    }
}

/// Processor over plain-text extraction with the default chunker
pub fn processor(
    store: Arc<ChangeStore>,
    client: Option<Arc<dyn IngestionClient>>,
    broadcaster: Arc<EventBroadcaster>,
) -> FileProcessor {
    processor_with(
        store,
        Arc::new(ExtractorRegistry::with_plain_text()),
        TextChunker::default(),
        client,
        broadcaster,
        Duration::from_secs(30),
    )
}

pub fn processor_with(
    store: Arc<ChangeStore>,
    extractor: Arc<dyn TextExtractor>,
    chunker: TextChunker,
    client: Option<Arc<dyn IngestionClient>>,
    broadcaster: Arc<EventBroadcaster>,
    delivery_timeout: Duration,
) -> FileProcessor {
    FileProcessor::new(
        DecisionEngine::new(store),
        extractor,
        chunker,
        client,
        broadcaster,
        delivery_timeout,
        "test-client",
    )
}

/// Roomy broadcaster so bursts in tests never hit the drop path
pub fn broadcaster() -> Arc<EventBroadcaster> {
    Arc::new(EventBroadcaster::new(256))
}

/// Everything queued on `subscription` right now
pub fn drain(subscription: &mut Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    while let Some(event) = subscription.try_recv() {
        events.push(event);
    }
    events
}

pub fn kinds(events: &[Event]) -> Vec<EventType> {
    events.iter().map(|event| event.kind).collect()
}

/// Receive until an event of `kind` for `path` arrives, returning everything seen
pub async fn wait_for(
    subscription: &mut Subscription,
    kind: EventType,
    path: &Path,
) -> Vec<Event> {
    let wanted = path.display().to_string();
    let mut seen = Vec::new();
    let deadline = Instant::now() + WAIT;

    loop {
        let event = tokio::time::timeout_at(deadline, subscription.recv())
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "timed out waiting for {} on {}; saw {:?}",
                    kind,
                    wanted,
                    kinds(&seen)
                )
            })
            .expect("broadcaster dropped");

        let matches = event.kind == kind && event.payload["path"] == wanted.as_str();
        seen.push(event);
        if matches {
            return seen;
        }
    }
}

/// Poll `check` until it holds or the wait budget runs out
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

/// Canonical form of a temp dir, matching the paths the watcher reports
pub fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap()
}

/// `len` characters of varied ASCII text
pub fn text_of_len(len: usize) -> String {
    "abcdefghijklmnopqrstuvwxyz0123456789"
        .chars()
        .cycle()
        .take(len)
        .collect()
}
