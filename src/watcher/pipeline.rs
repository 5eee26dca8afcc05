//! Per-file processing: decide → extract → chunk → deliver → record
//!
//! Runs once per debounce fire. Stages are strictly sequential for a file and
//! the change store is only written once the outcome is known, so concurrent
//! readers see the previous completed state until then.

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, info, warn};

use crate::chunker::TextChunker;
use crate::decision::{DecisionEngine, FileDecision};
use crate::events::{EventBroadcaster, EventType};
use crate::extract::{TextExtractor, extension_of};
use crate::ingest::{ChunkMetadata, IngestionClient, document_id};
use crate::store::DeliveryStatus;

/// How a single processing attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Nothing to do; the store was not written
    Skipped { reason: String },
    /// The attempt finished and was recorded with this status
    Recorded(DeliveryStatus),
    /// Hashing or the store failed; the file is left unrecorded
    Unrecorded { error: String },
}

pub struct FileProcessor {
    engine: DecisionEngine,
    extractor: Arc<dyn TextExtractor>,
    chunker: TextChunker,
    client: Option<Arc<dyn IngestionClient>>,
    broadcaster: Arc<EventBroadcaster>,
    delivery_timeout: Duration,
    client_id: String,
}

impl FileProcessor {
    pub fn new(
        engine: DecisionEngine,
        extractor: Arc<dyn TextExtractor>,
        chunker: TextChunker,
        client: Option<Arc<dyn IngestionClient>>,
        broadcaster: Arc<EventBroadcaster>,
        delivery_timeout: Duration,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            extractor,
            chunker,
            client,
            broadcaster,
            delivery_timeout,
            client_id: client_id.into(),
        }
    }

    pub fn engine(&self) -> &DecisionEngine {
        &self.engine
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.broadcaster
    }

    pub fn client(&self) -> Option<&Arc<dyn IngestionClient>> {
        self.client.as_ref()
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    pub async fn process(&self, path: PathBuf) -> ProcessOutcome {
        let decision = match self.engine.decide(&path).await {
            Ok(decision) => decision,
            Err(e) => {
                error!("Change detection failed for {}: {}", path.display(), e);
                self.broadcaster.broadcast_json(
                    EventType::FileError,
                    format!("Change detection failed: {}", file_name(&path)),
                    json!({ "path": path.display().to_string(), "error": e.to_string() }),
                );
                return ProcessOutcome::Unrecorded {
                    error: e.to_string(),
                };
            }
        };

        if !decision.should_process {
            debug!("Skipping {}: {}", path.display(), decision.reason);
            self.broadcaster.broadcast_json(
                EventType::FileSkipped,
                format!("Skipped {}: {}", file_name(&path), decision.reason),
                json!({
                    "path": path.display().to_string(),
                    "classification": decision.classification,
                    "reason": decision.reason,
                }),
            );
            return ProcessOutcome::Skipped {
                reason: decision.reason,
            };
        }

        info!(
            "Processing {} ({})",
            path.display(),
            decision.classification
        );
        self.broadcaster.broadcast_json(
            EventType::FileProcessing,
            format!("Processing {}", file_name(&path)),
            json!({
                "path": path.display().to_string(),
                "classification": decision.classification,
                "hash": decision.hash,
            }),
        );

        let text = match self.extractor.extract(&path).await {
            Ok(text) => text,
            Err(e) => {
                warn!("Extraction failed for {}: {}", path.display(), e);
                return self.finish(
                    &decision,
                    DeliveryStatus::Failed,
                    Some((
                        EventType::FileError,
                        format!("Extraction failed: {}", file_name(&path)),
                        json!({ "path": path.display().to_string(), "status": DeliveryStatus::Failed, "error": e.to_string() }),
                    )),
                );
            }
        };

        if text.trim().is_empty() {
            debug!("No text content in {}", path.display());
            return self.finish(&decision, DeliveryStatus::NoContent, None);
        }

        let chunks = match self.chunker.chunk_text(&text) {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("Chunking failed for {}: {}", path.display(), e);
                return self.finish(
                    &decision,
                    DeliveryStatus::ChunkFailed,
                    Some((
                        EventType::FileError,
                        format!("Chunking failed: {}", file_name(&path)),
                        json!({ "path": path.display().to_string(), "status": DeliveryStatus::ChunkFailed, "error": e.to_string() }),
                    )),
                );
            }
        };

        let Some(client) = self.client.as_ref() else {
            info!(
                "No ingestion server configured, {} chunks of {} not sent",
                chunks.len(),
                path.display()
            );
            return self.finish(
                &decision,
                DeliveryStatus::NoServer,
                Some((
                    EventType::FileError,
                    format!("No ingestion server configured: {}", file_name(&path)),
                    json!({ "path": path.display().to_string(), "status": DeliveryStatus::NoServer, "chunks": chunks.len() }),
                )),
            );
        };

        let succeeded = self.deliver(client.as_ref(), &decision, &chunks).await;
        let status = DeliveryStatus::from_delivery(succeeded, chunks.len());
        let payload = json!({
            "path": path.display().to_string(),
            "status": status,
            "chunks": chunks.len(),
            "delivered": succeeded,
            "classification": decision.classification,
        });

        let event = match status {
            DeliveryStatus::Failed => (
                EventType::FileError,
                format!("Delivery failed: {}", file_name(&path)),
                payload,
            ),
            _ => (
                EventType::FileComplete,
                format!(
                    "Ingested {} ({}/{} chunks)",
                    file_name(&path),
                    succeeded,
                    chunks.len()
                ),
                payload,
            ),
        };

        self.finish(&decision, status, Some(event))
    }

    /// Send chunks one at a time under a single deadline for the whole file.
    /// Returns the number of chunks the service accepted.
    async fn deliver(
        &self,
        client: &dyn IngestionClient,
        decision: &FileDecision,
        chunks: &[String],
    ) -> usize {
        let deadline = Instant::now() + self.delivery_timeout;
        let doc_id = document_id(&decision.path);
        let metadata = ChunkMetadata {
            filename: file_name(&decision.path),
            path: decision.path.to_string_lossy().into_owned(),
            extension: extension_of(&decision.path).unwrap_or_default(),
            hash: decision.hash.clone(),
            change_type: decision.classification.to_string(),
            client_id: self.client_id.clone(),
            chunk_count: chunks.len(),
        };

        let mut succeeded = 0;
        for (index, chunk) in chunks.iter().enumerate() {
            if Instant::now() >= deadline {
                warn!(
                    "Delivery deadline reached for {}, {} chunks not sent",
                    decision.path.display(),
                    chunks.len() - index
                );
                break;
            }

            match timeout_at(
                deadline,
                client.ingest_chunk(deadline, &doc_id, chunk, index, &metadata),
            )
            .await
            {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err(e)) => warn!(
                    "Chunk {}/{} of {} failed: {}",
                    index + 1,
                    chunks.len(),
                    decision.path.display(),
                    e
                ),
                Err(_) => warn!(
                    "Chunk {}/{} of {} timed out",
                    index + 1,
                    chunks.len(),
                    decision.path.display()
                ),
            }
        }

        debug!(
            "Delivered {}/{} chunks of {}",
            succeeded,
            chunks.len(),
            decision.path.display()
        );
        succeeded
    }

    /// Record the outcome, then announce it. A store failure replaces the
    /// announcement with a `file_error` and leaves the file unrecorded.
    fn finish(
        &self,
        decision: &FileDecision,
        status: DeliveryStatus,
        event: Option<(EventType, String, serde_json::Value)>,
    ) -> ProcessOutcome {
        if let Err(e) = self.engine.mark_processed(decision, status) {
            error!(
                "Failed to record {} for {}: {}",
                status,
                decision.path.display(),
                e
            );
            self.broadcaster.broadcast_json(
                EventType::FileError,
                format!("Failed to record result: {}", file_name(&decision.path)),
                json!({ "path": decision.path.display().to_string(), "status": status, "error": e.to_string() }),
            );
            return ProcessOutcome::Unrecorded {
                error: e.to_string(),
            };
        }

        if let Some((kind, message, payload)) = event {
            self.broadcaster.broadcast_json(kind, message, payload);
        }

        info!("Recorded {} as {}", decision.path.display(), status);
        ProcessOutcome::Recorded(status)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
