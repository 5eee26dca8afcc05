// HTTP ingestion client

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{ChunkMetadata, Connectivity, IngestionClient, ServerStatus};
use crate::error::IngestError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct IngestRequest<'a> {
    document_id: &'a str,
    chunk_text: &'a str,
    chunk_index: usize,
    metadata: &'a ChunkMetadata,
}

/// POSTs each chunk as JSON to `<base_url>/ingest`
#[derive(Debug, Clone)]
pub struct HttpIngestionClient {
    client: reqwest::Client,
    base_url: String,
    status: ServerStatus,
}

impl HttpIngestionClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("ingest-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            status: ServerStatus::new(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Connectivity as observed by the most recent request
    pub fn status(&self) -> &ServerStatus {
        &self.status
    }
}

#[async_trait]
impl IngestionClient for HttpIngestionClient {
    async fn ingest_chunk(
        &self,
        deadline: Instant,
        document_id: &str,
        chunk_text: &str,
        chunk_index: usize,
        metadata: &ChunkMetadata,
    ) -> Result<(), IngestError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(IngestError::DeadlineElapsed);
        }

        let request = IngestRequest {
            document_id,
            chunk_text,
            chunk_index,
            metadata,
        };

        let response = match self
            .client
            .post(format!("{}/ingest", self.base_url))
            .timeout(remaining)
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                if e.is_connect() {
                    self.status.set(Connectivity::Disconnected);
                }
                if e.is_timeout() {
                    return Err(IngestError::DeadlineElapsed);
                }
                return Err(e.into());
            }
        };

        self.status.set(Connectivity::Connected);

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(
                "Ingestion of chunk {} for {} rejected: HTTP {}",
                chunk_index, metadata.filename, status
            );
            return Err(IngestError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }

    fn server_status(&self) -> Option<&ServerStatus> {
        Some(&self.status)
    }

    /// GET `<base_url>/health` and record the result
    async fn check_health(&self) -> bool {
        let healthy = match self
            .client
            .get(format!("{}/health", self.base_url))
            .timeout(CONNECT_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check against {} failed: {}", self.base_url, e);
                false
            }
        };

        self.status.set(if healthy {
            Connectivity::Connected
        } else {
            Connectivity::Disconnected
        });
        healthy
    }
}
