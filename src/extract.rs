//! Text extraction boundary
//!
//! Format readers (PDF, DOCX, spreadsheets, ...) live outside this crate and
//! plug in through `TextExtractor`. The registry picks one by file extension;
//! the only reader built in here is for formats that already are text.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::error::ExtractError;

/// Pulls the textual content out of a file.
///
/// Must return an error when the content cannot be parsed, and empty text only
/// when the source genuinely has no textual content.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String, ExtractError>;
}

pub const PLAIN_TEXT_EXTENSIONS: &[&str] = &[
    "txt", "text", "md", "markdown", "rst", "log", "csv", "tsv", "json", "xml", "yaml", "yml",
    "toml",
];

/// Reads UTF-8 text files as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path) -> Result<String, ExtractError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ExtractError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let text = String::from_utf8(bytes)
            .map_err(|_| ExtractError::InvalidEncoding(path.to_path_buf()))?;

        Ok(match text.strip_prefix('\u{feff}') {
            Some(stripped) => stripped.to_string(),
            None => text,
        })
    }
}

/// Extension → extractor lookup. Keys are lowercase, without the dot.
#[derive(Clone, Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `PlainTextExtractor` bound to every plain-text extension
    pub fn with_plain_text() -> Self {
        let mut registry = Self::new();
        let plain: Arc<dyn TextExtractor> = Arc::new(PlainTextExtractor);
        for ext in PLAIN_TEXT_EXTENSIONS {
            registry.register(ext, plain.clone());
        }
        registry
    }

    pub fn register(&mut self, extension: &str, extractor: Arc<dyn TextExtractor>) {
        self.extractors
            .insert(extension.trim_start_matches('.').to_lowercase(), extractor);
    }

    pub fn supports(&self, path: &Path) -> bool {
        extension_of(path).is_some_and(|ext| self.extractors.contains_key(&ext))
    }

    /// Sorted list of registered extensions
    pub fn extensions(&self) -> Vec<String> {
        let mut extensions: Vec<String> = self.extractors.keys().cloned().collect();
        extensions.sort();
        extensions
    }
}

#[async_trait]
impl TextExtractor for ExtractorRegistry {
    async fn extract(&self, path: &Path) -> Result<String, ExtractError> {
        let extractor = extension_of(path)
            .and_then(|ext| self.extractors.get(&ext))
            .ok_or_else(|| ExtractError::Unsupported(path.to_path_buf()))?;

        debug!("Extracting text from {}", path.display());
        extractor.extract(path).await
    }
}

/// Lowercased extension of `path`, if it has one
pub fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}
