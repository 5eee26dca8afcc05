//! Sliding-window text chunker
//!
//! Splits extracted text into fixed-size windows that overlap by a fixed
//! number of characters, so context across a boundary survives into both
//! neighbouring chunks. Sizes are measured in characters, not bytes.

use crate::error::ChunkError;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextChunker {
    pub size: usize,
    pub overlap: usize,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self {
            size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

impl TextChunker {
    pub fn new(size: usize, overlap: usize) -> Self {
        Self { size, overlap }
    }

    pub fn validate(&self) -> Result<(), ChunkError> {
        if self.size == 0 {
            return Err(ChunkError::ZeroSize);
        }
        if self.overlap >= self.size {
            return Err(ChunkError::OverlapTooLarge {
                size: self.size,
                overlap: self.overlap,
            });
        }
        Ok(())
    }

    /// Distance between the starts of consecutive windows
    pub fn step(&self) -> usize {
        self.size.saturating_sub(self.overlap)
    }

    /// Number of chunks `chunk_text` yields for text of `len` characters
    pub fn expected_chunks(&self, len: usize) -> usize {
        if len == 0 {
            0
        } else if len <= self.size {
            1
        } else {
            (len - self.overlap).div_ceil(self.step())
        }
    }

    /// Split `text` into trimmed, overlapping windows.
    ///
    /// Windows start at `0, step, 2*step, ...`; the last one is clipped to the
    /// end of the text. Empty input yields no chunks.
    pub fn chunk_text(&self, text: &str) -> Result<Vec<String>, ChunkError> {
        self.validate()?;

        // Byte offset of every char boundary, including the end of the string
        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(offset, _)| offset)
            .chain(std::iter::once(text.len()))
            .collect();
        let len = boundaries.len() - 1;

        let mut chunks = Vec::with_capacity(self.expected_chunks(len));
        if len == 0 {
            return Ok(chunks);
        }

        let mut start = 0;
        loop {
            let end = (start + self.size).min(len);
            chunks.push(text[boundaries[start]..boundaries[end]].trim().to_string());
            if end == len {
                break;
            }
            start += self.step();
        }

        Ok(chunks)
    }
}

/// Chunk `text` with the default 1000/200 window
pub fn chunk_text(text: &str) -> Result<Vec<String>, ChunkError> {
    TextChunker::default().chunk_text(text)
}
