//! Document processing: extraction and chunking.
//!
//! Turns heterogeneous uploads into chunk drafts ready for embedding.
//! PDFs are extracted page by page, text is decoded strictly, and
//! audio/video is transcribed through the gateway before chunking. The
//! splitter is recursive: paragraph boundaries first, then lines,
//! sentences, and words, with sizes measured in tokens and a configured
//! overlap carried between neighboring chunks.

use crate::config::ChunkingConfig;
use crate::error::ProcessingError;
use crate::gateway::ModelGateway;
use crate::tokens::TokenCounter;
use crate::types::{ChunkDraft, ChunkMetadata, ContentType};
use std::sync::Arc;
use tracing::{debug, info};

/// Boundary preference for the recursive splitter, coarsest first.
const SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

/// A contiguous run of extracted text plus its page of origin.
struct Section {
    text: String,
    page_index: Option<usize>,
}

/// MIME-dispatched extraction and token-bounded chunking.
pub struct DocumentProcessor {
    counter: Arc<TokenCounter>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentProcessor {
    pub fn new(counter: Arc<TokenCounter>, config: &ChunkingConfig) -> Self {
        let chunk_size = config.chunk_size.max(1);
        Self {
            counter,
            chunk_size,
            chunk_overlap: config.chunk_overlap.min(chunk_size / 2),
        }
    }

    /// Process raw upload bytes into chunk drafts.
    ///
    /// Dispatches on the declared type; audio and video are transcribed
    /// through the gateway first. Returns `EmptyCorpus` when nothing
    /// non-trivial was extracted.
    pub async fn process(
        &self,
        gateway: &ModelGateway,
        bytes: Vec<u8>,
        declared_type: ContentType,
        filename: &str,
        title: &str,
        tenant_id: &str,
    ) -> Result<Vec<ChunkDraft>, ProcessingError> {
        let sections = match declared_type {
            ContentType::Pdf => self.extract_pdf(&bytes)?,
            ContentType::Text => self.extract_text(&bytes)?,
            ContentType::Audio | ContentType::Video => {
                let transcript = gateway.transcribe(bytes, filename).await?;
                info!(
                    filename,
                    transcript_chars = transcript.len(),
                    "Transcription complete"
                );
                vec![Section {
                    text: transcript,
                    page_index: None,
                }]
            }
        };

        let mut drafts = Vec::new();
        let mut chunk_index = 0usize;
        for section in &sections {
            for piece in self.chunk_text(&section.text) {
                drafts.push(ChunkDraft {
                    text: piece,
                    metadata: ChunkMetadata {
                        source: filename.to_string(),
                        title: title.to_string(),
                        content_type: declared_type,
                        chunk_index,
                        tenant_id: tenant_id.to_string(),
                        page_index: section.page_index,
                    },
                });
                chunk_index += 1;
            }
        }

        if drafts.is_empty() {
            return Err(ProcessingError::EmptyCorpus);
        }
        debug!(filename, chunks = drafts.len(), "Document processed");
        Ok(drafts)
    }

    fn extract_pdf(&self, bytes: &[u8]) -> Result<Vec<Section>, ProcessingError> {
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| {
            ProcessingError::ExtractionFailed {
                message: format!("pdf extraction failed: {e}"),
            }
        })?;
        Ok(pages
            .into_iter()
            .enumerate()
            .filter(|(_, text)| !text.trim().is_empty())
            .map(|(page_index, text)| Section {
                text,
                page_index: Some(page_index),
            })
            .collect())
    }

    fn extract_text(&self, bytes: &[u8]) -> Result<Vec<Section>, ProcessingError> {
        let text = String::from_utf8(bytes.to_vec()).map_err(|e| {
            ProcessingError::ExtractionFailed {
                message: format!("invalid UTF-8 at byte {}", e.utf8_error().valid_up_to()),
            }
        })?;
        Ok(vec![Section {
            text,
            page_index: None,
        }])
    }

    /// Split text into chunks of at most `chunk_size` tokens, preferring
    /// coarse boundaries and carrying `chunk_overlap` tokens of context
    /// between neighbors. Whitespace-only chunks are dropped.
    pub fn chunk_text(&self, text: &str) -> Vec<String> {
        let pieces = self.split_recursive(text, SEPARATORS);
        self.merge_pieces(pieces)
    }

    /// Break text into pieces that each fit the chunk size, recursing to
    /// finer separators only where a piece is still too large.
    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        if self.counter.count(text) <= self.chunk_size {
            return vec![text.to_string()];
        }
        let Some((sep, rest)) = separators.split_first() else {
            // No boundary left; hard-cut by tokens.
            return self.hard_split(text);
        };

        let mut pieces = Vec::new();
        for part in split_keeping_separator(text, sep) {
            if self.counter.count(&part) > self.chunk_size {
                pieces.extend(self.split_recursive(&part, rest));
            } else {
                pieces.push(part);
            }
        }
        pieces
    }

    fn hard_split(&self, text: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut remaining = text;
        while !remaining.is_empty() {
            let head = self.counter.truncate(remaining, self.chunk_size);
            if head.is_empty() {
                break;
            }
            let split_at = head.len().min(remaining.len());
            out.push(remaining[..split_at].to_string());
            remaining = &remaining[split_at..];
        }
        out
    }

    /// Greedily pack pieces into chunks, starting each new chunk with the
    /// overlap tail of the previous one.
    fn merge_pieces(&self, pieces: Vec<String>) -> Vec<String> {
        let mut chunks: Vec<String> = Vec::new();
        let mut current = String::new();
        let mut current_tokens = 0usize;

        for piece in pieces {
            let piece_tokens = self.counter.count(&piece);
            if piece_tokens == 0 {
                continue;
            }
            if current_tokens + piece_tokens > self.chunk_size && !current.trim().is_empty() {
                let overlap = self.overlap_tail(&current);
                chunks.push(std::mem::take(&mut current));
                current = overlap;
                current_tokens = self.counter.count(&current);
            }
            current.push_str(&piece);
            current_tokens += piece_tokens;
        }
        if !current.trim().is_empty() {
            chunks.push(current);
        }

        chunks
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    }

    /// The last `chunk_overlap` tokens of a chunk, cut on a word boundary.
    fn overlap_tail(&self, chunk: &str) -> String {
        if self.chunk_overlap == 0 {
            return String::new();
        }
        let words: Vec<&str> = chunk.split_whitespace().collect();
        let mut tail_words: Vec<&str> = Vec::new();
        let mut tokens = 0usize;
        for word in words.iter().rev() {
            let word_tokens = self.counter.count(word).max(1);
            if tokens + word_tokens > self.chunk_overlap {
                break;
            }
            tokens += word_tokens;
            tail_words.push(word);
        }
        if tail_words.is_empty() {
            return String::new();
        }
        tail_words.reverse();
        let mut tail = tail_words.join(" ");
        tail.push(' ');
        tail
    }
}

/// Split on a separator, keeping the separator attached to the preceding
/// part so re-joined chunks read naturally.
fn split_keeping_separator(text: &str, sep: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text;
    while let Some(pos) = rest.find(sep) {
        let end = pos + sep.len();
        parts.push(rest[..end].to_string());
        rest = &rest[end..];
    }
    if !rest.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}
