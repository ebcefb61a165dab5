mod assessment;
mod chunk;
pub mod crypto;
mod document;
mod embedding;
mod error;
mod extract;
mod normalization;
mod questionnaire;
mod sanitize;

pub use assessment::{AssessmentResult, ControlQuestion, IncompleteReason, Rating};
pub use chunk::{
    chunk, Chunk, ChunkConfig, Chunker, TokenizerKind, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE,
};
pub use crypto::{decrypt, encrypt, EncryptedBlob, EncryptionKey};
pub use document::{FileType, RawDocument, SegmentLocation, TextSegment};
pub use embedding::{HashEmbedder, HashEmbedderConfig};
pub use error::{PipelineError, Result};
pub use extract::{extract, extract_document};
pub use normalization::{normalize_line, wrap_text, CharsetPolicy};
pub use questionnaire::{Questionnaire, XLSX_TEMPLATE_SKIP_ROWS};
pub use sanitize::{sanitize, sanitize_value};
