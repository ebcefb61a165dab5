use thiserror::Error;

use crate::document::FileType;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),
    #[error("failed to extract {file_type} document ({byte_len} bytes): {reason}")]
    Extraction {
        file_type: FileType,
        byte_len: usize,
        reason: String,
    },
    #[error("failed to build retrieval index: {0}")]
    IndexBuild(String),
    #[error("report upload failed: {0}")]
    StorageUpload(String),
    #[error("invalid questionnaire: {0}")]
    Questionnaire(String),
    #[error("report rendering failed: {0}")]
    Report(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

impl PipelineError {
    pub fn extraction(file_type: FileType, byte_len: usize, reason: impl ToString) -> Self {
        Self::Extraction {
            file_type,
            byte_len,
            reason: reason.to_string(),
        }
    }

    /// True for failures caused by the caller's input rather than by the
    /// service itself.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            PipelineError::UnsupportedFormat(_) | PipelineError::Extraction { .. }
        )
    }
}
