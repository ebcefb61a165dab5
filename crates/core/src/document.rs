use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Pdf,
    Docx,
    PlainText,
}

impl FileType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::PlainText => "plain_text",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Pdf => "pdf",
            FileType::Docx => "docx",
            FileType::PlainText => "txt",
        }
    }

    /// Resolves the type from a file name's extension.
    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let ext = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| {
                PipelineError::UnsupportedFormat(format!(
                    "{} has no file extension",
                    path.display()
                ))
            })?;
        ext.parse()
    }
}

impl FromStr for FileType {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().trim_start_matches('.').to_lowercase().as_str() {
            "pdf" | "application/pdf" => Ok(FileType::Pdf),
            "docx"
            | "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Ok(FileType::Docx)
            }
            "txt" | "text" | "plain_text" | "text/plain" => Ok(FileType::PlainText),
            other => Err(PipelineError::UnsupportedFormat(other.to_string())),
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decrypted upload. Lives only between decryption and extraction.
pub struct RawDocument {
    pub bytes: Vec<u8>,
    pub file_type: FileType,
}

impl RawDocument {
    pub fn new(bytes: Vec<u8>, file_type: FileType) -> Self {
        Self { bytes, file_type }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for RawDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDocument")
            .field("file_type", &self.file_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "number", rename_all = "snake_case")]
pub enum SegmentLocation {
    Page(u32),
    Paragraph(u32),
    Block(u32),
}

impl fmt::Display for SegmentLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentLocation::Page(n) => write!(f, "page {n}"),
            SegmentLocation::Paragraph(n) => write!(f, "paragraph {n}"),
            SegmentLocation::Block(n) => write!(f, "block {n}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextSegment {
    pub text: String,
    pub location: SegmentLocation,
}

impl TextSegment {
    pub fn new(text: impl Into<String>, location: SegmentLocation) -> Self {
        Self {
            text: text.into(),
            location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tags_and_extensions() {
        assert_eq!("pdf".parse::<FileType>().unwrap(), FileType::Pdf);
        assert_eq!(".DOCX".parse::<FileType>().unwrap(), FileType::Docx);
        assert_eq!("txt".parse::<FileType>().unwrap(), FileType::PlainText);
        assert_eq!(
            FileType::from_path(Path::new("policy.TXT")).unwrap(),
            FileType::PlainText
        );
    }

    #[test]
    fn rejects_unknown_tags() {
        let err = "xlsx".parse::<FileType>().unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedFormat(tag) if tag == "xlsx"));
        assert!(FileType::from_path(Path::new("README")).is_err());
    }

    #[test]
    fn raw_document_debug_hides_bytes() {
        let doc = RawDocument::new(b"secret policy".to_vec(), FileType::PlainText);
        let rendered = format!("{doc:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("len: 13"));
    }
}
