//! Text extraction for decrypted uploads.
//!
//! Each `FileType` is bound to exactly one extractor. Extraction never touches
//! the filesystem; bytes in, ordered segments out.

use std::io::{Cursor, Read};
use std::panic::{self, AssertUnwindSafe};

use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use crate::document::{FileType, RawDocument, SegmentLocation, TextSegment};
use crate::error::{PipelineError, Result};

/// Upper bound on a single decompressed OOXML part (zip-bomb guard).
pub(crate) const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

pub fn extract(bytes: &[u8], file_type: FileType) -> Result<Vec<TextSegment>> {
    let segments = match file_type {
        FileType::Pdf => extract_pdf(bytes),
        FileType::Docx => extract_docx(bytes),
        FileType::PlainText => extract_plain_text(bytes),
    }
    .map_err(|reason| PipelineError::extraction(file_type, bytes.len(), reason))?;
    if segments.is_empty() {
        return Err(PipelineError::extraction(
            file_type,
            bytes.len(),
            "document contains no extractable text",
        ));
    }
    debug!(
        file_type = %file_type,
        bytes = bytes.len(),
        segments = segments.len(),
        "extracted document"
    );
    Ok(segments)
}

pub fn extract_document(document: &RawDocument) -> Result<Vec<TextSegment>> {
    extract(&document.bytes, document.file_type)
}

fn extract_pdf(bytes: &[u8]) -> std::result::Result<Vec<TextSegment>, String> {
    // pdf-extract panics on some malformed inputs instead of returning an error
    let pages = panic::catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(bytes)
    }))
    .map_err(|_| "pdf parser aborted on malformed input".to_string())?
    .map_err(|e| e.to_string())?;
    Ok(pages
        .into_iter()
        .enumerate()
        .filter(|(_, text)| !text.trim().is_empty())
        .map(|(idx, text)| TextSegment::new(text, SegmentLocation::Page(idx as u32 + 1)))
        .collect())
}

fn extract_plain_text(bytes: &[u8]) -> std::result::Result<Vec<TextSegment>, String> {
    let text = std::str::from_utf8(bytes).map_err(|e| format!("invalid utf-8: {e}"))?;
    let text = text.trim_start_matches('\u{feff}').replace("\r\n", "\n");
    let mut segments = Vec::new();
    let mut block = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            push_block(&mut segments, &mut block);
        } else {
            block.push(line);
        }
    }
    push_block(&mut segments, &mut block);
    Ok(segments)
}

fn push_block(segments: &mut Vec<TextSegment>, block: &mut Vec<&str>) {
    if block.is_empty() {
        return;
    }
    let number = segments.len() as u32 + 1;
    segments.push(TextSegment::new(
        block.join("\n"),
        SegmentLocation::Block(number),
    ));
    block.clear();
}

pub(crate) fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> std::result::Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| format!("{name}: {e}"))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= max_bytes {
        return Err(format!("{name} exceeds size limit ({max_bytes} bytes)"));
    }
    Ok(out)
}

fn extract_docx(bytes: &[u8]) -> std::result::Result<Vec<TextSegment>, String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;
    let paragraphs = docx_paragraphs(&xml)?;
    Ok(paragraphs
        .into_iter()
        .enumerate()
        .map(|(idx, text)| TextSegment::new(text, SegmentLocation::Paragraph(idx as u32 + 1)))
        .collect())
}

/// Collects `w:t` runs grouped by their enclosing `w:p`; tabs and breaks
/// become whitespace.
fn docx_paragraphs(xml: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                b"tab" => current.push('\t'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"tab" => current.push('\t'),
                b"br" | b"cr" => current.push('\n'),
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| e.to_string())?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let text = current.trim();
                    if !text.is_empty() {
                        paragraphs.push(text.to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    let tail = current.trim();
    if !tail.is_empty() {
        paragraphs.push(tail.to_string());
    }
    Ok(paragraphs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, body) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(body.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn plain_text_splits_blocks() {
        let segments = extract(
            b"Access Control\nWe require MFA for all accounts.\n\n\nBackups run nightly.\n",
            FileType::PlainText,
        )
        .unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].location, SegmentLocation::Block(1));
        assert!(segments[0].text.contains("MFA"));
        assert_eq!(segments[1].text, "Backups run nightly.");
    }

    #[test]
    fn invalid_utf8_reports_context() {
        let err = extract(&[0xff, 0xfe, 0x00, 0x41], FileType::PlainText).unwrap_err();
        match err {
            PipelineError::Extraction {
                file_type,
                byte_len,
                ..
            } => {
                assert_eq!(file_type, FileType::PlainText);
                assert_eq!(byte_len, 4);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn empty_text_is_an_extraction_error() {
        assert!(matches!(
            extract(b"  \n\n ", FileType::PlainText),
            Err(PipelineError::Extraction { .. })
        ));
    }

    #[test]
    fn invalid_pdf_returns_error() {
        let err = extract(b"not a pdf", FileType::Pdf).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { file_type: FileType::Pdf, .. }));
    }

    #[test]
    fn invalid_zip_returns_error_for_docx() {
        let err = extract(b"not a zip", FileType::Docx).unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { file_type: FileType::Docx, .. }));
    }

    #[test]
    fn docx_paragraphs_become_segments() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Password</w:t></w:r><w:r><w:t xml:space="preserve"> Policy</w:t></w:r></w:p>
    <w:p></w:p>
    <w:p><w:r><w:t>MFA is enforced &amp; audited.</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        let bytes = zip_with(&[("word/document.xml", xml)]);
        let segments = extract(&bytes, FileType::Docx).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "Password Policy");
        assert_eq!(segments[1].text, "MFA is enforced & audited.");
        assert_eq!(segments[1].location, SegmentLocation::Paragraph(2));
    }

    #[test]
    fn docx_without_body_is_rejected() {
        let bytes = zip_with(&[("word/styles.xml", "<styles/>")]);
        assert!(matches!(
            extract(&bytes, FileType::Docx),
            Err(PipelineError::Extraction { .. })
        ));
    }
}
