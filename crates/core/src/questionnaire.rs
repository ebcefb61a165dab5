//! Control questionnaire loading.
//!
//! The questionnaire is a table with `CATEGORY` and `QUESTIONS` header
//! columns, optionally preceded by a few banner rows. Rows without a question
//! are dropped; a blank category inherits the category of the previous kept
//! row.

use std::fs;
use std::io::{Cursor, Read};
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::assessment::ControlQuestion;
use crate::error::{PipelineError, Result};
use crate::extract::{read_zip_entry_bounded, MAX_XML_ENTRY_BYTES};

/// Banner rows above the header in the stock XLSX template.
pub const XLSX_TEMPLATE_SKIP_ROWS: usize = 3;
const FALLBACK_CATEGORY: &str = "Uncategorized";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Questionnaire {
    questions: Vec<ControlQuestion>,
}

impl Questionnaire {
    pub fn new(questions: Vec<ControlQuestion>) -> Result<Self> {
        if questions.is_empty() {
            return Err(PipelineError::Questionnaire(
                "no control questions found".into(),
            ));
        }
        Ok(Self { questions })
    }

    /// Loads a `.csv` or `.xlsx` questionnaire. `skip_rows` defaults to the
    /// template banner height for XLSX and to zero for CSV.
    pub fn load(path: &Path, skip_rows: Option<usize>) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "xlsx" => {
                let bytes = fs::read(path)?;
                Self::from_xlsx_bytes(&bytes, skip_rows.unwrap_or(XLSX_TEMPLATE_SKIP_ROWS))
            }
            "csv" => Self::from_csv_reader(fs::File::open(path)?, skip_rows.unwrap_or(0)),
            other => Err(PipelineError::Questionnaire(format!(
                "unsupported questionnaire format {other:?} ({})",
                path.display()
            ))),
        }
    }

    pub fn from_csv_reader<R: Read>(reader: R, skip_rows: usize) -> Result<Self> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(|e| PipelineError::Questionnaire(e.to_string()))?;
            rows.push(record.iter().map(|cell| cell.to_string()).collect());
        }
        Self::from_rows(rows, skip_rows)
    }

    pub fn from_xlsx_bytes(bytes: &[u8], skip_rows: usize) -> Result<Self> {
        let rows = read_first_sheet(bytes).map_err(PipelineError::Questionnaire)?;
        Self::from_rows(rows, skip_rows)
    }

    pub fn from_rows(rows: Vec<Vec<String>>, skip_rows: usize) -> Result<Self> {
        let mut rows = rows.into_iter().skip(skip_rows);
        let header = rows
            .next()
            .ok_or_else(|| PipelineError::Questionnaire("missing header row".into()))?;
        let category_col = find_column(&header, &["CATEGORY"])?;
        let question_col = find_column(&header, &["QUESTIONS", "QUESTION"])?;

        let mut questions = Vec::new();
        let mut last_category: Option<String> = None;
        for row in rows {
            let question = cell(&row, question_col);
            if question.is_empty() {
                continue;
            }
            let category = match cell(&row, category_col) {
                "" => last_category
                    .clone()
                    .unwrap_or_else(|| FALLBACK_CATEGORY.to_string()),
                value => value.to_string(),
            };
            last_category = Some(category.clone());
            questions.push(ControlQuestion::new(category, question));
        }
        Self::new(questions)
    }

    pub fn questions(&self) -> &[ControlQuestion] {
        &self.questions
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

fn cell(row: &[String], idx: usize) -> &str {
    row.get(idx).map(|c| c.trim()).unwrap_or("")
}

fn find_column(header: &[String], names: &[&str]) -> Result<usize> {
    header
        .iter()
        .position(|h| names.iter().any(|n| h.trim().eq_ignore_ascii_case(n)))
        .ok_or_else(|| {
            PipelineError::Questionnaire(format!("header row has no {} column", names[0]))
        })
}

fn read_first_sheet(bytes: &[u8]) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let shared = if archive.by_name("xl/sharedStrings.xml").is_ok() {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
        shared_strings(&xml)?
    } else {
        Vec::new()
    };
    let sheet = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .min_by_key(|name| {
            name.trim_start_matches("xl/worksheets/sheet")
                .trim_end_matches(".xml")
                .parse::<u32>()
                .unwrap_or(u32::MAX)
        })
        .map(|s| s.to_string())
        .ok_or_else(|| "workbook has no worksheets".to_string())?;
    let xml = read_zip_entry_bounded(&mut archive, &sheet, MAX_XML_ENTRY_BYTES)?;
    sheet_rows(&xml, &shared)
}

fn shared_strings(xml: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_t = true,
                _ => {}
            },
            Ok(Event::Text(te)) if in_t => {
                current.push_str(&te.unescape().map_err(|e| e.to_string())?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => strings.push(std::mem::take(&mut current)),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

#[derive(Clone, Copy, PartialEq)]
enum CellKind {
    Shared,
    Inline,
    Literal,
}

/// Reads rows at their absolute positions (`<row r="N">`), so blank banner
/// rows count towards `skip_rows` just like in the spreadsheet.
fn sheet_rows(xml: &[u8], shared: &[String]) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut row_number = 0usize;
    let mut col = 0usize;
    let mut kind = CellKind::Literal;
    let mut value = String::new();
    let mut capture = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row_number = attr(&e, b"r")
                        .and_then(|r| r.parse::<usize>().ok())
                        .unwrap_or(row_number + 1);
                    row.clear();
                    col = 0;
                }
                b"c" => {
                    col = attr(&e, b"r")
                        .map(|r| column_index(&r))
                        .unwrap_or(row.len());
                    kind = match attr(&e, b"t").as_deref() {
                        Some("s") => CellKind::Shared,
                        Some("inlineStr") => CellKind::Inline,
                        _ => CellKind::Literal,
                    };
                    value.clear();
                }
                b"v" => capture = kind != CellKind::Inline,
                b"t" => capture = kind == CellKind::Inline,
                _ => {}
            },
            Ok(Event::Text(te)) if capture => {
                value.push_str(&te.unescape().map_err(|e| e.to_string())?);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    let text = match kind {
                        CellKind::Shared => value
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default(),
                        _ => value.clone(),
                    };
                    if row.len() <= col {
                        row.resize(col + 1, String::new());
                    }
                    row[col] = text;
                }
                b"row" => {
                    if rows.len() + 1 < row_number {
                        rows.resize(row_number - 1, Vec::new());
                    }
                    rows.push(std::mem::take(&mut row));
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

fn attr(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// `"C7"` -> 2
fn column_index(reference: &str) -> usize {
    reference
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .fold(0usize, |acc, c| {
            acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1)
        })
        .saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::tests::zip_with;

    #[test]
    fn csv_forward_fills_categories_and_drops_blank_questions() {
        let csv = "\
CATEGORY,QUESTIONS,NOTES
Access Control,Is MFA enforced for all users?,
,Are privileged accounts reviewed quarterly?,
Orphan category,,
Data Protection,Are backups encrypted?,x
,Is data classified?,
";
        let q = Questionnaire::from_csv_reader(csv.as_bytes(), 0).unwrap();
        let cats: Vec<&str> = q.questions().iter().map(|c| c.category.as_str()).collect();
        assert_eq!(
            cats,
            vec![
                "Access Control",
                "Access Control",
                "Data Protection",
                "Data Protection"
            ]
        );
        assert_eq!(q.questions()[3].question, "Is data classified?");
    }

    #[test]
    fn skips_banner_rows_and_matches_headers_case_insensitively() {
        let csv = "Title,,\nVersion 2,,\n,,\ncategory,Question\nGovernance,Is there a security policy?\n";
        let q = Questionnaire::from_csv_reader(csv.as_bytes(), 3).unwrap();
        assert_eq!(q.len(), 1);
        assert_eq!(q.questions()[0].category, "Governance");
    }

    #[test]
    fn missing_columns_or_questions_are_errors() {
        let err = Questionnaire::from_csv_reader("A,B\n1,2\n".as_bytes(), 0).unwrap_err();
        assert!(matches!(err, PipelineError::Questionnaire(_)));
        let err = Questionnaire::from_csv_reader("CATEGORY,QUESTIONS\nx,\n".as_bytes(), 0)
            .unwrap_err();
        assert!(matches!(err, PipelineError::Questionnaire(_)));
    }

    #[test]
    fn leading_blank_category_uses_fallback() {
        let q =
            Questionnaire::from_csv_reader("CATEGORY,QUESTIONS\n,Is MFA used?\n".as_bytes(), 0)
                .unwrap();
        assert_eq!(q.questions()[0].category, FALLBACK_CATEGORY);
    }

    #[test]
    fn column_letters_map_to_indexes() {
        assert_eq!(column_index("A1"), 0);
        assert_eq!(column_index("C7"), 2);
        assert_eq!(column_index("AA10"), 26);
    }

    #[test]
    fn reads_xlsx_template_with_banner_rows() {
        let shared = r#"<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">
<si><t>Control Template</t></si><si><t>CATEGORY</t></si><si><t>QUESTIONS</t></si>
<si><t>Access Control</t></si><si><t>Is MFA enforced?</t></si></sst>"#;
        let sheet = r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>
<row r="1"><c r="A1" t="s"><v>0</v></c></row>
<row r="4"><c r="B4" t="s"><v>1</v></c><c r="C4" t="s"><v>2</v></c></row>
<row r="5"><c r="B5" t="s"><v>3</v></c><c r="C5" t="s"><v>4</v></c></row>
<row r="6"><c r="C6" t="inlineStr"><is><t>Are logs retained for a year?</t></is></c></row>
</sheetData></worksheet>"#;
        let bytes = zip_with(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);
        let q = Questionnaire::from_xlsx_bytes(&bytes, XLSX_TEMPLATE_SKIP_ROWS).unwrap();
        assert_eq!(
            q.questions(),
            &[
                ControlQuestion::new("Access Control", "Is MFA enforced?"),
                ControlQuestion::new("Access Control", "Are logs retained for a year?"),
            ]
        );
    }
}
