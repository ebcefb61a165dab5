use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};
use riskshield_core::{wrap_text, AssessmentResult, CharsetPolicy, PipelineError, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

mod fonts;
mod layout;

pub use fonts::{FontProgram, ReportFonts};

use fonts::{to_unicode_cmap, width_runs, Face, FontSet};
use layout::{Align, Cell, PageWriter, PAGE_HEIGHT, PAGE_WIDTH};

pub const DEFAULT_MAX_LINE_LENGTH: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportOptions {
    pub title: String,
    /// Words longer than this many characters are broken before layout.
    pub max_line_length: usize,
    pub charset: CharsetPolicy,
    /// TrueType file replacing the bundled DejaVu Sans.
    pub regular_font: Option<PathBuf>,
    pub bold_font: Option<PathBuf>,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            title: "Compliance Assessment Report".to_string(),
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            charset: CharsetPolicy::Printable,
            regular_font: None,
            bold_font: None,
        }
    }
}

impl ReportOptions {
    pub fn fonts(&self) -> Result<ReportFonts> {
        ReportFonts::load(self.regular_font.as_deref(), self.bold_font.as_deref())
    }
}

/// Renders the assessment table as a PDF document.
pub fn render(results: &[AssessmentResult], options: &ReportOptions) -> Result<Vec<u8>> {
    let fonts = options.fonts()?;
    let clean = |text: &str| wrap_text(text, options.max_line_length, options.charset);
    let mut writer = PageWriter::new(FontSet::load(&fonts)?);
    writer.title(&clean(&options.title));
    for result in results {
        writer.row(
            [
                header_cell("Category"),
                header_cell("Control Question"),
                header_cell("Rating"),
            ],
            true,
        );
        let category = clean(&result.category);
        let question = clean(&result.question);
        let rating = clean(result.rating.label());
        writer.row(
            [
                Cell {
                    text: &category,
                    face: Face::Regular,
                    align: Align::Left,
                },
                Cell {
                    text: &question,
                    face: Face::Regular,
                    align: Align::Left,
                },
                Cell {
                    text: &rating,
                    face: Face::Regular,
                    align: Align::Center,
                },
            ],
            false,
        );
        writer.block("Response", Face::Bold, true);
        writer.block(&clean(&result.raw_response), Face::Regular, false);
        writer.gap();
    }
    let (pages, fonts) = writer.finish();
    let page_count = pages.len();
    let bytes = assemble(pages, &fonts)?;
    info!(
        results = results.len(),
        pages = page_count,
        bytes = bytes.len(),
        "rendered report"
    );
    Ok(bytes)
}

fn header_cell(text: &'static str) -> Cell<'static> {
    Cell {
        text,
        face: Face::Bold,
        align: Align::Left,
    }
}

fn report_error(err: lopdf::Error) -> PipelineError {
    PipelineError::Report(err.to_string())
}

/// Type0 font over an embedded CIDFontType2 program. Glyph ids are used
/// directly as CIDs.
fn add_font(doc: &mut Document, fonts: &FontSet<'_>, face: Face) -> Result<ObjectId> {
    let program = fonts.program(face);
    let name = || Object::Name(program.name().as_bytes().to_vec());
    let used = fonts.used(face);
    let metrics = fonts.metrics(face);

    let mut file = Stream::new(
        dictionary! { "Length1" => program.data().len() as i64 },
        program.data().to_vec(),
    );
    file.compress().map_err(report_error)?;
    let file_id = doc.add_object(file);
    let descriptor_id = doc.add_object(dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => name(),
        "Flags" => 32i64,
        "FontBBox" => metrics.bbox.iter().map(|v| Object::Integer(*v)).collect::<Vec<_>>(),
        "ItalicAngle" => metrics.italic_angle,
        "Ascent" => metrics.ascent,
        "Descent" => metrics.descent,
        "CapHeight" => metrics.cap_height,
        "StemV" => 80i64,
        "FontFile2" => file_id,
    });
    let widths: Vec<Object> = width_runs(used)
        .into_iter()
        .flat_map(|(start, run)| {
            let run: Vec<Object> = run.into_iter().map(|w| Object::Integer(w as i64)).collect();
            [Object::Integer(start as i64), Object::Array(run)]
        })
        .collect();
    let cid_font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "CIDFontType2",
        "BaseFont" => name(),
        "CIDSystemInfo" => dictionary! {
            "Registry" => Object::string_literal("Adobe"),
            "Ordering" => Object::string_literal("Identity"),
            "Supplement" => 0i64,
        },
        "FontDescriptor" => descriptor_id,
        "W" => widths,
        "CIDToGIDMap" => "Identity",
    });
    let cmap_id = doc.add_object(Stream::new(dictionary! {}, to_unicode_cmap(used)));
    Ok(doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => name(),
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![Object::Reference(cid_font_id)],
        "ToUnicode" => cmap_id,
    }))
}

fn assemble(pages: Vec<Vec<Operation>>, fonts: &FontSet<'_>) -> Result<Vec<u8>> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let mut font_resources = Dictionary::new();
    for face in Face::ALL {
        // faces that drew nothing are left out
        if fonts.used(face).is_empty() {
            continue;
        }
        let font_id = add_font(&mut doc, fonts, face)?;
        font_resources.set(face.resource_name(), font_id);
    }
    let resources_id = doc.add_object(dictionary! {
        "Font" => font_resources,
    });

    let mut kids: Vec<Object> = Vec::with_capacity(pages.len());
    for operations in pages {
        let content = Content { operations }.encode().map_err(report_error)?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }
    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
            "Resources" => resources_id,
            "MediaBox" => vec![0i64.into(), 0i64.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(|e| PipelineError::Report(e.to_string()))?;
    Ok(out)
}

/// Renders into a temporary file inside `dir` and moves it to `dir/name`
/// only once complete. On any failure nothing exists at the final path.
pub fn write_report(
    results: &[AssessmentResult],
    dir: &Path,
    name: &str,
    options: &ReportOptions,
) -> Result<PathBuf> {
    if name.is_empty() || name.contains(['/', '\\']) || name.contains("..") {
        return Err(PipelineError::Report(format!("invalid report name {name:?}")));
    }
    fs::create_dir_all(dir)?;
    let bytes = render(results, options)?;
    let target = dir.join(name);
    let mut tmp = NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut tmp, &bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(&target)
        .map_err(|e| PipelineError::Report(format!("failed to publish report: {}", e.error)))?;
    info!(path = %target.display(), "report written");
    Ok(target)
}

/// Text drawn on each page, in drawing order, mapped back to characters
/// through each font's ToUnicode table. Glyphs without an entry read as
/// U+FFFD.
pub fn text_lines(pdf: &[u8]) -> Result<Vec<String>> {
    let doc = Document::load_mem(pdf).map_err(report_error)?;
    let mut lines = Vec::new();
    for (_, page_id) in doc.get_pages() {
        let maps: HashMap<Vec<u8>, BTreeMap<u16, String>> = doc
            .get_page_fonts(page_id)
            .map_err(report_error)?
            .into_iter()
            .map(|(name, font)| (name, glyph_map(&doc, font)))
            .collect();
        let raw = doc.get_page_content(page_id).map_err(report_error)?;
        let content = Content::decode(&raw).map_err(report_error)?;
        let mut current = None;
        for op in &content.operations {
            match op.operator.as_str() {
                "Tf" => {
                    current = op
                        .operands
                        .first()
                        .and_then(|o| o.as_name().ok())
                        .and_then(|name| maps.get(name));
                }
                "Tj" => {
                    if let Some(Object::String(bytes, _)) = op.operands.first() {
                        lines.push(decode_glyphs(bytes, current));
                    }
                }
                _ => {}
            }
        }
    }
    Ok(lines)
}

fn glyph_map(doc: &Document, font: &Dictionary) -> BTreeMap<u16, String> {
    let stream = font
        .get(b"ToUnicode")
        .and_then(Object::as_reference)
        .and_then(|id| doc.get_object(id))
        .and_then(Object::as_stream);
    let Ok(stream) = stream else {
        return BTreeMap::new();
    };
    let data = if stream.dict.has(b"Filter") {
        stream.decompressed_content().unwrap_or_default()
    } else {
        stream.content.clone()
    };
    parse_bfchar(&String::from_utf8_lossy(&data))
}

fn parse_bfchar(cmap: &str) -> BTreeMap<u16, String> {
    let hex = |token: &str| token.trim_matches(|c| c == '<' || c == '>').to_string();
    let mut map = BTreeMap::new();
    let mut inside = false;
    for line in cmap.lines().map(str::trim) {
        if line.ends_with("beginbfchar") {
            inside = true;
        } else if line == "endbfchar" {
            inside = false;
        } else if inside {
            let mut parts = line.split_whitespace().map(hex);
            let (Some(src), Some(dst)) = (parts.next(), parts.next()) else {
                continue;
            };
            let Ok(gid) = u16::from_str_radix(&src, 16) else {
                continue;
            };
            let units: Vec<u16> = dst
                .as_bytes()
                .chunks(4)
                .filter_map(|c| std::str::from_utf8(c).ok())
                .filter_map(|c| u16::from_str_radix(c, 16).ok())
                .collect();
            map.insert(gid, String::from_utf16_lossy(&units));
        }
    }
    map
}

fn decode_glyphs(bytes: &[u8], map: Option<&BTreeMap<u16, String>>) -> String {
    bytes
        .chunks(2)
        .map(|pair| {
            let gid = u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]);
            map.and_then(|m| m.get(&gid))
                .map(String::as_str)
                .unwrap_or("\u{fffd}")
        })
        .collect()
}
