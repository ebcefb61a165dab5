//! TrueType faces embedded in the report.
//!
//! Text is drawn through Type0 fonts with Identity-H encoding, so content
//! streams carry two-byte glyph ids. Every glyph drawn is recorded; the
//! assembled PDF carries its width and a ToUnicode entry for it.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;

use riskshield_core::{PipelineError, Result};
use ttf_parser::GlyphId;

static DEJAVU_SANS: &[u8] = include_bytes!("../fonts/DejaVuSans.ttf");
static DEJAVU_SANS_BOLD: &[u8] = include_bytes!("../fonts/DejaVuSans-Bold.ttf");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Face {
    Regular,
    Bold,
}

impl Face {
    pub(crate) const ALL: [Face; 2] = [Face::Regular, Face::Bold];

    pub(crate) fn resource_name(&self) -> &'static str {
        match self {
            Face::Regular => "F1",
            Face::Bold => "F2",
        }
    }

    fn index(self) -> usize {
        match self {
            Face::Regular => 0,
            Face::Bold => 1,
        }
    }
}

/// A TrueType program and the PostScript name it is embedded under.
#[derive(Clone)]
pub struct FontProgram {
    name: String,
    data: Cow<'static, [u8]>,
}

impl FontProgram {
    fn bundled(name: &str, data: &'static [u8]) -> Self {
        Self {
            name: name.to_string(),
            data: Cow::Borrowed(data),
        }
    }

    /// Reads a `.ttf` file. The file has to parse as a TrueType face.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let name: String = stem
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        let program = Self {
            name: if name.is_empty() {
                "ReportFont".to_string()
            } else {
                name
            },
            data: Cow::Owned(data),
        };
        program.parse()?;
        Ok(program)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn data(&self) -> &[u8] {
        &self.data
    }

    fn parse(&self) -> Result<ttf_parser::Face<'_>> {
        ttf_parser::Face::parse(&self.data, 0)
            .map_err(|e| PipelineError::Report(format!("font {}: {e}", self.name)))
    }
}

impl fmt::Debug for FontProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FontProgram")
            .field("name", &self.name)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// The regular and bold programs a report is drawn with. Defaults to the
/// bundled DejaVu Sans pair.
#[derive(Debug, Clone)]
pub struct ReportFonts {
    regular: FontProgram,
    bold: FontProgram,
}

impl Default for ReportFonts {
    fn default() -> Self {
        Self::bundled()
    }
}

impl ReportFonts {
    pub fn bundled() -> Self {
        Self {
            regular: FontProgram::bundled("DejaVuSans", DEJAVU_SANS),
            bold: FontProgram::bundled("DejaVuSans-Bold", DEJAVU_SANS_BOLD),
        }
    }

    /// Replaces the bundled faces with files. A regular face given alone is
    /// used for bold text too, so both faces cover the same scripts.
    pub fn load(regular: Option<&Path>, bold: Option<&Path>) -> Result<Self> {
        let mut fonts = Self::bundled();
        if let Some(path) = regular {
            fonts.regular = FontProgram::from_file(path)?;
            fonts.bold = fonts.regular.clone();
        }
        if let Some(path) = bold {
            fonts.bold = FontProgram::from_file(path)?;
        }
        Ok(fonts)
    }

    pub(crate) fn program(&self, face: Face) -> &FontProgram {
        match face {
            Face::Regular => &self.regular,
            Face::Bold => &self.bold,
        }
    }
}

/// A glyph that has been drawn: its width in text space units (1/1000 em)
/// and the character it stands for, absent for `.notdef`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GlyphUse {
    pub width: u16,
    pub ch: Option<char>,
}

/// Font-wide metrics in text space units, for the font descriptor.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FaceMetrics {
    pub ascent: i64,
    pub descent: i64,
    pub cap_height: i64,
    pub bbox: [i64; 4],
    pub italic_angle: f32,
}

struct Parsed<'a> {
    program: &'a FontProgram,
    face: ttf_parser::Face<'a>,
    scale: f32,
}

impl Parsed<'_> {
    fn glyph(&self, ch: char) -> (u16, u16) {
        let id = self.face.glyph_index(ch).unwrap_or(GlyphId(0));
        let advance = self.face.glyph_hor_advance(id).unwrap_or(0);
        (id.0, (advance as f32 * self.scale).round() as u16)
    }

    fn units(&self, value: i16) -> i64 {
        (value as f32 * self.scale).round() as i64
    }
}

/// Parsed faces for one render plus every glyph drawn with them.
pub(crate) struct FontSet<'a> {
    faces: [Parsed<'a>; 2],
    used: [BTreeMap<u16, GlyphUse>; 2],
}

impl<'a> FontSet<'a> {
    pub(crate) fn load(fonts: &'a ReportFonts) -> Result<Self> {
        let parse = |face: Face| -> Result<Parsed<'a>> {
            let program = fonts.program(face);
            let parsed = program.parse()?;
            let scale = 1000.0 / parsed.units_per_em().max(1) as f32;
            Ok(Parsed {
                program,
                face: parsed,
                scale,
            })
        };
        Ok(Self {
            faces: [parse(Face::Regular)?, parse(Face::Bold)?],
            used: [BTreeMap::new(), BTreeMap::new()],
        })
    }

    /// Advance width of `text` in points at `size`.
    pub(crate) fn text_width(&self, face: Face, text: &str, size: f32) -> f32 {
        let parsed = &self.faces[face.index()];
        let units: u32 = text.chars().map(|ch| parsed.glyph(ch).1 as u32).sum();
        units as f32 * size / 1000.0
    }

    /// Glyph ids of `text` as big-endian pairs. Characters the face lacks
    /// become `.notdef`.
    pub(crate) fn encode(&mut self, face: Face, text: &str) -> Vec<u8> {
        let idx = face.index();
        let mut out = Vec::with_capacity(text.len() * 2);
        for ch in text.chars() {
            let (gid, width) = self.faces[idx].glyph(ch);
            let ch = (gid != 0).then_some(ch);
            self.used[idx].entry(gid).or_insert(GlyphUse { width, ch });
            out.extend_from_slice(&gid.to_be_bytes());
        }
        out
    }

    pub(crate) fn used(&self, face: Face) -> &BTreeMap<u16, GlyphUse> {
        &self.used[face.index()]
    }

    pub(crate) fn program(&self, face: Face) -> &'a FontProgram {
        self.faces[face.index()].program
    }

    pub(crate) fn metrics(&self, face: Face) -> FaceMetrics {
        let parsed = &self.faces[face.index()];
        let bbox = parsed.face.global_bounding_box();
        FaceMetrics {
            ascent: parsed.units(parsed.face.ascender()),
            descent: parsed.units(parsed.face.descender()),
            cap_height: parsed.units(
                parsed
                    .face
                    .capital_height()
                    .unwrap_or(parsed.face.ascender()),
            ),
            bbox: [
                parsed.units(bbox.x_min),
                parsed.units(bbox.y_min),
                parsed.units(bbox.x_max),
                parsed.units(bbox.y_max),
            ],
            italic_angle: parsed.face.italic_angle(),
        }
    }
}

/// `W` array entries for the CIDFont, consecutive glyph ids grouped.
pub(crate) fn width_runs(used: &BTreeMap<u16, GlyphUse>) -> Vec<(u16, Vec<u16>)> {
    let mut runs: Vec<(u16, Vec<u16>)> = Vec::new();
    for (&gid, glyph) in used {
        match runs.last_mut() {
            Some((start, widths)) if *start as usize + widths.len() == gid as usize => {
                widths.push(glyph.width)
            }
            _ => runs.push((gid, vec![glyph.width])),
        }
    }
    runs
}

const CMAP_HEADER: &str = "/CIDInit /ProcSet findresource begin
12 dict begin
begincmap
/CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def
/CMapName /Adobe-Identity-UCS def
/CMapType 2 def
1 begincodespacerange
<0000> <FFFF>
endcodespacerange
";

const CMAP_FOOTER: &str = "endcmap
CMapName currentdict /CMap defineresource pop
end
end
";

/// ToUnicode CMap mapping every drawn glyph back to its character.
pub(crate) fn to_unicode_cmap(used: &BTreeMap<u16, GlyphUse>) -> Vec<u8> {
    let entries: Vec<(u16, char)> = used
        .iter()
        .filter_map(|(gid, glyph)| glyph.ch.map(|ch| (*gid, ch)))
        .collect();
    let mut out = String::from(CMAP_HEADER);
    // at most 100 entries per bfchar block
    for block in entries.chunks(100) {
        out.push_str(&format!("{} beginbfchar\n", block.len()));
        for (gid, ch) in block {
            let mut units = [0u16; 2];
            let hex: String = ch
                .encode_utf16(&mut units)
                .iter()
                .map(|u| format!("{u:04X}"))
                .collect();
            out.push_str(&format!("<{gid:04X}> <{hex}>\n"));
        }
        out.push_str("endbfchar\n");
    }
    out.push_str(CMAP_FOOTER);
    out.into_bytes()
}

/// Greedy word wrap by measured width. Words wider than the column are
/// broken between characters.
pub(crate) fn fit_lines(
    fonts: &FontSet<'_>,
    text: &str,
    face: Face,
    size: f32,
    width: f32,
) -> Vec<String> {
    let fits = |candidate: &str| fonts.text_width(face, candidate, size) <= width;
    let mut out = Vec::new();
    for paragraph in text.split('\n') {
        if paragraph.trim().is_empty() {
            out.push(String::new());
            continue;
        }
        let mut line = String::new();
        for word in paragraph.split(' ').filter(|w| !w.is_empty()) {
            let candidate = if line.is_empty() {
                word.to_string()
            } else {
                format!("{line} {word}")
            };
            if fits(&candidate) {
                line = candidate;
                continue;
            }
            if !line.is_empty() {
                out.push(std::mem::take(&mut line));
            }
            if fits(word) {
                line = word.to_string();
                continue;
            }
            for ch in word.chars() {
                let mut next = line.clone();
                next.push(ch);
                if !line.is_empty() && !fits(&next) {
                    out.push(std::mem::take(&mut line));
                    line.push(ch);
                } else {
                    line = next;
                }
            }
        }
        if !line.is_empty() {
            out.push(line);
        }
    }
    out
}
