use lopdf::content::Operation;
use lopdf::{Object, StringFormat};

use crate::fonts::{fit_lines, Face, FontSet};

// A4 in points.
pub(crate) const PAGE_WIDTH: f32 = 595.28;
pub(crate) const PAGE_HEIGHT: f32 = 841.89;
// 1 cm left/right/top, 1.5 cm bottom.
const MARGIN_X: f32 = 28.35;
const MARGIN_TOP: f32 = 28.35;
const MARGIN_BOTTOM: f32 = 42.52;

const FONT_SIZE: f32 = 10.0;
const TITLE_SIZE: f32 = 14.0;
const LINE_HEIGHT: f32 = 12.0;
const PADDING: f32 = 3.0;
const ENTRY_GAP: f32 = 8.0;

const COLUMN_SHARES: [f32; 3] = [0.2, 0.6, 0.2];
const HEADER_FILL: [f32; 3] = [0.85, 0.85, 0.85];

#[derive(Debug, Clone, Copy)]
pub(crate) enum Align {
    Left,
    Center,
}

pub(crate) struct Cell<'a> {
    pub text: &'a str,
    pub face: Face,
    pub align: Align,
}

/// Accumulates drawing operations page by page, breaking pages whenever the
/// next line would cross the bottom margin.
pub(crate) struct PageWriter<'f> {
    pages: Vec<Vec<Operation>>,
    cursor: f32,
    fonts: FontSet<'f>,
}

impl<'f> PageWriter<'f> {
    pub(crate) fn new(fonts: FontSet<'f>) -> Self {
        Self {
            pages: vec![Vec::new()],
            cursor: PAGE_HEIGHT - MARGIN_TOP,
            fonts,
        }
    }

    pub(crate) fn usable_width() -> f32 {
        PAGE_WIDTH - 2.0 * MARGIN_X
    }

    fn remaining(&self) -> f32 {
        self.cursor - MARGIN_BOTTOM
    }

    fn new_page(&mut self) {
        self.pages.push(Vec::new());
        self.cursor = PAGE_HEIGHT - MARGIN_TOP;
    }

    fn ops(&mut self) -> &mut Vec<Operation> {
        if self.pages.is_empty() {
            self.pages.push(Vec::new());
        }
        let last = self.pages.len() - 1;
        &mut self.pages[last]
    }

    pub(crate) fn title(&mut self, text: &str) {
        let x = MARGIN_X;
        let y = self.cursor - TITLE_SIZE;
        self.text(Face::Bold, TITLE_SIZE, x, y, text);
        self.cursor -= TITLE_SIZE + ENTRY_GAP;
    }

    pub(crate) fn gap(&mut self) {
        self.cursor -= ENTRY_GAP;
        if self.remaining() < LINE_HEIGHT + 2.0 * PADDING {
            self.new_page();
        }
    }

    /// One table row with the 20/60/20 split. Cells wrap independently; the
    /// row grows to its tallest cell and continues on the next page when it
    /// does not fit.
    pub(crate) fn row(&mut self, cells: [Cell<'_>; 3], fill: bool) {
        let width = Self::usable_width();
        let widths = COLUMN_SHARES.map(|share| share * width);
        let wrapped: Vec<Vec<String>> = cells
            .iter()
            .zip(widths.iter())
            .map(|(cell, w)| {
                fit_lines(&self.fonts, cell.text, cell.face, FONT_SIZE, w - 2.0 * PADDING)
            })
            .collect();
        let total = wrapped.iter().map(|l| l.len()).max().unwrap_or(0).max(1);
        let mut done = 0;
        while done < total {
            let take = self.lines_that_fit(total - done);
            let height = take as f32 * LINE_HEIGHT + 2.0 * PADDING;
            let top = self.cursor;
            let mut x = MARGIN_X;
            for (i, cell) in cells.iter().enumerate() {
                self.rect(x, top - height, widths[i], height, fill);
                let slice = wrapped[i].iter().skip(done).take(take);
                for (line_no, line) in slice.enumerate() {
                    let baseline = top - PADDING - (line_no as f32 + 1.0) * LINE_HEIGHT + 2.5;
                    let offset = match cell.align {
                        Align::Left => PADDING,
                        Align::Center => {
                            let drawn = self.fonts.text_width(cell.face, line, FONT_SIZE);
                            ((widths[i] - drawn) / 2.0).max(PADDING)
                        }
                    };
                    self.text(cell.face, FONT_SIZE, x + offset, baseline, line);
                }
                x += widths[i];
            }
            self.cursor -= height;
            done += take;
            if done < total {
                self.new_page();
            }
        }
    }

    /// Full-width bordered block of wrapped text.
    pub(crate) fn block(&mut self, text: &str, face: Face, fill: bool) {
        let width = Self::usable_width();
        let mut lines = fit_lines(&self.fonts, text, face, FONT_SIZE, width - 2.0 * PADDING);
        if lines.is_empty() {
            lines.push(String::new());
        }
        let mut done = 0;
        while done < lines.len() {
            let take = self.lines_that_fit(lines.len() - done);
            let height = take as f32 * LINE_HEIGHT + 2.0 * PADDING;
            let top = self.cursor;
            self.rect(MARGIN_X, top - height, width, height, fill);
            for (line_no, line) in lines[done..done + take].iter().enumerate() {
                let baseline = top - PADDING - (line_no as f32 + 1.0) * LINE_HEIGHT + 2.5;
                self.text(face, FONT_SIZE, MARGIN_X + PADDING, baseline, line);
            }
            self.cursor -= height;
            done += take;
            if done < lines.len() {
                self.new_page();
            }
        }
    }

    /// How many of `wanted` lines fit on the current page; starts a new page
    /// first when not even one does.
    fn lines_that_fit(&mut self, wanted: usize) -> usize {
        let capacity = |remaining: f32| ((remaining - 2.0 * PADDING) / LINE_HEIGHT).floor();
        if capacity(self.remaining()) < 1.0 {
            self.new_page();
        }
        let fit = capacity(self.remaining()).max(1.0) as usize;
        wanted.min(fit)
    }

    fn rect(&mut self, x: f32, y: f32, w: f32, h: f32, fill: bool) {
        let ops = self.ops();
        ops.push(Operation::new("q", vec![]));
        ops.push(Operation::new("w", vec![0.5f32.into()]));
        if fill {
            ops.push(Operation::new(
                "rg",
                HEADER_FILL.iter().map(|c| (*c).into()).collect(),
            ));
        }
        ops.push(Operation::new(
            "re",
            vec![x.into(), y.into(), w.into(), h.into()],
        ));
        ops.push(Operation::new(if fill { "B" } else { "S" }, vec![]));
        ops.push(Operation::new("Q", vec![]));
    }

    fn text(&mut self, face: Face, size: f32, x: f32, y: f32, text: &str) {
        if text.is_empty() {
            return;
        }
        let glyphs = self.fonts.encode(face, text);
        let ops = self.ops();
        ops.push(Operation::new("BT", vec![]));
        ops.push(Operation::new(
            "Tf",
            vec![Object::Name(face.resource_name().as_bytes().to_vec()), size.into()],
        ));
        ops.push(Operation::new("Td", vec![x.into(), y.into()]));
        ops.push(Operation::new(
            "Tj",
            vec![Object::String(glyphs, StringFormat::Hexadecimal)],
        ));
        ops.push(Operation::new("ET", vec![]));
    }

    pub(crate) fn finish(self) -> (Vec<Vec<Operation>>, FontSet<'f>) {
        (self.pages, self.fonts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fonts::ReportFonts;

    fn left(text: &str) -> Cell<'_> {
        Cell {
            text,
            face: Face::Regular,
            align: Align::Left,
        }
    }

    fn pages_of(fonts: &ReportFonts, draw: impl FnOnce(&mut PageWriter<'_>)) -> Vec<Vec<Operation>> {
        let mut writer = PageWriter::new(FontSet::load(fonts).unwrap());
        draw(&mut writer);
        writer.finish().0
    }

    fn rects(ops: &[Operation]) -> Vec<[f32; 4]> {
        ops.iter()
            .filter(|op| op.operator == "re")
            .map(|op| {
                let v: Vec<f32> = op.operands.iter().map(|o| o.as_float().unwrap()).collect();
                [v[0], v[1], v[2], v[3]]
            })
            .collect()
    }

    #[test]
    fn row_columns_split_twenty_sixty_twenty() {
        let fonts = ReportFonts::bundled();
        let pages = pages_of(&fonts, |w| {
            w.row([left("Access"), left("Is MFA enforced?"), left("Pass")], false)
        });
        let boxes = rects(&pages[0]);
        assert_eq!(boxes.len(), 3);
        let usable = PageWriter::usable_width();
        let mut x = MARGIN_X;
        for (rect, share) in boxes.iter().zip([0.2f32, 0.6, 0.2]) {
            assert!((rect[0] - x).abs() < 1e-3);
            assert!((rect[2] - share * usable).abs() < 1e-3);
            x += rect[2];
        }
        assert!((x - (PAGE_WIDTH - MARGIN_X)).abs() < 1e-3);
        // cells of one row share top edge and height
        assert!(boxes.iter().all(|r| r[1] == boxes[0][1] && r[3] == boxes[0][3]));
    }

    #[test]
    fn text_is_drawn_as_glyph_ids() {
        let fonts = ReportFonts::bundled();
        let pages = pages_of(&fonts, |w| w.block("Доступ", Face::Regular, false));
        let tj: Vec<&Operation> = pages[0].iter().filter(|op| op.operator == "Tj").collect();
        assert_eq!(tj.len(), 1);
        match &tj[0].operands[0] {
            Object::String(bytes, StringFormat::Hexadecimal) => assert_eq!(bytes.len(), 12),
            other => panic!("unexpected operand {other:?}"),
        }
    }

    #[test]
    fn long_block_continues_on_next_page() {
        let fonts = ReportFonts::bundled();
        let text = (0..200)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let pages = pages_of(&fonts, |w| w.block(&text, Face::Regular, false));
        assert!(pages.len() >= 3);
        assert!(pages.iter().all(|ops| !ops.is_empty()));
    }

    #[test]
    fn tall_row_is_split_across_pages() {
        let fonts = ReportFonts::bundled();
        let tall = vec!["word"; 400].join("\n");
        let pages = pages_of(&fonts, |w| {
            w.row([left("Access"), left(&tall), left("Pass")], false)
        });
        assert!(pages.len() >= 6);
        assert!(pages.iter().all(|ops| !ops.is_empty()));
    }

    #[test]
    fn short_content_stays_on_one_page() {
        let fonts = ReportFonts::bundled();
        let pages = pages_of(&fonts, |w| {
            w.title("Report");
            w.row([left("a"), left("b"), left("c")], true);
            w.block("hello", Face::Regular, false);
        });
        assert_eq!(pages.len(), 1);
    }
}
