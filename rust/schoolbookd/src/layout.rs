//! Paragraph layout for certificates: glyph metrics for the standard PDF
//! Helvetica faces, greedy line packing, and justification.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Font {
    Helvetica,
    HelveticaBold,
}

impl Font {
    pub fn base_name(self) -> &'static str {
        match self {
            Font::Helvetica => "Helvetica",
            Font::HelveticaBold => "Helvetica-Bold",
        }
    }

    pub fn resource(self) -> &'static str {
        match self {
            Font::Helvetica => "F1",
            Font::HelveticaBold => "F2",
        }
    }
}

// Advance widths in 1/1000 em for U+0020..=U+007E (Adobe core font metrics).
#[rustfmt::skip]
const HELVETICA_WIDTHS: [u16; 95] = [
    278, 278, 355, 556, 556, 889, 667, 191, 333, 333, 389, 584, 278, 333, 278, 278,
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 278, 278, 584, 584, 584, 556,
    1015, 667, 667, 722, 722, 667, 611, 778, 722, 278, 500, 667, 556, 833, 722, 778,
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 278, 278, 278, 469, 556,
    333, 556, 556, 500, 556, 556, 278, 556, 556, 222, 222, 500, 222, 833, 556, 556,
    556, 556, 333, 500, 278, 556, 500, 722, 500, 500, 500, 334, 260, 334, 584,
];

#[rustfmt::skip]
const HELVETICA_BOLD_WIDTHS: [u16; 95] = [
    278, 333, 474, 556, 556, 889, 722, 238, 333, 333, 389, 584, 278, 333, 278, 278,
    556, 556, 556, 556, 556, 556, 556, 556, 556, 556, 333, 333, 584, 584, 584, 611,
    975, 722, 722, 722, 722, 667, 611, 778, 722, 278, 556, 722, 611, 833, 722, 778,
    667, 778, 722, 667, 611, 722, 667, 944, 667, 667, 611, 333, 278, 333, 584, 556,
    333, 556, 611, 556, 611, 556, 333, 611, 611, 278, 278, 556, 278, 889, 611, 611,
    611, 611, 389, 556, 333, 611, 556, 778, 556, 556, 500, 389, 280, 389, 584,
];

fn fold_accent(c: char) -> Option<char> {
    let base = match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' => 'a',
        'é' | 'è' | 'ê' | 'ë' => 'e',
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
        'ú' | 'ù' | 'û' | 'ü' => 'u',
        'ñ' => 'n',
        'ç' => 'c',
        'Á' | 'À' | 'Â' | 'Ä' | 'Ã' => 'A',
        'É' | 'È' | 'Ê' | 'Ë' => 'E',
        'Í' | 'Ì' | 'Î' | 'Ï' => 'I',
        'Ó' | 'Ò' | 'Ô' | 'Ö' | 'Õ' => 'O',
        'Ú' | 'Ù' | 'Û' | 'Ü' => 'U',
        'Ñ' => 'N',
        'Ç' => 'C',
        _ => return None,
    };
    Some(base)
}

pub fn char_width(font: Font, c: char) -> u16 {
    let table = match font {
        Font::Helvetica => &HELVETICA_WIDTHS,
        Font::HelveticaBold => &HELVETICA_BOLD_WIDTHS,
    };
    let code = c as u32;
    if (32..=126).contains(&code) {
        return table[(code - 32) as usize];
    }
    match c {
        // Accented i is drawn on the dotless glyph, wider than plain i.
        'í' | 'ì' | 'î' | 'ï' => 278,
        '¿' => 611,
        '¡' => 333,
        '°' => 400,
        'º' | 'ª' => 365,
        '\u{a0}' => table[0],
        _ => fold_accent(c)
            .map(|b| table[(b as u32 - 32) as usize])
            .unwrap_or(556),
    }
}

pub fn text_width(font: Font, size: f64, text: &str) -> f64 {
    let units: u32 = text.chars().map(|c| char_width(font, c) as u32).sum();
    units as f64 * size / 1000.0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Span {
    pub text: String,
    pub underline: bool,
}

impl Span {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            underline: false,
        }
    }

    pub fn underlined(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            underline: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParagraphStyle {
    pub font: Font,
    pub size: f64,
    pub width: f64,
    pub first_line_indent: f64,
}

/// A run of same-style text placed on a line. `x` is relative to the
/// column's left edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub text: String,
    pub x: f64,
    pub width: f64,
    pub underline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Line {
    pub fragments: Vec<Fragment>,
    pub natural_width: f64,
    pub word_gap: f64,
    pub justified: bool,
}

#[derive(Debug, Clone)]
struct Word {
    parts: Vec<(String, bool)>,
    width: f64,
}

fn split_words(spans: &[Span], font: Font, size: f64) -> Vec<Word> {
    let mut words: Vec<Word> = Vec::new();
    let mut current: Vec<(String, bool)> = Vec::new();

    for span in spans {
        for c in span.text.chars() {
            if c.is_whitespace() {
                if !current.is_empty() {
                    words.push(finish_word(std::mem::take(&mut current), font, size));
                }
                continue;
            }
            match current.last_mut() {
                Some((text, underline)) if *underline == span.underline => text.push(c),
                _ => current.push((c.to_string(), span.underline)),
            }
        }
    }
    if !current.is_empty() {
        words.push(finish_word(current, font, size));
    }
    words
}

fn finish_word(parts: Vec<(String, bool)>, font: Font, size: f64) -> Word {
    let width = parts.iter().map(|(t, _)| text_width(font, size, t)).sum();
    Word { parts, width }
}

/// Greedy line packing. The first line is indented, every line but the last
/// is stretched to the full column width by widening the gaps between words.
/// A word wider than the column gets a line of its own.
pub fn layout_paragraph(spans: &[Span], style: &ParagraphStyle) -> Vec<Line> {
    let words = split_words(spans, style.font, style.size);
    if words.is_empty() {
        return Vec::new();
    }
    let space = text_width(style.font, style.size, " ");
    let available = |line_idx: usize| {
        if line_idx == 0 {
            (style.width - style.first_line_indent).max(0.0)
        } else {
            style.width
        }
    };

    let mut packed: Vec<Vec<Word>> = Vec::new();
    let mut current: Vec<Word> = Vec::new();
    let mut current_width = 0.0;
    for word in words {
        if current.is_empty() {
            current_width = word.width;
            current.push(word);
            continue;
        }
        if current_width + space + word.width <= available(packed.len()) + 1e-9 {
            current_width += space + word.width;
            current.push(word);
        } else {
            packed.push(std::mem::take(&mut current));
            current_width = word.width;
            current.push(word);
        }
    }
    packed.push(current);

    let line_count = packed.len();
    packed
        .into_iter()
        .enumerate()
        .map(|(i, line_words)| {
            let indent = if i == 0 { style.first_line_indent } else { 0.0 };
            let natural: f64 = line_words.iter().map(|w| w.width).sum::<f64>()
                + space * (line_words.len().saturating_sub(1)) as f64;
            let last = i + 1 == line_count;
            let justified = !last && line_words.len() > 1;
            let gap = if justified {
                space + (available(i) - natural).max(0.0) / (line_words.len() - 1) as f64
            } else {
                space
            };

            let mut x = indent;
            let mut fragments = Vec::new();
            for word in line_words {
                for (text, underline) in word.parts {
                    let width = text_width(style.font, style.size, &text);
                    fragments.push(Fragment {
                        text,
                        x,
                        width,
                        underline,
                    });
                    x += width;
                }
                x += gap;
            }

            Line {
                fragments,
                natural_width: natural,
                word_gap: gap,
                justified,
            }
        })
        .collect()
}

/// Left edge that centers `text` inside `[0, width]`.
pub fn centered_x(font: Font, size: f64, text: &str, width: f64) -> f64 {
    ((width - text_width(font, size, text)) / 2.0).max(0.0)
}

/// Truncates `text` with "..." so it fits in `width`.
pub fn fit_text(font: Font, size: f64, text: &str, width: f64) -> String {
    if text_width(font, size, text) <= width {
        return text.to_string();
    }
    let ellipsis = "...";
    let budget = width - text_width(font, size, ellipsis);
    let mut out = String::new();
    let mut used = 0.0;
    for c in text.chars() {
        let w = char_width(font, c) as f64 * size / 1000.0;
        if used + w > budget {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push_str(ellipsis);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn style(width: f64, indent: f64) -> ParagraphStyle {
        ParagraphStyle {
            font: Font::Helvetica,
            size: 10.0,
            width,
            first_line_indent: indent,
        }
    }

    fn line_right_edge(line: &Line) -> f64 {
        let last = line.fragments.last().expect("fragment");
        last.x + last.width
    }

    #[test]
    fn widths_follow_core_metrics() {
        assert_eq!(char_width(Font::Helvetica, 'A'), 667);
        assert_eq!(char_width(Font::Helvetica, 'i'), 222);
        assert_eq!(char_width(Font::HelveticaBold, 'i'), 278);
        assert_eq!(char_width(Font::Helvetica, 'é'), 556);
        assert_eq!(char_width(Font::Helvetica, 'Ñ'), 722);
        assert!((text_width(Font::Helvetica, 12.0, "AA") - 16.008).abs() < 1e-9);
    }

    #[test]
    fn short_text_stays_on_one_left_aligned_line() {
        let lines = layout_paragraph(&[Span::plain("hola mundo")], &style(500.0, 0.0));
        assert_eq!(lines.len(), 1);
        assert!(!lines[0].justified);
        assert_eq!(lines[0].fragments.len(), 2);
        assert_eq!(lines[0].fragments[0].x, 0.0);
    }

    #[test]
    fn non_final_lines_are_justified_to_the_column() {
        let text = "uno dos tres cuatro cinco seis siete ocho nueve diez once doce trece catorce";
        let st = style(120.0, 0.0);
        let lines = layout_paragraph(&[Span::plain(text)], &st);
        assert!(lines.len() > 2);
        for line in &lines[..lines.len() - 1] {
            assert!(line.justified);
            assert!((line_right_edge(line) - st.width).abs() < 1e-6);
        }
        let last = lines.last().expect("last line");
        assert!(!last.justified);
        assert!(line_right_edge(last) <= st.width + 1e-6);
    }

    #[test]
    fn first_line_is_indented() {
        let text = "alfa beta gamma delta epsilon zeta eta theta iota kappa lambda";
        let lines = layout_paragraph(&[Span::plain(text)], &style(100.0, 20.0));
        assert!(lines.len() > 1);
        assert_eq!(lines[0].fragments[0].x, 20.0);
        assert_eq!(lines[1].fragments[0].x, 0.0);
        assert!((line_right_edge(&lines[0]) - 100.0).abs() < 1e-6);
    }

    #[test]
    fn underline_spans_mix_inside_a_word() {
        let spans = vec![
            Span::plain("el estudiante "),
            Span::underlined("PEREZ"),
            Span::plain(", titular"),
        ];
        let lines = layout_paragraph(&spans, &style(400.0, 0.0));
        let frags = &lines[0].fragments;
        let texts: Vec<(&str, bool)> = frags.iter().map(|f| (f.text.as_str(), f.underline)).collect();
        assert_eq!(
            texts,
            vec![
                ("el", false),
                ("estudiante", false),
                ("PEREZ", true),
                (",", false),
                ("titular", false)
            ]
        );
        // The comma is glued to the name with no gap.
        assert!((frags[3].x - (frags[2].x + frags[2].width)).abs() < 1e-9);
    }

    #[test]
    fn oversized_word_gets_its_own_line() {
        let lines = layout_paragraph(
            &[Span::plain("a supercalifragilisticoespialidoso b")],
            &style(40.0, 0.0),
        );
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].fragments.len(), 1);
        assert!(!lines[1].justified);
    }

    #[test]
    fn empty_input_has_no_lines() {
        assert!(layout_paragraph(&[Span::plain("   ")], &style(100.0, 0.0)).is_empty());
    }

    #[test]
    fn fit_text_truncates_with_ellipsis() {
        let s = fit_text(Font::Helvetica, 10.0, "RODRIGUEZ GONZALEZ MARIA ALEJANDRA", 60.0);
        assert!(s.ends_with("..."));
        assert!(text_width(Font::Helvetica, 10.0, &s) <= 60.0);
    }
}
