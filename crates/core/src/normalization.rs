use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CharsetPolicy {
    /// Keep every printable character, composed (NFKC).
    #[default]
    Printable,
    /// Decompose (NFKD) and keep printable ASCII only.
    AsciiOnly,
}

/// Cleans a line for layout: NBSP becomes a space, control and format
/// characters are removed, runs of whitespace collapse.
pub fn normalize_line(line: &str, policy: CharsetPolicy) -> String {
    let normalized: String = match policy {
        CharsetPolicy::Printable => line.nfkc().collect(),
        CharsetPolicy::AsciiOnly => line.nfkd().collect(),
    };
    let mut result = String::with_capacity(normalized.len());
    let mut prev_space = false;
    for ch in normalized.chars() {
        let ch = if ch == '\u{a0}' || ch == '\t' { ' ' } else { ch };
        if ch.is_whitespace() {
            if !prev_space {
                result.push(' ');
                prev_space = true;
            }
            continue;
        }
        if !is_printable(ch, policy) {
            continue;
        }
        result.push(ch);
        prev_space = false;
    }
    result.trim().to_string()
}

fn is_printable(ch: char, policy: CharsetPolicy) -> bool {
    match policy {
        CharsetPolicy::AsciiOnly => (' '..='~').contains(&ch),
        CharsetPolicy::Printable => !ch.is_control() && !is_format_char(ch),
    }
}

fn is_format_char(ch: char) -> bool {
    matches!(
        ch,
        '\u{00ad}'
            | '\u{061c}'
            | '\u{180e}'
            | '\u{200b}'..='\u{200f}'
            | '\u{202a}'..='\u{202e}'
            | '\u{2060}'..='\u{2064}'
            | '\u{2066}'..='\u{206f}'
            | '\u{feff}'
            | '\u{fff9}'..='\u{fffb}'
    ) || is_combining_mark(ch)
}

// left over after NFKC only when no precomposed form exists
fn is_combining_mark(ch: char) -> bool {
    matches!(ch, '\u{0300}'..='\u{036f}' | '\u{20d0}'..='\u{20ff}' | '\u{fe20}'..='\u{fe2f}')
}

/// Normalizes each line and breaks words longer than `max_line_length`
/// characters into pieces. Line structure is kept; blank lines collapse.
pub fn wrap_text(text: &str, max_line_length: usize, policy: CharsetPolicy) -> String {
    let max_len = max_line_length.max(1);
    let mut lines = Vec::new();
    let mut last_blank = true;
    for raw in text.lines() {
        let line = normalize_line(raw, policy);
        if line.is_empty() {
            if !last_blank {
                lines.push(String::new());
            }
            last_blank = true;
            continue;
        }
        let words: Vec<String> = line
            .split(' ')
            .flat_map(|word| split_long_word(word, max_len))
            .collect();
        lines.push(words.join(" "));
        last_blank = false;
    }
    while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }
    lines.join("\n")
}

fn split_long_word(word: &str, max_len: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    if chars.len() <= max_len {
        return vec![word.to_string()];
    }
    chars
        .chunks(max_len)
        .map(|piece| piece.iter().collect())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_whitespace_and_nbsp() {
        let line = "  MFA\u{a0}is\t\trequired  ";
        assert_eq!(normalize_line(line, CharsetPolicy::Printable), "MFA is required");
    }

    #[test]
    fn strips_control_and_format_characters() {
        let line = "Rating:\u{7}\u{200b} Pass\u{1b}";
        assert_eq!(normalize_line(line, CharsetPolicy::Printable), "Rating: Pass");
    }

    #[test]
    fn keeps_non_ascii_unless_ascii_only() {
        let line = "Politique de sécurité – résumé";
        assert_eq!(normalize_line(line, CharsetPolicy::Printable), line);
        assert_eq!(
            normalize_line(line, CharsetPolicy::AsciiOnly),
            "Politique de securite resume"
        );
    }

    #[test]
    fn breaks_long_words() {
        let wrapped = wrap_text(&"x".repeat(25), 10, CharsetPolicy::Printable);
        assert_eq!(wrapped, format!("{} {} {}", "x".repeat(10), "x".repeat(10), "x".repeat(5)));
    }

    #[test]
    fn keeps_line_structure() {
        let text = "The policy mandates MFA.\n\n\n\nRating: Pass\n\n";
        assert_eq!(
            wrap_text(text, 100, CharsetPolicy::Printable),
            "The policy mandates MFA.\n\nRating: Pass"
        );
    }
}
