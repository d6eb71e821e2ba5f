/// Normalize extracted text before metric parsing and storage.
///
/// Control characters are dropped, Unicode spaces and minus signs folded
/// to ASCII, horizontal whitespace collapsed, lines trimmed and empty lines
/// removed. Line order is preserved.
pub fn sanitize_extracted_text(raw: &str) -> String {
    raw.lines()
        .map(clean_line)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn clean_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut pending_space = false;

    for c in line.chars() {
        let c = match c {
            '\u{00A0}' | '\u{2007}' | '\u{202F}' | '\t' => ' ',
            '\u{2212}' => '-',
            '\u{FB01}' => {
                push_pending(&mut out, &mut pending_space);
                out.push_str("fi");
                continue;
            }
            '\u{FB02}' => {
                push_pending(&mut out, &mut pending_space);
                out.push_str("fl");
                continue;
            }
            other => other,
        };

        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else if !c.is_control() && !is_invisible(c) {
            push_pending(&mut out, &mut pending_space);
            out.push(c);
        }
    }
    out
}

fn push_pending(out: &mut String, pending_space: &mut bool) {
    if *pending_space {
        out.push(' ');
        *pending_space = false;
    }
}

fn is_invisible(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{FEFF}' | '\u{00AD}')
}

/// Count of characters that carry content (letters and digits).
pub fn meaningful_chars(text: &str) -> usize {
    text.chars().filter(|c| c.is_alphanumeric()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_control_characters() {
        let clean = sanitize_extracted_text("Glucose\x00: 95\x07 mg/dL\nDate: 2024-01-15");
        assert_eq!(clean, "Glucose: 95 mg/dL\nDate: 2024-01-15");
    }

    #[test]
    fn preserves_medical_punctuation_and_units() {
        let raw = "Temp: 37.5°C, BP: 120/80 mmHg (normal) K+ 4.2 mmol/L µg/L";
        assert_eq!(sanitize_extracted_text(raw), raw);
    }

    #[test]
    fn collapses_whitespace_and_blank_lines() {
        let raw = "  Hemoglobin \t\t 13.5  g/dL  \r\n\n\n  Platelets   250  ";
        assert_eq!(sanitize_extracted_text(raw), "Hemoglobin 13.5 g/dL\nPlatelets 250");
    }

    #[test]
    fn folds_unicode_spaces_minus_and_ligatures() {
        let raw = "Pro\u{FB01}le\u{00A0}result \u{2212}2.1";
        assert_eq!(sanitize_extracted_text(raw), "Profile result -2.1");
    }

    #[test]
    fn only_control_chars_returns_empty() {
        assert_eq!(sanitize_extracted_text("\x00\x01\n\x02"), "");
        assert_eq!(sanitize_extracted_text(""), "");
    }

    #[test]
    fn meaningful_chars_ignores_punctuation() {
        assert_eq!(meaningful_chars(" -- / . \n"), 0);
        assert_eq!(meaningful_chars("HbA1c: 6.1%"), 7);
    }
}
