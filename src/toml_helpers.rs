// Small helpers for TOML parse error reporting shared by the spec registry
// and the daemon configuration loader.

use crate::error::PowermanError;

/// Look for patterns like "line N, column M" in parser error messages and
/// return (line, column) when found.
#[must_use]
pub fn extract_line_col_from_msg(msg: &str) -> Option<(usize, usize)> {
    let after = &msg[msg.find("line ")? + 5..];
    let line = leading_number(after)?;
    let after2 = &after[after.find("column ")? + 7..];
    let col = leading_number(after2)?;
    Some((line, col))
}

fn leading_number(s: &str) -> Option<usize> {
    let digits: String = s.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// Convert a byte offset in `src` into a 1-based (line, column) pair.
#[must_use]
pub fn offset_to_line_col(src: &str, offset: usize) -> (usize, usize) {
    let upto = &src[..offset.min(src.len())];
    let line = upto.matches('\n').count() + 1;
    let col = upto.rfind('\n').map_or(upto.len(), |nl| upto.len() - nl - 1) + 1;
    (line, col)
}

/// Build a `PowermanError::Config` from a TOML deserialization error,
/// prefixed with `what` (usually the file name) and the error position.
pub fn config_error(what: &str, src: &str, e: &toml::de::Error) -> PowermanError {
    let msg = e.message().trim().to_string();
    let pos = e
        .span()
        .map(|span| offset_to_line_col(src, span.start))
        .or_else(|| extract_line_col_from_msg(&e.to_string()));
    match pos {
        Some((line, col)) => {
            PowermanError::Config(format!("{what} parse error at {line}:{col}: {msg}"))
        }
        None => PowermanError::Config(format!("{what} parse error: {msg}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_line_and_column_in_message() {
        let msg = "TOML parse error at line 3, column 7\n  |\n3 | x =";
        assert_eq!(extract_line_col_from_msg(msg), Some((3, 7)));
        assert_eq!(extract_line_col_from_msg("no position here"), None);
    }

    #[test]
    fn offsets_map_to_one_based_positions() {
        let src = "a = 1\nbb = 2\n";
        assert_eq!(offset_to_line_col(src, 0), (1, 1));
        assert_eq!(offset_to_line_col(src, 6), (2, 1));
        assert_eq!(offset_to_line_col(src, 9), (2, 4));
    }
}
