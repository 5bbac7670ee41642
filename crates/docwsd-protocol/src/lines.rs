//! Line and token helpers.

/// Maximum number of characters kept by [`abbreviate`].
const ABBREVIATED_LENGTH: usize = 500;

/// Return the bytes of `payload` up to (not including) the first newline.
pub fn first_line(payload: &[u8]) -> &[u8] {
    match payload.iter().position(|&b| b == b'\n') {
        Some(end) => &payload[..end],
        None => payload,
    }
}

/// Split a line on spaces, trimming tokens and dropping empty ones.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split(' ')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .collect()
}

/// Parse a `name=<integer>` token.
///
/// Returns `None` when the token has a different name or the value is not an
/// integer.
pub fn token_integer(token: &str, name: &str) -> Option<i64> {
    let value = token.strip_prefix(name)?.strip_prefix('=')?;
    value.parse().ok()
}

/// Render the first line of a payload for logging, shortened when long.
pub fn abbreviate(payload: &[u8]) -> String {
    let line = String::from_utf8_lossy(first_line(payload));
    let truncated = line.chars().count() > ABBREVIATED_LENGTH;
    let mut out: String = line.chars().take(ABBREVIATED_LENGTH).collect();
    if truncated || first_line(payload).len() < payload.len() {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_line_stops_at_newline() {
        assert_eq!(first_line(b"tile part=0\nbody"), b"tile part=0");
        assert_eq!(first_line(b"status"), b"status");
        assert_eq!(first_line(b""), b"");
        assert_eq!(first_line(b"\nrest"), b"");
    }

    #[test]
    fn test_tokenize_ignores_repeated_spaces() {
        assert_eq!(
            tokenize("  nextmessage:   size=10 "),
            vec!["nextmessage:", "size=10"]
        );
        assert!(tokenize("   ").is_empty());
    }

    #[test]
    fn test_token_integer() {
        assert_eq!(token_integer("size=10", "size"), Some(10));
        assert_eq!(token_integer("size=-3", "size"), Some(-3));
        assert_eq!(token_integer("size=", "size"), None);
        assert_eq!(token_integer("size=ten", "size"), None);
        assert_eq!(token_integer("sizes=10", "size"), None);
        assert_eq!(token_integer("part=10", "size"), None);
    }

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate(b"status"), "status");
        assert_eq!(abbreviate(b"tile: part=0\n\x89PNG"), "tile: part=0...");

        let long = "x".repeat(ABBREVIATED_LENGTH + 20);
        let short = abbreviate(long.as_bytes());
        assert_eq!(short.len(), ABBREVIATED_LENGTH + 3);
        assert!(short.ends_with("..."));
    }
}
