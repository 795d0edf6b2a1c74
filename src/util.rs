//! Shared text helpers used across the codebase.

/// Maximum length of the tail preview attached to `scratchpad_updated` events.
pub const TAIL_PREVIEW_CHARS: usize = 160;

/// Truncate to at most `max_chars` characters, appending an ellipsis when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Keep the last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Last non-blank line of `text`, truncated for event payloads.
pub fn tail_preview(text: &str) -> String {
    text.lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| truncate_chars(line, TAIL_PREVIEW_CHARS))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tail_preview_skips_blank_lines() {
        let text = "# Notes\n\nfirst finding\nsecond finding\n\n   \n";
        assert_eq!(tail_preview(text), "second finding");
        assert_eq!(tail_preview("   \n\n"), "");
    }

    #[test]
    fn test_tail_preview_truncates_long_lines() {
        let long = "x".repeat(400);
        let preview = tail_preview(&long);
        assert_eq!(preview.chars().count(), TAIL_PREVIEW_CHARS);
        assert!(preview.ends_with('…'));
    }

    #[test]
    fn test_tail_chars_keeps_suffix() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }
}
