// ── Token Estimation ───────────────────────────────────────────────────────
// Single source of truth for token estimation across the memory core.
// The core operates on text (not raw tokens), so counts are estimated from
// character length at CHARS_PER_TOKEN. Budget math in the context assembler
// uses the same ratio, so section budgets and stored token counts agree.

use crate::atoms::constants::CHARS_PER_TOKEN;

/// Estimate the number of tokens in a string.
/// Uses char count (not byte count) so CJK/emoji text is not overcounted.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN).max(1)
}

/// How many characters fit in a given token budget.
pub fn chars_for_tokens(tokens: usize) -> usize {
    tokens * CHARS_PER_TOKEN
}

/// Truncate text to fit within a token budget, respecting UTF-8 boundaries.
/// Prefers a whitespace break when one exists past the halfway point.
pub fn truncate_to_budget(text: &str, max_tokens: usize) -> &str {
    if count_tokens(text) <= max_tokens {
        return text;
    }

    let max_chars = chars_for_tokens(max_tokens);
    let mut end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());

    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }

    if let Some(last_space) = text[..end].rfind(|c: char| c.is_whitespace()) {
        if last_space > end / 2 {
            end = last_space;
        }
    }

    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_is_zero() {
        assert_eq!(count_tokens(""), 0);
    }

    #[test]
    fn short_text_is_at_least_one() {
        assert_eq!(count_tokens("a"), 1);
    }

    #[test]
    fn four_chars_per_token() {
        assert_eq!(count_tokens(&"a".repeat(400)), 100);
        assert_eq!(count_tokens(&"a".repeat(401)), 101);
    }

    #[test]
    fn truncate_fits_budget() {
        let text = "The quick brown fox jumps over the lazy dog";
        let truncated = truncate_to_budget(text, 5);
        assert!(count_tokens(truncated) <= 5);
        assert!(!truncated.is_empty());
    }

    #[test]
    fn truncate_no_op_when_within_budget() {
        let text = "Hello";
        assert_eq!(truncate_to_budget(text, 100), text);
    }

    #[test]
    fn truncate_is_unicode_safe() {
        let text = "你好世界🌍".repeat(20);
        let truncated = truncate_to_budget(&text, 3);
        assert!(truncated.is_char_boundary(truncated.len()));
    }
}
