//! Prompt size estimation.
//!
//! Budgets are expressed in estimated tokens at roughly four characters
//! each, counted in chars so multi-byte text is not over-charged.

/// Estimated token cost of `text`, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_costs_nothing() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn partial_tokens_round_up() {
        assert_eq!(estimate_tokens("task"), 1);
        assert_eq!(estimate_tokens("tasks"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }

    #[test]
    fn counts_characters_not_bytes() {
        // 4 chars, 8 bytes
        assert_eq!(estimate_tokens("éèêë"), 1);
    }
}
