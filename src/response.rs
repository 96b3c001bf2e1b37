//! Normalization of raw LLM turn output.
//!
//! Providers answer the rating and ranking prompts with loosely formatted text:
//! bare numbers one per line, numbered lists (`1. 4`), or either of those behind
//! a `<think>...</think>` reasoning block. This module turns that text into
//! integer vectors and collapses free-text rationale into a single line.

use serde::{Deserialize, Serialize};

/// Closing marker of the reasoning wrapper emitted by reasoning models.
pub const REASONING_CLOSE_MARKER: &str = "</think>";

/// Opening marker of the reasoning wrapper.
pub const REASONING_OPEN_MARKER: &str = "<think>";

// =============================================================================
// Turn metadata
// =============================================================================

/// Which question a provider turn answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    Consideration,
    Policy,
    Reasoning,
}

impl TurnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnKind::Consideration => "consideration",
            TurnKind::Policy => "policy",
            TurnKind::Reasoning => "reasoning",
        }
    }
}

/// Token usage for one or more provider turns.
///
/// Cost-free (self-hosted) providers report zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}

/// Raw text of a single provider turn. Consumed immediately, never persisted.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub kind: TurnKind,
    pub text: String,
    pub usage: TokenUsage,
}

impl RawCompletion {
    pub fn new(kind: TurnKind, text: impl Into<String>, usage: TokenUsage) -> Self {
        Self {
            kind,
            text: text.into(),
            usage,
        }
    }

    pub fn ranks(&self) -> Vec<u32> {
        parse_ranks(&self.text)
    }

    pub fn reasoning(&self) -> String {
        extract_reasoning(&self.text)
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Drop everything up to and including the last reasoning closing marker.
pub fn strip_reasoning(raw: &str) -> &str {
    match raw.rfind(REASONING_CLOSE_MARKER) {
        Some(idx) => &raw[idx + REASONING_CLOSE_MARKER.len()..],
        None => raw,
    }
}

/// Extract one integer per answer line.
///
/// Each line is stripped of whitespace and reduced to the part after its last
/// `.`, so `1. 4` and `4` both yield `4`. Lines that are not then purely ASCII
/// digits are dropped without error; length mismatches are left for the
/// validator to judge.
pub fn parse_ranks(raw_text: &str) -> Vec<u32> {
    let answer = strip_reasoning(raw_text).trim();

    answer
        .lines()
        .filter_map(|line| {
            let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            let value = compact.rsplit('.').next().unwrap_or("");
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            // Digits only, so the sole failure mode is overflow.
            Some(value.parse::<u32>().unwrap_or(u32::MAX))
        })
        .collect()
}

/// Collapse a rationale answer to a single trimmed line.
pub fn extract_reasoning(raw_text: &str) -> String {
    let collapsed = raw_text.split_whitespace().collect::<Vec<_>>().join(" ");
    strip_reasoning(&collapsed).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_numbered_lines() {
        assert_eq!(parse_ranks("1. 4\n2. 1\n"), vec![4, 1]);
    }

    #[test]
    fn parses_bare_numbers() {
        assert_eq!(parse_ranks("3\n1\n2"), vec![3, 1, 2]);
    }

    #[test]
    fn discards_reasoning_wrapper() {
        let raw = "<think>\n1. 9\nI should rate 9\n</think>1. 4\n2. 1\n";
        assert_eq!(parse_ranks(raw), vec![4, 1]);
    }

    #[test]
    fn only_last_wrapper_counts() {
        let raw = "<think>a</think>7\n<think>b</think>\n5\n6";
        assert_eq!(parse_ranks(raw), vec![5, 6]);
    }

    #[test]
    fn strip_keeps_text_after_last_wrapper() {
        assert_eq!(strip_reasoning("<think>x</think>\n1. 4"), "\n1. 4");
        assert_eq!(strip_reasoning("1. 4"), "1. 4");
    }

    #[test]
    fn drops_prose_lines() {
        let raw = "Here are my ratings:\n1. 4\n2. 2\nHope this helps!";
        assert_eq!(parse_ranks(raw), vec![4, 2]);
    }

    #[test]
    fn no_digit_lines_yields_empty() {
        assert!(parse_ranks("").is_empty());
        assert!(parse_ranks("I cannot answer that.").is_empty());
        assert!(parse_ranks("1.\n2.\n").is_empty());
        assert!(parse_ranks("<think>12</think>").is_empty());
    }

    #[test]
    fn interior_whitespace_is_removed() {
        assert_eq!(parse_ranks("1 .  1 0\r\n\t2.3 "), vec![10, 3]);
    }

    #[test]
    fn signed_and_fractional_lines_are_not_digits() {
        assert_eq!(parse_ranks("-3\n+2\n4"), vec![4]);
        // "2.5" keeps only the part after the dot.
        assert_eq!(parse_ranks("2.5"), vec![5]);
    }

    #[test]
    fn overflowing_digits_saturate() {
        assert_eq!(parse_ranks("99999999999999999999"), vec![u32::MAX]);
    }

    #[test]
    fn reasoning_collapses_whitespace() {
        assert_eq!(
            extract_reasoning("  Prefer   local\n\ncontrol.  "),
            "Prefer local control."
        );
    }

    #[test]
    fn reasoning_drops_wrapper() {
        let raw = "<think>\nlong   chain\nof thought\n</think>\n\nShort answer here.";
        assert_eq!(extract_reasoning(raw), "Short answer here.");
    }

    #[test]
    fn raw_completion_helpers() {
        let raw = RawCompletion::new(TurnKind::Policy, "1. 2\n2. 1", TokenUsage::new(3, 4));
        assert_eq!(raw.ranks(), vec![2, 1]);
        assert_eq!(raw.kind.as_str(), "policy");
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(TokenUsage::new(10, 2));
        total.add(TokenUsage::new(5, 1));
        assert_eq!(total, TokenUsage::new(15, 3));
    }
}
