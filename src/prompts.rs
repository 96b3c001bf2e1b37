//! Prompt templates for the survey conversation.
//!
//! A completion is one conversation: considerations are rated first, then the
//! policies are ranked "based on your previous ratings", then (optionally) the
//! model explains itself in one line. Provider-agnostic.

use crate::survey::Statement;

/// Answer given in place of a rationale when the reasoning turn is skipped.
pub const REASONING_NOT_REQUESTED: &str = "Reasoning was not requested.";

/// Templates for one conversation.
///
/// Placeholders: `{count}` (number of statements), `{scale_max}` and
/// `{q_method}` (the q-method instruction, or nothing).
#[derive(Debug, Clone, Copy)]
pub struct SurveyPrompts {
    pub slug: &'static str,
    pub consideration: &'static str,
    pub policy: &'static str,
    pub reasoning: &'static str,
    pub q_method_instruction: &'static str,
}

pub const PROMPTS_V1: SurveyPrompts = SurveyPrompts {
    slug: "mini_public_v1",
    consideration: r#"## Instructions:
- Rate each of the {count} [Considerations] below from 1 to {scale_max}, where 1 is strongly disagree and {scale_max} is strongly agree.{q_method}
- In your response, return an ordered list of {count} ratings as integers, one rating per line following the format in the [Example output].
- Your response must have exactly {count} lines in total.
- Do NOT include any additional text in your response.

## [Example output]:
1. 1
2. 4
3. 6
4. 3

## [Considerations]:
"#,
    policy: r#"## Instructions:
- Based on your previous ratings, rank the {count} [Policies] listed below from 1 to {count}, where 1 represents the option you support the most and {count} the option you support the least.
- In your response, return an ordered list of {count} ranks as integers, one rank per line following the format in the [Example output].
- Your response must have exactly {count} lines in total.
- Do NOT include any additional text in your response.

## [Example output]:
1. 4
2. 1
3. 3
4. 2

## [Policies]:
"#,
    reasoning: r#"## Instructions:
- In a single line, explain your ratings above within 100 characters or less.
- Do not include any additional formatting, such as bullets or special characters.
- Do not include more than one space in a row.
"#,
    q_method_instruction: "\n- Using the Q Methodology, rate the statements following a Fixed Quasi-Normal Distribution between 1 and {scale_max}.",
};

pub const DEFAULT_PROMPTS: SurveyPrompts = PROMPTS_V1;

/// Numbered list in the order given (presentation order, not canonical).
pub fn format_statements(statements: &[Statement]) -> String {
    statements
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {}", i + 1, s.text))
        .collect::<Vec<_>>()
        .join("\n")
}

impl SurveyPrompts {
    pub fn consideration_prompt(&self, shown: &[Statement], scale_max: u32, q_method: bool) -> String {
        let scale = scale_max.to_string();
        let q_instr = if q_method {
            self.q_method_instruction.replace("{scale_max}", &scale)
        } else {
            String::new()
        };
        let head = self
            .consideration
            .replace("{count}", &shown.len().to_string())
            .replace("{scale_max}", &scale)
            .replace("{q_method}", &q_instr);
        head + &format_statements(shown)
    }

    pub fn policy_prompt(&self, shown: &[Statement]) -> String {
        let head = self.policy.replace("{count}", &shown.len().to_string());
        head + &format_statements(shown)
    }

    pub fn reasoning_prompt(&self) -> &'static str {
        self.reasoning
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::survey::StatementKind;

    fn statements(kind: StatementKind, texts: &[&str]) -> Vec<Statement> {
        texts
            .iter()
            .enumerate()
            .map(|(index, t)| Statement {
                kind,
                index,
                text: t.to_string(),
            })
            .collect()
    }

    #[test]
    fn consideration_prompt_fills_counts_and_scale() {
        let shown = statements(StatementKind::Consideration, &["Air", "Cost", "Jobs"]);
        let p = DEFAULT_PROMPTS.consideration_prompt(&shown, 7, false);
        assert!(p.contains("Rate each of the 3 [Considerations] below from 1 to 7"));
        assert!(p.contains("exactly 3 lines"));
        assert!(!p.contains("Q Methodology"));
        assert!(p.ends_with("1. Air\n2. Cost\n3. Jobs"));
        assert!(!p.contains('{'));
    }

    #[test]
    fn q_method_instruction_is_inserted() {
        let shown = statements(StatementKind::Consideration, &["Air"]);
        let p = DEFAULT_PROMPTS.consideration_prompt(&shown, 11, true);
        assert!(p.contains("Fixed Quasi-Normal Distribution between 1 and 11."));
    }

    #[test]
    fn policy_prompt_numbers_in_shown_order() {
        // Shown order differs from canonical index.
        let mut shown = statements(StatementKind::Policy, &["Trams", "Bikes"]);
        shown.swap(0, 1);
        let p = DEFAULT_PROMPTS.policy_prompt(&shown);
        assert!(p.contains("rank the 2 [Policies]"));
        assert!(p.ends_with("1. Bikes\n2. Trams"));
    }
}
