//! Thinking-trace extraction and assistant text composition.
//!
//! Responses may carry a reasoning span wrapped in `<think>`/`</think>` ahead of
//! the final answer. The span is pulled apart here and re-wrapped according to
//! the configured [`ThinkingMode`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static THINK_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<think>\s*(.*?)\s*</think>\s*(.*)").expect("think regex should be valid")
});

/// How the assistant turn is rendered with respect to the thinking trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingMode {
    /// `<think>\n{trajectory}\n</think>\n\n{attempt}`
    IncludeTrace,
    /// `{attempt}` with no thinking wrapper at all.
    Strip,
    /// `<think>\n\n</think>\n\n{attempt}`, keeping the structural tokens.
    EmptyTrace,
}

impl ThinkingMode {
    /// Resolve the launcher's `think_flag` / `base_flag` pair.
    ///
    /// `think_flag` wins over `base_flag` when both are set.
    #[must_use]
    pub fn from_flags(think_flag: bool, base_flag: bool) -> Self {
        if think_flag {
            Self::IncludeTrace
        } else if base_flag {
            Self::Strip
        } else {
            Self::EmptyTrace
        }
    }
}

/// A response split into its reasoning span and its final answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThinkingSplit {
    pub trajectory: String,
    pub attempt: String,
    /// False when the delimiters were not found and the whole response became the attempt.
    pub delimiters_found: bool,
}

impl ThinkingSplit {
    /// Split a raw response. Never fails: a response without delimiters yields an
    /// empty trajectory and the normalized response as the attempt.
    #[must_use]
    pub fn from_response(response: &str) -> Self {
        let response = normalize_response(response);

        match THINK_REGEX.captures(&response) {
            Some(caps) => Self {
                trajectory: caps.get(1).map_or("", |m| m.as_str()).trim().to_string(),
                attempt: caps.get(2).map_or("", |m| m.as_str()).trim().to_string(),
                delimiters_found: true,
            },
            None => Self { trajectory: String::new(), attempt: response, delimiters_found: false },
        }
    }

    /// Compose the final assistant text for `mode`.
    #[must_use]
    pub fn compose(&self, mode: ThinkingMode) -> String {
        match mode {
            ThinkingMode::IncludeTrace => {
                format!("<think>\n{}\n</think>\n\n{}", self.trajectory, self.attempt)
            }
            ThinkingMode::Strip => self.attempt.clone(),
            ThinkingMode::EmptyTrace => format!("<think>\n\n</think>\n\n{}", self.attempt),
        }
    }
}

/// Undo JSON-escaped slashes and trim surrounding whitespace.
#[must_use]
pub fn normalize_response(response: &str) -> String {
    response.replace("\\/", "/").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_trims_both_parts() {
        let split = ThinkingSplit::from_response("<think> add them </think> 4");
        assert_eq!(split.trajectory, "add them");
        assert_eq!(split.attempt, "4");
        assert!(split.delimiters_found);
    }

    #[test]
    fn test_split_is_non_greedy_across_multiple_blocks() {
        let split = ThinkingSplit::from_response("<think>a</think>b <think>c</think> d");
        assert_eq!(split.trajectory, "a");
        assert_eq!(split.attempt, "b <think>c</think> d");
    }

    #[test]
    fn test_split_spans_newlines() {
        let split = ThinkingSplit::from_response("<think>\nline one\nline two\n</think>\n\nanswer\nmore");
        assert_eq!(split.trajectory, "line one\nline two");
        assert_eq!(split.attempt, "answer\nmore");
    }

    #[test]
    fn test_missing_delimiters_fall_back_to_full_response() {
        let split = ThinkingSplit::from_response("  just an answer  ");
        assert_eq!(split.trajectory, "");
        assert_eq!(split.attempt, "just an answer");
        assert!(!split.delimiters_found);
    }

    #[test]
    fn test_escaped_slashes_are_restored() {
        let split = ThinkingSplit::from_response(r"<think>x<\/think>see http:\/\/a");
        assert_eq!(split.trajectory, "x");
        assert_eq!(split.attempt, "see http://a");
    }

    #[test]
    fn test_compose_modes() {
        let split = ThinkingSplit::from_response("<think> add them </think> 4");
        assert_eq!(split.compose(ThinkingMode::IncludeTrace), "<think>\nadd them\n</think>\n\n4");
        assert_eq!(split.compose(ThinkingMode::EmptyTrace), "<think>\n\n</think>\n\n4");
        assert_eq!(split.compose(ThinkingMode::Strip), "4");
    }

    #[test]
    fn test_empty_trajectory_renders_empty_line() {
        let split = ThinkingSplit::from_response("<think></think>42");
        assert_eq!(split.compose(ThinkingMode::IncludeTrace), "<think>\n\n</think>\n\n42");
    }

    #[test]
    fn test_mode_from_flags() {
        assert_eq!(ThinkingMode::from_flags(true, true), ThinkingMode::IncludeTrace);
        assert_eq!(ThinkingMode::from_flags(false, true), ThinkingMode::Strip);
        assert_eq!(ThinkingMode::from_flags(false, false), ThinkingMode::EmptyTrace);
    }
}
