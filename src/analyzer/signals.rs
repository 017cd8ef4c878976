//! Textual completion and work-type signals
//!
//! Pattern matching over raw agent output. Matching is case-insensitive
//! throughout; completion keywords are only honored near the end of the
//! output so early plan text ("when this is done...") does not trigger
//! false positives.

use regex::Regex;
use std::sync::OnceLock;

/// Completion phrases an agent may emit in free text
const COMPLETION_KEYWORDS: &[&str] = &[
    "complete",
    "completed",
    "finished",
    "done",
    "ready for review",
    "all tests pass",
    "implementation complete",
];

static TEST_LINE_REGEX: OnceLock<Regex> = OnceLock::new();
static FILE_MOD_REGEX: OnceLock<Regex> = OnceLock::new();

/// Lines that indicate a test execution rather than substantive edits
fn test_line_regex() -> &'static Regex {
    TEST_LINE_REGEX.get_or_init(|| {
        Regex::new(
            r"(?i)(cargo test|npm test|bun test|pytest|go test|jest|vitest|^\s*Running tests|^\s*PASS\b|^\s*FAIL\b|\d+\s+passing|\d+\s+failing|\d+\s+passed|\d+\s+failed)",
        )
        .unwrap()
    })
}

/// Lines that indicate files being created or changed
fn file_mod_regex() -> &'static Regex {
    FILE_MOD_REGEX.get_or_init(|| {
        Regex::new(r"(?i)\b(created|wrote|writing|modified|edited|deleted|added)\b").unwrap()
    })
}

/// Check the tail of the output for completion keywords.
///
/// Only the last 20% of lines (at least one) are considered.
pub fn has_completion_keywords(output: &str) -> bool {
    let lines: Vec<&str> = output.lines().collect();
    if lines.is_empty() {
        return false;
    }

    let tail_len = (lines.len() / 5).max(1);
    let tail = &lines[lines.len() - tail_len..];

    for line in tail {
        let lowered = line.to_lowercase();
        if COMPLETION_KEYWORDS.iter().any(|kw| lowered.contains(kw)) {
            return true;
        }
    }

    false
}

/// Whether the only work indicators in the output are test executions.
///
/// True iff at least one line matches a test-execution pattern and no line
/// matches a file-modification verb.
pub fn is_test_only(output: &str) -> bool {
    let mut saw_test_line = false;

    for line in output.lines() {
        if file_mod_regex().is_match(line) {
            return false;
        }
        if test_line_regex().is_match(line) {
            saw_test_line = true;
        }
    }

    saw_test_line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_keywords_at_tail() {
        let output = "planning\nworking\nstill working\nmore work\nTask is complete";
        assert!(has_completion_keywords(output));
    }

    #[test]
    fn test_completion_keywords_ignored_early_in_output() {
        let mut output = String::from("The work will be done when tests pass\n");
        for i in 0..20 {
            output.push_str(&format!("step {}\n", i));
        }
        assert!(!has_completion_keywords(&output));
    }

    #[test]
    fn test_completion_keywords_case_insensitive() {
        assert!(has_completion_keywords("READY FOR REVIEW"));
        assert!(has_completion_keywords("Finished"));
    }

    #[test]
    fn test_empty_output_has_no_signals() {
        assert!(!has_completion_keywords(""));
        assert!(!is_test_only(""));
    }

    #[test]
    fn test_test_only_with_runner_output() {
        let output = "Running tests\nPASS src/lib.rs\n12 passed, 0 failed";
        assert!(is_test_only(output));
    }

    #[test]
    fn test_not_test_only_when_files_modified() {
        let output = "Running tests\nmodified src/lib.rs\n12 passed";
        assert!(!is_test_only(output));
    }

    #[test]
    fn test_not_test_only_without_test_lines() {
        let output = "thinking about the problem\nreading code";
        assert!(!is_test_only(output));
    }
}
