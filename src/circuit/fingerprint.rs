//! Error fingerprinting for stagnation detection
//!
//! Two agent failures count as "the same error" when their normalized last
//! error line hashes identically. Normalization case-folds, collapses
//! whitespace, and redacts numbers and path-like tokens so line/column
//! drift or rebuilt temp paths do not defeat repetition detection.

use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

static ERROR_LINE_REGEX: OnceLock<Regex> = OnceLock::new();
static NUMBER_REGEX: OnceLock<Regex> = OnceLock::new();

fn error_line_regex() -> &'static Regex {
    ERROR_LINE_REGEX.get_or_init(|| {
        Regex::new(r"(?i)\b(error|panic|panicked|exception|fatal|traceback)\b").unwrap()
    })
}

fn number_regex() -> &'static Regex {
    NUMBER_REGEX.get_or_init(|| Regex::new(r"\d+").unwrap())
}

/// The last non-empty line of output that looks like an error
pub fn extract_error_line(output: &str) -> Option<String> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty() && error_line_regex().is_match(line))
        .map(|line| line.to_string())
}

/// Normalize an error line for fingerprinting
fn normalize(line: &str) -> String {
    let lowered = line.to_lowercase();

    let redacted: Vec<String> = lowered
        .split_whitespace()
        .map(|token| {
            if token.contains('/') || token.contains('\\') {
                "PATH".to_string()
            } else {
                number_regex().replace_all(token, "N").to_string()
            }
        })
        .collect();

    redacted.join(" ")
}

/// Fixed-width digest of a normalized error line
pub fn fingerprint(line: &str) -> String {
    let mut hasher = DefaultHasher::new();
    normalize(line).hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
