//! Structured status block extraction
//!
//! Agents signal machine-readable state by emitting a block delimited by
//! literal sentinel lines anywhere in their output:
//!
//! ```text
//! ---RALPH_STATUS---
//! STATUS: COMPLETE
//! EXIT_SIGNAL: true
//! ---END_RALPH_STATUS---
//! ```
//!
//! Lines between the sentinels are parsed as `KEY: VALUE` pairs. Parsing is
//! whitespace-tolerant and later keys override earlier ones. Unknown keys
//! are preserved verbatim.

use std::collections::BTreeMap;

/// Opening sentinel line for the structured status block
pub const BLOCK_START: &str = "---RALPH_STATUS---";
/// Closing sentinel line for the structured status block
pub const BLOCK_END: &str = "---END_RALPH_STATUS---";

/// Overall status values an agent may report
pub const STATUS_COMPLETE: &str = "COMPLETE";

/// Extract the structured block's key/value pairs from agent output.
///
/// Returns `None` when either sentinel is absent or the end sentinel
/// precedes the start; a malformed block is treated as plain text output.
pub fn parse_block(output: &str) -> Option<BTreeMap<String, String>> {
    let lines: Vec<&str> = output.lines().collect();

    let start = lines.iter().position(|line| line.trim() == BLOCK_START)?;
    let end = lines
        .iter()
        .skip(start + 1)
        .position(|line| line.trim() == BLOCK_END)
        .map(|offset| start + 1 + offset)?;

    let mut fields = BTreeMap::new();
    for line in &lines[start + 1..end] {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            fields.insert(key.to_string(), value.trim().to_string());
        }
    }

    Some(fields)
}

/// Whether the block carries `EXIT_SIGNAL: true`.
///
/// Values other than `true`/`false` (any case) are treated as absent.
pub fn exit_signal(fields: &BTreeMap<String, String>) -> bool {
    fields
        .get("EXIT_SIGNAL")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Whether the block reports `STATUS: COMPLETE`
pub fn status_complete(fields: &BTreeMap<String, String>) -> bool {
    fields
        .get("STATUS")
        .map(|v| v.eq_ignore_ascii_case(STATUS_COMPLETE))
        .unwrap_or(false)
}
