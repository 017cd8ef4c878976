//! File-based state persistence for the runner
//!
//! All supervisor state lives in small JSON documents in the project
//! directory, enabling:
//! - Crash recovery (state survives a restart)
//! - Read-only observation by external dashboards
//! - Machine portability (same state on any machine with the tree)
//!
//! Every document has a single writer (the runner process) and a known
//! failure policy, so the primitives here carry the policy rather than
//! leaving it to call sites:
//! - `store` swaps a staged temp file into place, so concurrent readers
//!   never observe a partially written document.
//! - `store_durable` retries the swap once; a second failure is the
//!   controller's cue to go fatal.
//! - `load` is strict; `recover` treats a corrupt document as absent and
//!   discards it so the next store reinitializes it.

use std::fs;
use std::path::{Path, PathBuf};

/// Common file operations result type
pub type FileResult<T> = Result<T, String>;

/// Runner status snapshot, read by dashboards
pub const STATUS_FILE: &str = "status.json";
/// Live agent-invocation progress, refreshed every ~2s while executing
pub const PROGRESS_FILE: &str = "progress.json";
/// Analysis record for the most recent loop
pub const RESPONSE_ANALYSIS_FILE: &str = ".response_analysis";
/// Rolling exit-signal history (three capped sequences)
pub const EXIT_SIGNALS_FILE: &str = ".exit_signals";
/// Circuit breaker state machine snapshot
pub const CIRCUIT_STATE_FILE: &str = ".circuit_breaker_state";
/// Append-only journal of circuit transitions
pub const CIRCUIT_HISTORY_FILE: &str = ".circuit_breaker_history";
/// Verification gate records and the exit-allowed verdict
pub const EVIDENCE_FILE: &str = ".ralph_evidence.json";
/// Agent calls made during the current wall-clock hour
pub const CALL_COUNT_FILE: &str = ".call_count";
/// Epoch-hour bucket of the last rate-limit counter reset
pub const LAST_RESET_FILE: &str = ".last_reset";

/// Directory for per-loop agent logs and test runner output
pub const LOGS_DIR: &str = "logs";

/// All state files removed by a full reset, in no particular order
pub const ALL_STATE_FILES: &[&str] = &[
    STATUS_FILE,
    PROGRESS_FILE,
    RESPONSE_ANALYSIS_FILE,
    EXIT_SIGNALS_FILE,
    CIRCUIT_STATE_FILE,
    CIRCUIT_HISTORY_FILE,
    EVIDENCE_FILE,
    CALL_COUNT_FILE,
    LAST_RESET_FILE,
];

/// Get the logs directory for a project
pub fn logs_dir(project_path: &Path) -> PathBuf {
    project_path.join(LOGS_DIR)
}

/// Get the log file path for a given loop number
pub fn loop_log_path(project_path: &Path, loop_number: u32) -> PathBuf {
    logs_dir(project_path).join(format!("loop_{}.log", loop_number))
}

/// Get the test runner output log path
pub fn test_output_log_path(project_path: &Path) -> PathBuf {
    logs_dir(project_path).join("test_output.log")
}

/// Create the logs directory if needed and return it
pub fn prepare_logs_dir(project_path: &Path) -> FileResult<PathBuf> {
    let dir = logs_dir(project_path);
    fs::create_dir_all(&dir).map_err(|e| describe("create logs directory", &dir, e))?;
    Ok(dir)
}

/// One error-context convention for every filesystem touch in this module
fn describe(action: &str, path: &Path, err: impl std::fmt::Display) -> String {
    format!("{} {}: {}", action, path.display(), err)
}

/// Stage content next to the target, then swap it into place.
///
/// The rename is what readers see; the staged `.tmp` sibling is never a
/// valid document name, so a crash mid-write leaves the previous document
/// intact.
fn stage_and_swap(path: &Path, body: &str) -> FileResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| describe("create state directory", parent, e))?;
    }

    let staged = path.with_extension("tmp");
    fs::write(&staged, body).map_err(|e| describe("stage", &staged, e))?;
    fs::rename(&staged, path).map_err(|e| describe("swap in", path, e))
}

/// Atomically store a document as pretty-printed JSON
pub fn store<T: serde::Serialize>(path: &Path, document: &T) -> FileResult<()> {
    let body =
        serde_json::to_string_pretty(document).map_err(|e| describe("encode", path, e))?;
    stage_and_swap(path, &body)
}

/// Store a document, retrying the swap once.
///
/// For the controller's own bookkeeping: one retry absorbs a transient
/// hiccup, a second consecutive failure is surfaced so the caller can
/// terminate as `failed`.
pub fn store_durable<T: serde::Serialize>(path: &Path, document: &T) -> FileResult<()> {
    store(path, document).or_else(|first| {
        log::warn!("[State] Store of {} failed, retrying once: {}", path.display(), first);
        store(path, document)
    })
}

/// Load a document, treating absence and corruption as errors
pub fn load<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let body = fs::read_to_string(path).map_err(|e| describe("read", path, e))?;
    serde_json::from_str(&body).map_err(|e| describe("decode", path, e))
}

/// Load a document, treating absence and corruption as "no document".
///
/// A file that exists but fails to decode is discarded (with a logged
/// warning) so the next store reinitializes it.
pub fn recover<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    if !path.exists() {
        return None;
    }

    match load(path) {
        Ok(document) => Some(document),
        Err(e) => {
            log::warn!("[State] Discarding corrupt state file: {}", e);
            let _ = fs::remove_file(path);
            None
        }
    }
}

/// Remove every state file in the project directory.
///
/// Idempotent: missing files are skipped silently. Per-loop agent logs are
/// left in place for forensics.
pub fn reset_all(project_path: &Path) -> FileResult<()> {
    for name in ALL_STATE_FILES {
        let path = project_path.join(name);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| describe("remove", &path, e))?;
            log::debug!("[State] Removed {}", path.display());
        }
    }
    Ok(())
}
