//! Live progress publishing while the agent subprocess runs
//!
//! A background task tails the in-progress agent log and refreshes
//! `progress.json` every 2 seconds so observers can watch a long
//! invocation without touching the agent's log file. The task is cancelled
//! deterministically when the subprocess terminates, and the snapshot is
//! reset to `idle` on the way out.

use crate::clock;
use crate::state_files::{self, PROGRESS_FILE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Refresh cadence for the progress snapshot
const REFRESH_INTERVAL: Duration = Duration::from_secs(2);
/// Maximum characters of log tail carried in the snapshot
const TAIL_MAX_CHARS: usize = 600;
/// Lines of log tail carried in the snapshot
const TAIL_LINES: usize = 12;

/// The `progress.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// "executing" while an agent runs, "idle" otherwise
    pub status: String,
    pub loop_number: u32,
    pub elapsed_seconds: u64,
    pub last_output: String,
    pub updated_at: String,
}

impl ProgressSnapshot {
    fn executing(loop_number: u32, elapsed: Duration, last_output: String) -> Self {
        Self {
            status: "executing".to_string(),
            loop_number,
            elapsed_seconds: elapsed.as_secs(),
            last_output,
            updated_at: clock::now_rfc3339(),
        }
    }

    fn idle(loop_number: u32) -> Self {
        Self {
            status: "idle".to_string(),
            loop_number,
            elapsed_seconds: 0,
            last_output: String::new(),
            updated_at: clock::now_rfc3339(),
        }
    }
}

/// Write an idle snapshot immediately (used on shutdown paths)
pub fn write_idle(project_dir: &Path, loop_number: u32) {
    let path = project_dir.join(PROGRESS_FILE);
    if let Err(e) = state_files::store(&path, &ProgressSnapshot::idle(loop_number)) {
        log::warn!("[Progress] Failed to write idle snapshot: {}", e);
    }
}

/// Last few lines of the log, bounded in size and UTF-8 safe
pub fn tail_of_log(log_path: &Path) -> String {
    let content = std::fs::read_to_string(log_path).unwrap_or_default();
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(TAIL_LINES);
    let tail = lines[start..].join("\n");

    if tail.chars().count() <= TAIL_MAX_CHARS {
        return tail;
    }
    let skip = tail.chars().count() - TAIL_MAX_CHARS;
    tail.chars().skip(skip).collect()
}

/// Spawn the progress writer for one agent invocation.
///
/// The task refreshes `progress.json` until a value is sent on `stop_rx`
/// (or the sender is dropped), then writes the idle snapshot and exits.
pub fn spawn_progress_writer(
    project_dir: PathBuf,
    log_path: PathBuf,
    loop_number: u32,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        let path = project_dir.join(PROGRESS_FILE);
        let mut ticker = tokio::time::interval(REFRESH_INTERVAL);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = ProgressSnapshot::executing(
                        loop_number,
                        started.elapsed(),
                        tail_of_log(&log_path),
                    );
                    if let Err(e) = state_files::store(&path, &snapshot) {
                        log::warn!("[Progress] Failed to write snapshot: {}", e);
                    }
                }
                changed = stop_rx.changed() => {
                    // Stop on signal or on a dropped sender
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        write_idle(&project_dir, loop_number);
    })
}
