//! Rolling exit-signal history
//!
//! Three bounded sequences of loop numbers, persisted in `.exit_signals`.
//! Each sequence keeps only the five most recent entries; insertion is
//! always at the tail with the oldest entry evicted. Sequences are strictly
//! non-decreasing because loop numbers only grow within a session.

use crate::state_files::{self, FileResult, EXIT_SIGNALS_FILE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Maximum entries retained per sequence
const HISTORY_CAP: usize = 5;

/// Bounded history of exit-related signals across loops
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExitSignalHistory {
    /// Loops classified as test-only work
    pub test_only_loops: Vec<u32>,
    /// Loops that produced a completion signal
    pub done_signals: Vec<u32>,
    /// Loops whose structured block reported STATUS: COMPLETE
    pub completion_indicators: Vec<u32>,
}

impl ExitSignalHistory {
    fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(EXIT_SIGNALS_FILE)
    }

    /// Load the history, falling back to empty on absence or corruption
    pub fn load(project_dir: &Path) -> Self {
        state_files::recover(&Self::path(project_dir)).unwrap_or_default()
    }

    /// Persist the history
    pub fn store(&self, project_dir: &Path) -> FileResult<()> {
        state_files::store(&Self::path(project_dir), self)
    }

    /// Record signals observed for one loop
    pub fn record(
        &mut self,
        loop_number: u32,
        test_only: bool,
        done_signal: bool,
        completion_indicator: bool,
    ) {
        if test_only {
            push_capped(&mut self.test_only_loops, loop_number);
        }
        if done_signal {
            push_capped(&mut self.done_signals, loop_number);
        }
        if completion_indicator {
            push_capped(&mut self.completion_indicators, loop_number);
        }
    }

    /// Whether a sequence's tail is `count` consecutive loop numbers ending
    /// at `current_loop`.
    pub fn tail_is_consecutive(sequence: &[u32], count: usize, current_loop: u32) -> bool {
        if count == 0 || sequence.len() < count {
            return false;
        }

        let tail = &sequence[sequence.len() - count..];
        if *tail.last().unwrap_or(&0) != current_loop {
            return false;
        }

        tail.windows(2).all(|pair| pair[1] == pair[0] + 1)
    }
}

fn push_capped(sequence: &mut Vec<u32>, loop_number: u32) {
    sequence.push(loop_number);
    if sequence.len() > HISTORY_CAP {
        sequence.remove(0);
    }
}
