//! Circuit breaker over loop results
//!
//! A three-state machine that watches for stagnation (loops that neither
//! change files nor fail) and repeated identical failures. The transition
//! function is pure and separated from persistence so it can be tested as
//! a plain function over events.
//!
//! Thresholds:
//! - CLOSED -> HALF_OPEN after 2 consecutive no-progress loops
//! - HALF_OPEN -> OPEN after 3 consecutive no-progress loops
//! - HALF_OPEN -> CLOSED on any loop that modifies at least one file
//! - any state -> OPEN after 5 consecutive identical error fingerprints
//!
//! OPEN is terminal for the session; only an explicit reset re-enters
//! CLOSED.

mod fingerprint;

pub use fingerprint::{extract_error_line, fingerprint};

use crate::clock;
use crate::state_files::{self, FileResult, CIRCUIT_HISTORY_FILE, CIRCUIT_STATE_FILE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Consecutive no-progress loops that degrade CLOSED to HALF_OPEN
const NO_PROGRESS_WARN_THRESHOLD: u32 = 2;
/// Consecutive no-progress loops that open the circuit from HALF_OPEN
const NO_PROGRESS_OPEN_THRESHOLD: u32 = 3;
/// Consecutive identical error fingerprints that open the circuit
const SAME_ERROR_OPEN_THRESHOLD: u32 = 5;

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BreakerState {
    #[serde(rename = "CLOSED")]
    Closed,
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
    #[serde(rename = "OPEN")]
    Open,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::HalfOpen => "HALF_OPEN",
            BreakerState::Open => "OPEN",
        };
        write!(f, "{}", label)
    }
}

/// Persistent breaker snapshot (`.circuit_breaker_state`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub state: BreakerState,
    /// Consecutive loops with no file changes and no error
    pub no_progress_count: u32,
    /// Consecutive loops that ended in error
    pub error_count: u32,
    /// Consecutive loops whose error fingerprint matched the previous one
    pub consecutive_same_error: u32,
    pub last_error_fingerprint: Option<String>,
    pub last_transition_at: String,
    pub opened_at: Option<String>,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            no_progress_count: 0,
            error_count: 0,
            consecutive_same_error: 0,
            last_error_fingerprint: None,
            last_transition_at: clock::now_rfc3339(),
            opened_at: None,
        }
    }
}

/// One recorded state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: BreakerState,
    pub to: BreakerState,
    #[serde(rename = "loop")]
    pub loop_number: u32,
    pub reason: String,
    pub at: String,
}

/// Append-only transition journal (`.circuit_breaker_history`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CircuitHistory {
    pub transitions: Vec<TransitionRecord>,
}

/// The typed event recorded once per loop
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub loop_number: u32,
    pub files_changed: usize,
    pub had_error: bool,
    pub error_fingerprint: Option<String>,
    pub duration_ms: u64,
}

/// Whether execution may continue after recording a loop result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitDecision {
    Proceed,
    Halt,
}

/// Pure transition function: counters and state for one loop outcome.
///
/// Returns the next snapshot and, when the state changed, the transition
/// reason for the journal.
pub fn apply_outcome(
    current: &CircuitState,
    outcome: &LoopOutcome,
) -> (CircuitState, Option<String>) {
    let mut next = current.clone();

    // Counter updates. A loop only extends the no-progress streak when it
    // neither changed files nor errored.
    if outcome.had_error {
        next.error_count += 1;
        next.no_progress_count = 0;
    } else {
        next.error_count = 0;
        if outcome.files_changed == 0 {
            next.no_progress_count += 1;
        } else {
            next.no_progress_count = 0;
        }
    }

    // File changes do not clear the identical-error streak; only a
    // differing or absent fingerprint does.
    match &outcome.error_fingerprint {
        Some(fp) => {
            if current.last_error_fingerprint.as_deref() == Some(fp.as_str()) {
                next.consecutive_same_error += 1;
            } else {
                next.consecutive_same_error = 1;
            }
            next.last_error_fingerprint = Some(fp.clone());
        }
        None => {
            next.consecutive_same_error = 0;
            next.last_error_fingerprint = None;
        }
    }

    if current.state == BreakerState::Open {
        return (next, None);
    }

    let reason = if next.consecutive_same_error >= SAME_ERROR_OPEN_THRESHOLD {
        next.state = BreakerState::Open;
        Some(format!(
            "{} consecutive identical errors (fingerprint {})",
            next.consecutive_same_error,
            next.last_error_fingerprint.as_deref().unwrap_or("?")
        ))
    } else {
        match current.state {
            BreakerState::Closed if next.no_progress_count >= NO_PROGRESS_WARN_THRESHOLD => {
                next.state = BreakerState::HalfOpen;
                Some(format!(
                    "no progress for {} consecutive loops",
                    next.no_progress_count
                ))
            }
            BreakerState::HalfOpen if outcome.files_changed >= 1 => {
                next.state = BreakerState::Closed;
                Some(format!(
                    "progress resumed ({} files changed)",
                    outcome.files_changed
                ))
            }
            BreakerState::HalfOpen if next.no_progress_count >= NO_PROGRESS_OPEN_THRESHOLD => {
                next.state = BreakerState::Open;
                Some(format!(
                    "no progress for {} consecutive loops",
                    next.no_progress_count
                ))
            }
            _ => None,
        }
    };

    if next.state != current.state {
        next.last_transition_at = clock::now_rfc3339();
        if next.state == BreakerState::Open {
            next.opened_at = Some(next.last_transition_at.clone());
        }
    }

    (next, reason)
}

/// Breaker with file-backed persistence
pub struct CircuitBreaker {
    project_dir: PathBuf,
}

impl CircuitBreaker {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
        }
    }

    fn state_path(&self) -> PathBuf {
        self.project_dir.join(CIRCUIT_STATE_FILE)
    }

    fn history_path(&self) -> PathBuf {
        self.project_dir.join(CIRCUIT_HISTORY_FILE)
    }

    /// Ensure a state file exists; a corrupt file is replaced with a fresh
    /// CLOSED record.
    pub fn init(&self) -> FileResult<CircuitState> {
        match state_files::recover::<CircuitState>(&self.state_path()) {
            Some(state) => Ok(state),
            None => {
                let state = CircuitState::default();
                state_files::store(&self.state_path(), &state)?;
                Ok(state)
            }
        }
    }

    /// Current snapshot (fresh CLOSED when absent)
    pub fn current_state(&self) -> CircuitState {
        state_files::recover(&self.state_path()).unwrap_or_default()
    }

    /// The transition journal
    pub fn history(&self) -> CircuitHistory {
        state_files::recover(&self.history_path()).unwrap_or_default()
    }

    /// Record one loop result. Called exactly once per loop, after the
    /// analyzer has produced its record.
    pub fn record_loop_result(
        &self,
        loop_number: u32,
        files_changed: usize,
        had_error: bool,
        error_line: Option<&str>,
        duration_ms: u64,
    ) -> FileResult<CircuitDecision> {
        let current = self.init()?;
        let outcome = LoopOutcome {
            loop_number,
            files_changed,
            had_error,
            error_fingerprint: error_line.map(fingerprint),
            duration_ms,
        };

        let (next, reason) = apply_outcome(&current, &outcome);

        state_files::store_durable(&self.state_path(), &next)?;

        if let Some(reason) = reason {
            log::info!(
                "[Circuit] Loop {}: {} -> {} ({}) after {}ms",
                loop_number,
                current.state,
                next.state,
                reason,
                duration_ms
            );
            self.append_history(TransitionRecord {
                from: current.state,
                to: next.state,
                loop_number,
                reason,
                at: clock::now_rfc3339(),
            })?;
        }

        if next.state == BreakerState::Open {
            Ok(CircuitDecision::Halt)
        } else {
            Ok(CircuitDecision::Proceed)
        }
    }

    /// Whether the breaker currently forbids execution
    pub fn should_halt_execution(&self) -> bool {
        self.current_state().state == BreakerState::Open
    }

    /// Force the breaker back to CLOSED with zeroed counters
    pub fn reset(&self, reason: &str) -> FileResult<()> {
        let current = self.current_state();
        let fresh = CircuitState::default();
        state_files::store(&self.state_path(), &fresh)?;

        self.append_history(TransitionRecord {
            from: current.state,
            to: BreakerState::Closed,
            loop_number: 0,
            reason: reason.to_string(),
            at: clock::now_rfc3339(),
        })?;

        log::info!("[Circuit] Reset to CLOSED: {}", reason);
        Ok(())
    }

    fn append_history(&self, record: TransitionRecord) -> FileResult<()> {
        let mut history = self.history();
        history.transitions.push(record);
        state_files::store(&self.history_path(), &history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn no_progress(loop_number: u32) -> LoopOutcome {
        LoopOutcome {
            loop_number,
            files_changed: 0,
            had_error: false,
            error_fingerprint: None,
            duration_ms: 100,
        }
    }

    fn with_progress(loop_number: u32, files: usize) -> LoopOutcome {
        LoopOutcome {
            loop_number,
            files_changed: files,
            had_error: false,
            error_fingerprint: None,
            duration_ms: 100,
        }
    }

    fn with_error(loop_number: u32, line: &str) -> LoopOutcome {
        LoopOutcome {
            loop_number,
            files_changed: 0,
            had_error: true,
            error_fingerprint: Some(fingerprint(line)),
            duration_ms: 100,
        }
    }

    #[test]
    fn test_stagnation_opens_circuit_over_three_loops() {
        let mut state = CircuitState::default();

        let (next, t) = apply_outcome(&state, &no_progress(1));
        assert_eq!(next.state, BreakerState::Closed);
        assert!(t.is_none());
        state = next;

        let (next, t) = apply_outcome(&state, &no_progress(2));
        assert_eq!(next.state, BreakerState::HalfOpen);
        assert!(t.is_some());
        state = next;

        let (next, t) = apply_outcome(&state, &no_progress(3));
        assert_eq!(next.state, BreakerState::Open);
        assert_eq!(next.no_progress_count, 3);
        assert!(t.is_some());
        assert!(next.opened_at.is_some());
    }

    #[test]
    fn test_recovery_from_half_open() {
        let mut state = CircuitState::default();
        state = apply_outcome(&state, &no_progress(1)).0;
        state = apply_outcome(&state, &no_progress(2)).0;
        assert_eq!(state.state, BreakerState::HalfOpen);

        let (next, t) = apply_outcome(&state, &with_progress(3, 5));
        assert_eq!(next.state, BreakerState::Closed);
        assert_eq!(next.no_progress_count, 0);
        assert!(t.unwrap().contains("progress resumed"));
    }

    #[test]
    fn test_repeated_identical_error_opens_circuit() {
        let mut state = CircuitState::default();
        for n in 1..=4 {
            let (next, _) = apply_outcome(&state, &with_error(n, "error: same thing"));
            assert_ne!(next.state, BreakerState::Open, "opened too early at {}", n);
            state = next;
        }

        let (next, t) = apply_outcome(&state, &with_error(5, "error: same thing"));
        assert_eq!(next.consecutive_same_error, 5);
        assert_eq!(next.state, BreakerState::Open);
        assert!(t.unwrap().contains("identical errors"));
    }

    #[test]
    fn test_differing_error_resets_same_error_streak() {
        let mut state = CircuitState::default();
        state = apply_outcome(&state, &with_error(1, "error: alpha")).0;
        state = apply_outcome(&state, &with_error(2, "error: alpha")).0;
        assert_eq!(state.consecutive_same_error, 2);

        state = apply_outcome(&state, &with_error(3, "error: beta")).0;
        assert_eq!(state.consecutive_same_error, 1);

        state = apply_outcome(&state, &no_progress(4)).0;
        assert_eq!(state.consecutive_same_error, 0);
        assert!(state.last_error_fingerprint.is_none());
    }

    #[test]
    fn test_file_changes_do_not_clear_same_error_streak() {
        let mut state = CircuitState::default();
        for n in 1..=4 {
            state = apply_outcome(
                &state,
                &LoopOutcome {
                    loop_number: n,
                    files_changed: 2,
                    had_error: true,
                    error_fingerprint: Some(fingerprint("error: stuck")),
                    duration_ms: 100,
                },
            )
            .0;
        }
        assert_eq!(state.consecutive_same_error, 4);

        let (next, _) = apply_outcome(
            &state,
            &LoopOutcome {
                loop_number: 5,
                files_changed: 2,
                had_error: true,
                error_fingerprint: Some(fingerprint("error: stuck")),
                duration_ms: 100,
            },
        );
        assert_eq!(next.state, BreakerState::Open);
    }

    #[test]
    fn test_open_is_terminal_without_reset() {
        let mut state = CircuitState::default();
        for n in 1..=3 {
            state = apply_outcome(&state, &no_progress(n)).0;
        }
        assert_eq!(state.state, BreakerState::Open);

        let (next, t) = apply_outcome(&state, &with_progress(4, 10));
        assert_eq!(next.state, BreakerState::Open);
        assert!(t.is_none());
    }

    #[test]
    fn test_error_loop_resets_no_progress_streak() {
        let mut state = CircuitState::default();
        state = apply_outcome(&state, &no_progress(1)).0;
        assert_eq!(state.no_progress_count, 1);

        state = apply_outcome(&state, &with_error(2, "error: x")).0;
        assert_eq!(state.no_progress_count, 0);
        assert_eq!(state.error_count, 1);
    }

    #[test]
    fn test_breaker_persistence_and_decision() {
        let temp_dir = TempDir::new().unwrap();
        let breaker = CircuitBreaker::new(temp_dir.path());
        breaker.init().unwrap();

        assert_eq!(
            breaker.record_loop_result(1, 0, false, None, 50).unwrap(),
            CircuitDecision::Proceed
        );
        assert_eq!(
            breaker.record_loop_result(2, 0, false, None, 50).unwrap(),
            CircuitDecision::Proceed
        );
        assert_eq!(
            breaker.record_loop_result(3, 0, false, None, 50).unwrap(),
            CircuitDecision::Halt
        );

        assert!(breaker.should_halt_execution());

        let history = breaker.history();
        assert_eq!(history.transitions.len(), 2);
        assert_eq!(history.transitions[0].to, BreakerState::HalfOpen);
        assert_eq!(history.transitions[1].to, BreakerState::Open);
    }

    #[test]
    fn test_reset_reenters_closed() {
        let temp_dir = TempDir::new().unwrap();
        let breaker = CircuitBreaker::new(temp_dir.path());
        for n in 1..=3 {
            breaker.record_loop_result(n, 0, false, None, 50).unwrap();
        }
        assert!(breaker.should_halt_execution());

        breaker.reset("manual reset").unwrap();
        assert!(!breaker.should_halt_execution());

        let state = breaker.current_state();
        assert_eq!(state.no_progress_count, 0);
        assert_eq!(state.consecutive_same_error, 0);
    }

    #[test]
    fn test_init_replaces_corrupt_state_file() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(CIRCUIT_STATE_FILE), "{broken").unwrap();

        let breaker = CircuitBreaker::new(temp_dir.path());
        let state = breaker.init().unwrap();
        assert_eq!(state.state, BreakerState::Closed);
    }
}
