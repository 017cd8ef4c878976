//! Runner configuration
//!
//! Built from environment variables plus CLI flags. Environment variables
//! are read once at startup; the resulting config is immutable for the
//! lifetime of the session.

use std::path::PathBuf;
use std::time::Duration;

/// Default agent invocation budget per wall-clock hour
const DEFAULT_MAX_CALLS_PER_HOUR: u32 = 100;
/// Consecutive test-only loops that force an evidence check
const DEFAULT_MAX_CONSECUTIVE_TEST_LOOPS: usize = 3;
/// Consecutive completion signals that force an evidence check
const DEFAULT_MAX_CONSECUTIVE_DONE_SIGNALS: usize = 2;
/// Default per-invocation wall-clock timeout in minutes
pub const DEFAULT_TIMEOUT_MINUTES: u64 = 30;
/// Sleep between loops when no exit condition fired
pub const LOOP_BACKOFF_SECS: u64 = 5;

/// Configuration for a runner session
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Project directory the agent works in (state files live here)
    pub project_dir: PathBuf,
    /// Agent command line, split on whitespace (e.g. "claude -p")
    pub agent_command: String,
    /// Instruction file fed to the agent on stdin
    pub prompt_file: PathBuf,
    /// Per-invocation wall-clock timeout
    pub timeout: Duration,
    /// Safety cap on total loops (0 = unlimited)
    pub max_loops: u32,
    /// Agent invocations allowed per wall-clock hour
    pub max_calls_per_hour: u32,
    /// Consecutive test-only loops before a forced evidence check
    pub max_consecutive_test_loops: usize,
    /// Consecutive done signals before a forced evidence check
    pub max_consecutive_done_signals: usize,
    /// Suppress the evidence collector entirely (exit on signal alone)
    pub skip_evidence: bool,
    /// Suppress the test verification gate
    pub skip_tests: bool,
    /// Suppress the CLI verification gate
    pub skip_cli: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            agent_command: "claude".to_string(),
            prompt_file: PathBuf::from("PROMPT.md"),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_MINUTES * 60),
            max_loops: 0,
            max_calls_per_hour: DEFAULT_MAX_CALLS_PER_HOUR,
            max_consecutive_test_loops: DEFAULT_MAX_CONSECUTIVE_TEST_LOOPS,
            max_consecutive_done_signals: DEFAULT_MAX_CONSECUTIVE_DONE_SIGNALS,
            skip_evidence: false,
            skip_tests: false,
            skip_cli: false,
        }
    }
}

impl RunnerConfig {
    /// Build a config from the process environment, on top of defaults.
    ///
    /// CLI flags are overlaid afterwards by the binary entry point and
    /// take precedence over the environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(value) = env_u32("MAX_CALLS_PER_HOUR") {
            config.max_calls_per_hour = value;
        }
        if let Some(value) = env_usize("MAX_CONSECUTIVE_TEST_LOOPS") {
            config.max_consecutive_test_loops = value;
        }
        if let Some(value) = env_usize("MAX_CONSECUTIVE_DONE_SIGNALS") {
            config.max_consecutive_done_signals = value;
        }
        if env_flag("SKIP_TEST_VERIFICATION") {
            config.skip_tests = true;
        }
        if env_flag("SKIP_CLI_VERIFICATION") {
            config.skip_cli = true;
        }

        config
    }

    /// Agent command split into program and arguments
    pub fn agent_argv(&self) -> Vec<String> {
        self.agent_command
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }
}

fn env_u32(name: &str) -> Option<u32> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u32>() {
            Ok(value) => Some(value),
            Err(_) => {
                log::warn!("[Config] Ignoring non-numeric {}={:?}", name, raw);
                None
            }
        },
        Err(_) => None,
    }
}

fn env_usize(name: &str) -> Option<usize> {
    env_u32(name).map(|v| v as usize)
}

/// A flag variable counts as set unless it is empty, "0", or "false"
fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(raw) => {
            let normalized = raw.trim().to_lowercase();
            !(normalized.is_empty() || normalized == "0" || normalized == "false")
        }
        Err(_) => false,
    }
}
