//! Per-hour invocation budget
//!
//! Agent calls are counted against the current wall-clock hour bucket.
//! Counters live in `.call_count` and `.last_reset` so a restarted runner
//! keeps honoring the budget. When the bucket changes both counters reset.

use crate::clock;
use crate::state_files::{self, FileResult, CALL_COUNT_FILE, LAST_RESET_FILE};
use std::path::{Path, PathBuf};

/// Whether the next agent call may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateGate {
    Proceed,
    /// Budget exhausted; wait this many seconds (until the next hour)
    WaitSecs(u64),
}

/// The gating rule, separated from persistence for testing
pub fn gate_for(calls_made: u32, max_calls: u32) -> RateGate {
    if calls_made >= max_calls {
        RateGate::WaitSecs(clock::seconds_until_next_hour())
    } else {
        RateGate::Proceed
    }
}

pub struct RateLimiter {
    project_dir: PathBuf,
    max_calls_per_hour: u32,
}

impl RateLimiter {
    pub fn new(project_dir: &Path, max_calls_per_hour: u32) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            max_calls_per_hour,
        }
    }

    fn call_count_path(&self) -> PathBuf {
        self.project_dir.join(CALL_COUNT_FILE)
    }

    fn last_reset_path(&self) -> PathBuf {
        self.project_dir.join(LAST_RESET_FILE)
    }

    /// Calls made in the current hour bucket, resetting counters when the
    /// bucket has rolled over.
    pub fn calls_this_hour(&self) -> FileResult<u32> {
        let bucket = clock::current_hour_bucket();
        let stored_bucket: Option<i64> = state_files::recover(&self.last_reset_path());

        if stored_bucket == Some(bucket) {
            Ok(state_files::recover(&self.call_count_path()).unwrap_or(0))
        } else {
            log::debug!("[RateLimit] Hour bucket rolled over, resetting call counter");
            state_files::store(&self.last_reset_path(), &bucket)?;
            state_files::store(&self.call_count_path(), &0u32)?;
            Ok(0)
        }
    }

    /// Check whether the next agent call fits the budget
    pub fn check(&self) -> FileResult<RateGate> {
        let calls = self.calls_this_hour()?;
        let gate = gate_for(calls, self.max_calls_per_hour);
        if let RateGate::WaitSecs(secs) = gate {
            log::info!(
                "[RateLimit] {}/{} calls this hour, waiting {}s for the next hour",
                calls,
                self.max_calls_per_hour,
                secs
            );
        }
        Ok(gate)
    }

    /// Record one agent call against the current bucket
    pub fn record_call(&self) -> FileResult<u32> {
        let calls = self.calls_this_hour()? + 1;
        state_files::store_durable(&self.call_count_path(), &calls)?;
        Ok(calls)
    }

    pub fn max_calls_per_hour(&self) -> u32 {
        self.max_calls_per_hour
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_gate_blocks_exactly_at_limit() {
        assert_eq!(gate_for(0, 2), RateGate::Proceed);
        assert_eq!(gate_for(1, 2), RateGate::Proceed);
        assert!(matches!(gate_for(2, 2), RateGate::WaitSecs(_)));
        assert!(matches!(gate_for(3, 2), RateGate::WaitSecs(_)));
    }

    #[test]
    fn test_record_call_increments_counter() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = RateLimiter::new(temp_dir.path(), 100);

        assert_eq!(limiter.calls_this_hour().unwrap(), 0);
        assert_eq!(limiter.record_call().unwrap(), 1);
        assert_eq!(limiter.record_call().unwrap(), 2);
        assert_eq!(limiter.calls_this_hour().unwrap(), 2);
    }

    #[test]
    fn test_check_blocks_when_budget_spent() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = RateLimiter::new(temp_dir.path(), 2);

        limiter.record_call().unwrap();
        assert_eq!(limiter.check().unwrap(), RateGate::Proceed);

        limiter.record_call().unwrap();
        assert!(matches!(limiter.check().unwrap(), RateGate::WaitSecs(_)));
    }

    #[test]
    fn test_stale_bucket_resets_counter() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = RateLimiter::new(temp_dir.path(), 2);

        limiter.record_call().unwrap();
        limiter.record_call().unwrap();

        // Pretend the counters were written during a previous hour
        state_files::store(
            &temp_dir.path().join(LAST_RESET_FILE),
            &(clock::current_hour_bucket() - 1),
        )
        .unwrap();

        assert_eq!(limiter.calls_this_hour().unwrap(), 0);
        assert_eq!(limiter.check().unwrap(), RateGate::Proceed);
    }
}
