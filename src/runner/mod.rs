//! The main supervision loop
//!
//! Composes the rate limiter, circuit breaker, response analyzer, and
//! evidence collector into one bounded, self-terminating loop. Each
//! iteration invokes a fresh agent instance, classifies its output, feeds
//! the breaker, publishes `status.json`, and decides whether to continue,
//! halt, or exit.
//!
//! Per-loop write ordering is fixed: the analysis record lands before the
//! breaker state, which lands before the status snapshot.

mod agent;
mod progress;
mod rate_limiter;

pub use agent::AgentInvocation;
pub use progress::ProgressSnapshot;
pub use rate_limiter::{RateGate, RateLimiter};

use crate::analyzer::{ExitSignalHistory, ResponseAnalyzer};
use crate::circuit::{self, CircuitBreaker, CircuitDecision, CircuitState};
use crate::clock;
use crate::config::{RunnerConfig, LOOP_BACKOFF_SECS};
use crate::evidence::{EvidenceCollector, OverallStatus};
use crate::gitio::GitInspector;
use crate::shutdown::ShutdownState;
use crate::state_files::{self, STATUS_FILE};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level runner status, mirrored into `status.json`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Initializing,
    Running,
    Waiting,
    Exited,
    Halted,
    Failed,
}

/// The `status.json` document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusDocument {
    pub session_id: String,
    pub started_at: String,
    pub loop_count: u32,
    pub calls_made_this_hour: u32,
    pub max_calls_per_hour: u32,
    pub status: RunnerStatus,
    pub last_action: String,
    pub exit_reason: Option<String>,
    /// Snapshot of the breaker for dashboards
    pub circuit: Option<CircuitState>,
    /// Snapshot of the evidence verdict for dashboards
    pub evidence: Option<OverallStatus>,
    pub updated_at: String,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Exit signal confirmed by evidence
    Exited,
    /// Circuit open, loop cap, or user cancellation
    Halted,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Exited => 0,
            RunOutcome::Halted => 1,
        }
    }
}

/// The loop controller
pub struct LoopRunner {
    config: RunnerConfig,
    shutdown: ShutdownState,
    analyzer: ResponseAnalyzer,
    breaker: CircuitBreaker,
    rate_limiter: RateLimiter,
    collector: EvidenceCollector,
    status: StatusDocument,
}

impl LoopRunner {
    /// Create a runner, resuming the existing session when state files
    /// from a previous (non-reset) run are present.
    pub fn new(config: RunnerConfig, shutdown: ShutdownState) -> Self {
        let project_dir = config.project_dir.clone();

        let status = match state_files::recover::<StatusDocument>(
            &project_dir.join(STATUS_FILE),
        ) {
            Some(mut existing) => {
                log::info!(
                    "[Runner] Resuming session {} at loop {}",
                    existing.session_id,
                    existing.loop_count
                );
                existing.status = RunnerStatus::Initializing;
                existing.exit_reason = None;
                existing
            }
            None => StatusDocument {
                session_id: uuid::Uuid::new_v4().to_string(),
                started_at: clock::now_rfc3339(),
                loop_count: 0,
                calls_made_this_hour: 0,
                max_calls_per_hour: config.max_calls_per_hour,
                status: RunnerStatus::Initializing,
                last_action: "starting".to_string(),
                exit_reason: None,
                circuit: None,
                evidence: None,
                updated_at: clock::now_rfc3339(),
            },
        };

        Self {
            analyzer: ResponseAnalyzer::new(&project_dir),
            breaker: CircuitBreaker::new(&project_dir),
            rate_limiter: RateLimiter::new(&project_dir, config.max_calls_per_hour),
            collector: EvidenceCollector::new(&project_dir, config.skip_tests, config.skip_cli),
            config,
            shutdown,
            status,
        }
    }

    fn project_dir(&self) -> PathBuf {
        self.config.project_dir.clone()
    }

    /// Run until a terminal state is reached.
    ///
    /// `Err` means an unrecoverable internal error (status `failed`);
    /// agent failures never surface here.
    pub async fn run(&mut self) -> Result<RunOutcome, String> {
        self.publish(RunnerStatus::Initializing, "initializing session");

        self.breaker.init()?;
        let session_id = self.status.session_id.clone();
        self.collector.load_or_init(&session_id)?;

        log::info!(
            "[Runner] Session {} starting (max {} calls/hour)",
            session_id,
            self.config.max_calls_per_hour
        );

        loop {
            if self.shutdown.is_shutdown_requested() {
                return Ok(self.finalize_halted("user cancel"));
            }

            let loop_number = self.status.loop_count + 1;

            if self.config.max_loops > 0 && loop_number > self.config.max_loops {
                log::warn!(
                    "[Runner] Loop cap ({}) reached, halting",
                    self.config.max_loops
                );
                return Ok(self.finalize_halted("max loops reached"));
            }

            // 1. Rate limit
            if let RateGate::WaitSecs(secs) = self.rate_limiter.check()? {
                self.publish(RunnerStatus::Waiting, "waiting for rate-limit window");
                if self.sleep_interruptible(secs).await {
                    return Ok(self.finalize_halted("user cancel"));
                }
                continue;
            }

            // 2. Circuit check
            if self.breaker.should_halt_execution() {
                self.report_circuit_halt();
                return Ok(self.finalize_halted("circuit open"));
            }

            // 3. Invoke the agent
            self.publish(
                RunnerStatus::Running,
                &format!("invoking agent (loop {})", loop_number),
            );
            let invocation = agent::invoke_agent(&self.config, &self.shutdown, loop_number).await?;
            self.rate_limiter.record_call()?;
            self.status.loop_count = loop_number;

            if invocation.cancelled {
                return Ok(self.finalize_halted("user cancel"));
            }

            // 4. Analyze
            let output = std::fs::read_to_string(&invocation.log_path).unwrap_or_default();
            let files_modified = match GitInspector::open(&self.config.project_dir) {
                Ok(inspector) => inspector.changed_file_count().unwrap_or_else(|e| {
                    log::warn!("[Runner] Diff unavailable: {}", e);
                    0
                }),
                Err(_) => 0,
            };
            let analysis = self
                .analyzer
                .analyze_loop(loop_number, &invocation.log_path, files_modified);

            // 5. Record the loop result
            let error_line = circuit::extract_error_line(&output);
            let had_error =
                invocation.exit_code != 0 || invocation.timed_out || error_line.is_some();
            let decision = self.breaker.record_loop_result(
                loop_number,
                analysis.files_modified,
                had_error,
                error_line.as_deref(),
                invocation.duration_ms,
            )?;

            // 6. Publish
            self.publish(
                RunnerStatus::Running,
                &format!(
                    "loop {} analyzed (score {}, {} files changed)",
                    loop_number, analysis.confidence_score, analysis.files_modified
                ),
            );

            if decision == CircuitDecision::Halt {
                // The opening transition is already journaled; the halt
                // itself happens at the next iteration's circuit check, so
                // a forced evidence check on this loop still gets its say.
                log::warn!("[Runner] Circuit opened on loop {}", loop_number);
            }

            // 7. Exit decision
            let history = ExitSignalHistory::load(&self.config.project_dir);
            let forced_by_test_loops = ExitSignalHistory::tail_is_consecutive(
                &history.test_only_loops,
                self.config.max_consecutive_test_loops,
                loop_number,
            );
            let forced_by_done_signals = ExitSignalHistory::tail_is_consecutive(
                &history.done_signals,
                self.config.max_consecutive_done_signals,
                loop_number,
            );

            if analysis.exit_signal || forced_by_test_loops || forced_by_done_signals {
                let trigger = if analysis.exit_signal {
                    "exit signal"
                } else if forced_by_test_loops {
                    "consecutive test-only loops"
                } else {
                    "consecutive done signals"
                };
                log::info!("[Runner] Loop {}: evidence check ({})", loop_number, trigger);

                if self.config.skip_evidence {
                    return Ok(self.finalize_exited(&format!("{} (evidence disabled)", trigger)));
                }

                let doc = self.collector.run_all_gates(&session_id, loop_number)?;
                self.status.evidence = Some(doc.overall_status.clone());

                if doc.overall_status.exit_allowed {
                    return Ok(self.finalize_exited(trigger));
                }

                let failing = doc.failing_gates();
                log::info!(
                    "[Runner] Exit refused, failing gates: {}",
                    failing.join(", ")
                );
                println!("Exit refused; failing gates: {}", failing.join(", "));
                self.publish(
                    RunnerStatus::Running,
                    &format!("exit refused ({})", failing.join(", ")),
                );
            }

            // 8. Backoff and continue
            if self.sleep_interruptible(LOOP_BACKOFF_SECS).await {
                return Ok(self.finalize_halted("user cancel"));
            }
        }
    }

    /// Sleep up to `secs`, returning true when interrupted by shutdown
    async fn sleep_interruptible(&self, secs: u64) -> bool {
        for _ in 0..secs {
            if self.shutdown.is_shutdown_requested() {
                return true;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        self.shutdown.is_shutdown_requested()
    }

    /// Print the breaker's transition history and trigger fingerprint
    fn report_circuit_halt(&self) {
        let state = self.breaker.current_state();
        println!("Circuit breaker is OPEN; halting.");
        if let Some(fp) = &state.last_error_fingerprint {
            println!("Last error fingerprint: {}", fp);
        }
        for record in &self.breaker.history().transitions {
            println!(
                "  loop {}: {} -> {} ({})",
                record.loop_number, record.from, record.to, record.reason
            );
        }
    }

    fn finalize_exited(&mut self, reason: &str) -> RunOutcome {
        log::info!("[Runner] Session complete: {}", reason);
        self.publish_terminal(RunnerStatus::Exited, reason);
        RunOutcome::Exited
    }

    fn finalize_halted(&mut self, reason: &str) -> RunOutcome {
        log::warn!("[Runner] Halting: {}", reason);
        self.publish_terminal(RunnerStatus::Halted, reason);
        RunOutcome::Halted
    }

    /// Publish the `failed` terminal state after an unrecoverable error
    pub fn mark_failed(&mut self, reason: &str) {
        self.publish_terminal(RunnerStatus::Failed, reason);
    }

    fn publish_terminal(&mut self, status: RunnerStatus, reason: &str) {
        self.status.exit_reason = Some(reason.to_string());
        self.collector.finalize();
        self.publish(status, reason);
        progress::write_idle(&self.project_dir(), self.status.loop_count);
    }

    /// Write the status snapshot; the dashboard's whole view of the runner
    fn publish(&mut self, status: RunnerStatus, action: &str) {
        self.status.status = status;
        self.status.last_action = action.to_string();
        self.status.calls_made_this_hour = self.rate_limiter.calls_this_hour().unwrap_or(0);
        self.status.max_calls_per_hour = self.rate_limiter.max_calls_per_hour();
        self.status.circuit = Some(self.breaker.current_state());
        if self.status.evidence.is_none() {
            self.status.evidence = self
                .collector
                .current()
                .map(|doc| doc.overall_status.clone());
        }
        self.status.updated_at = clock::now_rfc3339();

        let path = self.project_dir().join(STATUS_FILE);
        if let Err(e) = state_files::store_durable(&path, &self.status) {
            log::warn!("[Runner] Failed to publish status: {}", e);
        }
    }

    /// Current status document (for tests and one-shot commands)
    pub fn status(&self) -> &StatusDocument {
        &self.status
    }
}
