//! Agent subprocess invocation
//!
//! One invocation per loop: the instruction file is fed to the agent on
//! stdin, stdout and stderr are captured to a per-loop log file, and the
//! wait is poll-based so cancellation and the wall-clock timeout are both
//! honored without holding any lock across the wait.

use crate::config::RunnerConfig;
use crate::runner::progress;
use crate::shutdown::ShutdownState;
use crate::state_files;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

/// Exit code reported when the invocation hit the wall-clock timeout
const TIMEOUT_EXIT_CODE: i32 = 124;
/// How often the wait loop polls the child and the cancellation flag
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Result of one agent invocation
#[derive(Debug)]
pub struct AgentInvocation {
    pub exit_code: i32,
    pub timed_out: bool,
    /// True when the invocation was aborted by a shutdown request
    pub cancelled: bool,
    pub duration_ms: u64,
    pub log_path: PathBuf,
}

/// Launch the agent for one loop and wait for it to finish.
///
/// Errors here are fatal controller errors (unlaunchable binary, missing
/// instruction file); agent failures are reported through `exit_code`.
pub async fn invoke_agent(
    config: &RunnerConfig,
    shutdown: &ShutdownState,
    loop_number: u32,
) -> Result<AgentInvocation, String> {
    let argv = config.agent_argv();
    if argv.is_empty() {
        return Err("Agent command is empty".to_string());
    }

    let prompt_path = if config.prompt_file.is_absolute() {
        config.prompt_file.clone()
    } else {
        config.project_dir.join(&config.prompt_file)
    };
    let prompt = std::fs::read_to_string(&prompt_path)
        .map_err(|e| format!("Failed to read instruction file {:?}: {}", prompt_path, e))?;

    state_files::prepare_logs_dir(&config.project_dir)?;
    let log_path = state_files::loop_log_path(&config.project_dir, loop_number);

    let log_file = std::fs::File::create(&log_path)
        .map_err(|e| format!("Failed to create agent log {:?}: {}", log_path, e))?;
    let log_file_stderr = log_file
        .try_clone()
        .map_err(|e| format!("Failed to clone agent log handle: {}", e))?;

    log::info!(
        "[Runner] Loop {}: invoking agent `{}` (timeout {}s)",
        loop_number,
        config.agent_command,
        config.timeout.as_secs()
    );

    let mut child = tokio::process::Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(&config.project_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::from(log_file))
        .stderr(Stdio::from(log_file_stderr))
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("Failed to launch agent {:?}: {}", argv[0], e))?;

    // Feed the instruction file and close stdin so the agent sees EOF
    if let Some(mut stdin) = child.stdin.take() {
        if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
            log::warn!("[Runner] Failed to write instructions to agent stdin: {}", e);
        }
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let progress_handle = progress::spawn_progress_writer(
        config.project_dir.clone(),
        log_path.clone(),
        loop_number,
        stop_rx,
    );

    let start = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;

    let exit_code = loop {
        if shutdown.is_shutdown_requested() {
            log::warn!("[Runner] Shutdown requested, killing agent");
            let _ = child.start_kill();
            let _ = child.wait().await;
            cancelled = true;
            break -1;
        }

        match child.try_wait() {
            Ok(Some(status)) => break status.code().unwrap_or(-1),
            Ok(None) => {
                if start.elapsed() >= config.timeout {
                    log::warn!(
                        "[Runner] Agent timed out after {}s, killing process",
                        config.timeout.as_secs()
                    );
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    timed_out = true;
                    break TIMEOUT_EXIT_CODE;
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
            Err(e) => {
                let _ = stop_tx.send(true);
                let _ = progress_handle.await;
                return Err(format!("Failed to wait for agent: {}", e));
            }
        }
    };

    // Cancel the progress writer before returning; it resets progress.json
    // to idle on its way out.
    let _ = stop_tx.send(true);
    let _ = progress_handle.await;

    let duration_ms = start.elapsed().as_millis() as u64;
    log::info!(
        "[Runner] Loop {}: agent finished with exit_code={} in {}ms",
        loop_number,
        exit_code,
        duration_ms
    );

    Ok(AgentInvocation {
        exit_code,
        timed_out,
        cancelled,
        duration_ms,
        log_path,
    })
}
