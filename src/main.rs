use clap::Parser;
use ralph_runner::evidence::{self, EvidenceCollector};
use ralph_runner::{state_files, LoopRunner, RunnerConfig, ShutdownState};
use std::path::PathBuf;

/// Autonomous agent-loop supervisor
///
/// Repeatedly invokes a coding agent against an instruction file and stops
/// only when the agent's completion claim is backed by verifiable
/// repository evidence, or when the circuit breaker detects stagnation.
#[derive(Parser, Debug)]
#[command(name = "ralph-runner")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Delete all state files (counters, circuit, signals, evidence) and exit
    #[arg(long)]
    reset_all: bool,

    /// Run all verification gates once, print a summary, and exit
    #[arg(long)]
    verify_evidence: bool,

    /// Print the current evidence record without running gates
    #[arg(long)]
    evidence_status: bool,

    /// Exit on the agent's signal alone, without evidence verification
    #[arg(long)]
    skip_evidence: bool,

    /// Suppress the test verification gate
    #[arg(long)]
    skip_tests: bool,

    /// Suppress the CLI verification gate
    #[arg(long)]
    skip_cli: bool,

    /// Per-invocation wall-clock timeout in minutes
    #[arg(long, value_name = "MINUTES", default_value_t = ralph_runner::config::DEFAULT_TIMEOUT_MINUTES)]
    timeout: u64,

    /// Safety cap on total loops (0 = unlimited)
    #[arg(long, value_name = "N", default_value_t = 0)]
    max_loops: u32,

    /// Agent command to invoke each loop
    #[arg(long, value_name = "CMD", default_value = "claude")]
    agent: String,

    /// Instruction file fed to the agent on stdin
    #[arg(long, value_name = "FILE", default_value = "PROMPT.md")]
    prompt: PathBuf,

    /// Directory the agent works in (state files live here)
    #[arg(long, value_name = "PATH", default_value = ".")]
    project_dir: PathBuf,
}

fn build_config(cli: &Cli) -> RunnerConfig {
    let mut config = RunnerConfig::from_env();
    config.project_dir = cli.project_dir.clone();
    config.agent_command = cli.agent.clone();
    config.prompt_file = cli.prompt.clone();
    config.timeout = std::time::Duration::from_secs(cli.timeout * 60);
    config.max_loops = cli.max_loops;
    config.skip_evidence |= cli.skip_evidence;
    config.skip_tests |= cli.skip_tests;
    config.skip_cli |= cli.skip_cli;
    config
}

fn main() {
    let cli = Cli::parse();
    env_logger::init();

    let config = build_config(&cli);

    if cli.reset_all {
        match state_files::reset_all(&config.project_dir) {
            Ok(()) => {
                println!("All state files removed.");
                std::process::exit(0);
            }
            Err(e) => {
                eprintln!("Reset failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let collector =
        EvidenceCollector::new(&config.project_dir, config.skip_tests, config.skip_cli);

    if cli.evidence_status {
        match collector.current() {
            Some(doc) => print!("{}", evidence::format_summary(&doc)),
            None => println!("No evidence recorded yet."),
        }
        std::process::exit(0);
    }

    if cli.verify_evidence {
        let (session_id, loop_number) = collector
            .current()
            .map(|doc| (doc.session_id.clone(), doc.loop_number))
            .unwrap_or_else(|| (uuid::Uuid::new_v4().to_string(), 0));

        match collector.run_all_gates(&session_id, loop_number) {
            Ok(doc) => {
                print!("{}", evidence::format_summary(&doc));
                let code = if doc.overall_status.exit_allowed { 0 } else { 1 };
                std::process::exit(code);
            }
            Err(e) => {
                eprintln!("Evidence verification failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let shutdown = ShutdownState::new();
    if let Err(e) = ralph_runner::shutdown::register_signal_handlers(shutdown.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create runtime: {}", e);
            std::process::exit(1);
        }
    };

    let outcome = rt.block_on(async {
        let mut runner = LoopRunner::new(config, shutdown);
        match runner.run().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                runner.mark_failed(&e);
                Err(e)
            }
        }
    });

    match outcome {
        Ok(outcome) => std::process::exit(outcome.exit_code()),
        Err(e) => {
            log::error!("[Runner] Fatal: {}", e);
            eprintln!("Fatal error: {}", e);
            std::process::exit(1);
        }
    }
}
