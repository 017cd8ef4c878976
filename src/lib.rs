// Clippy allows for reasonable defaults
// These suppress warnings where the suggested change doesn't improve
// readability
#![allow(clippy::new_without_default)] // Default not always appropriate for stateful types
#![allow(clippy::collapsible_if)] // Separate ifs can be more readable
#![allow(clippy::redundant_closure)] // |x| f(x) can be clearer than f

// Module declarations
pub mod analyzer;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod evidence;
pub mod gitio;
pub mod runner;
pub mod shutdown;
pub mod state_files;

// Re-export the types the binary and integration tests compose
pub use analyzer::{ExitSignalHistory, ResponseAnalysis, ResponseAnalyzer};
pub use circuit::{BreakerState, CircuitBreaker, CircuitDecision};
pub use config::RunnerConfig;
pub use evidence::{EvidenceCollector, EvidenceDocument, GateStatus};
pub use runner::{LoopRunner, RunOutcome, RunnerStatus, StatusDocument};
pub use shutdown::ShutdownState;
