//! Response analysis - classifies each agent invocation's output
//!
//! After every loop the analyzer reads the captured agent log and the
//! working-tree diff summary, scores the evidence that the agent believes
//! it is finished, and feeds the rolling exit-signal history. The analyzer
//! only reports; it never fails the loop.

mod history;
mod signals;
pub mod structured;

pub use history::ExitSignalHistory;

use crate::state_files::{self, RESPONSE_ANALYSIS_FILE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Confidence contribution of a well-formed structured block
const SCORE_STRUCTURED_BLOCK: u32 = 100;
/// Confidence contribution of completion keywords near the end of output
const SCORE_COMPLETION_KEYWORDS: u32 = 20;
/// Confidence contribution of output shrinking to under half the previous loop's
const SCORE_SHORT_AFTER_LONG: u32 = 20;
/// Confidence contribution of a test-only loop
const SCORE_TEST_ONLY: u32 = 10;
/// Score at or above which the analyzer reports an exit signal
const EXIT_THRESHOLD: u32 = 100;

/// How the agent's output was formatted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Output carried a well-formed structured status block
    Structured,
    /// Plain text only
    Text,
}

/// Analysis record for a single loop, persisted as `.response_analysis`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseAnalysis {
    /// The loop this analysis refers to
    #[serde(rename = "loop")]
    pub loop_number: u32,
    pub output_format: OutputFormat,
    /// Key/value pairs extracted from the structured block, if present
    pub structured_fields: BTreeMap<String, String>,
    pub has_completion_signal: bool,
    pub is_test_only: bool,
    /// Distinct changed paths reported by the working-tree diff
    pub files_modified: usize,
    /// Output size in bytes, compared against the previous loop for trend
    pub output_length: usize,
    pub confidence_score: u32,
    /// Final verdict: the agent appears to believe it is done
    pub exit_signal: bool,
}

impl ResponseAnalysis {
    fn path(project_dir: &Path) -> PathBuf {
        project_dir.join(RESPONSE_ANALYSIS_FILE)
    }

    /// Load the most recent analysis, if any survives on disk
    pub fn load(project_dir: &Path) -> Option<Self> {
        state_files::recover(&Self::path(project_dir))
    }

    /// Whether the structured block reported STATUS: COMPLETE
    pub fn structured_status_complete(&self) -> bool {
        structured::status_complete(&self.structured_fields)
    }
}

/// Analyzer over one project directory
pub struct ResponseAnalyzer {
    project_dir: PathBuf,
}

impl ResponseAnalyzer {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
        }
    }

    /// Analyze one loop's captured output.
    ///
    /// Overwrites `.response_analysis` and appends detected signals to
    /// `.exit_signals`. A missing log file still produces a (zeroed)
    /// analysis record, and persistence problems are logged rather than
    /// propagated: analysis only reports, it never fails the loop.
    pub fn analyze_loop(
        &self,
        loop_number: u32,
        log_path: &Path,
        files_modified: usize,
    ) -> ResponseAnalysis {
        let output = match std::fs::read_to_string(log_path) {
            Ok(content) => content,
            Err(e) => {
                log::warn!(
                    "[Analyzer] Agent log {:?} unreadable, analyzing as empty: {}",
                    log_path,
                    e
                );
                String::new()
            }
        };

        let previous_length = ResponseAnalysis::load(&self.project_dir)
            .filter(|prev| prev.loop_number < loop_number)
            .map(|prev| prev.output_length);

        let analysis = analyze_output(&output, loop_number, files_modified, previous_length);

        if let Err(e) =
            state_files::store(&ResponseAnalysis::path(&self.project_dir), &analysis)
        {
            log::warn!("[Analyzer] Failed to persist analysis: {}", e);
        }

        let completion_indicator = analysis.structured_status_complete();
        if analysis.is_test_only || analysis.has_completion_signal || completion_indicator {
            let mut history = ExitSignalHistory::load(&self.project_dir);
            history.record(
                loop_number,
                analysis.is_test_only,
                analysis.has_completion_signal,
                completion_indicator,
            );
            if let Err(e) = history.store(&self.project_dir) {
                log::warn!("[Analyzer] Failed to persist exit-signal history: {}", e);
            }
        }

        log::debug!(
            "[Analyzer] Loop {}: format={:?} score={} exit_signal={} test_only={} files={}",
            loop_number,
            analysis.output_format,
            analysis.confidence_score,
            analysis.exit_signal,
            analysis.is_test_only,
            analysis.files_modified
        );

        analysis
    }
}

/// Pure classification over the raw output.
///
/// Deterministic in its inputs: the same bytes, diff summary and previous
/// length always produce the same record.
pub fn analyze_output(
    output: &str,
    loop_number: u32,
    files_modified: usize,
    previous_length: Option<usize>,
) -> ResponseAnalysis {
    let structured_fields = structured::parse_block(output);
    let output_format = if structured_fields.is_some() {
        OutputFormat::Structured
    } else {
        OutputFormat::Text
    };
    let structured_fields = structured_fields.unwrap_or_default();

    let structured_exit = structured::exit_signal(&structured_fields);
    let has_completion_signal = structured_exit || signals::has_completion_keywords(output);
    let is_test_only = signals::is_test_only(output);
    let output_length = output.len();

    let mut confidence_score = 0u32;
    if output_format == OutputFormat::Structured {
        confidence_score += SCORE_STRUCTURED_BLOCK;
    }
    if has_completion_signal {
        confidence_score += SCORE_COMPLETION_KEYWORDS;
    }
    if let Some(prev) = previous_length {
        if prev > 0 && output_length * 2 < prev {
            confidence_score += SCORE_SHORT_AFTER_LONG;
        }
    }
    if is_test_only {
        confidence_score += SCORE_TEST_ONLY;
    }

    let exit_signal = structured_exit || confidence_score >= EXIT_THRESHOLD;

    ResponseAnalysis {
        loop_number,
        output_format,
        structured_fields,
        has_completion_signal,
        is_test_only,
        files_modified,
        output_length,
        confidence_score,
        exit_signal,
    }
}
