//! The six verification gate probes
//!
//! Each probe inspects one class of repository artifact and returns a
//! status plus a free-form evidence record. Probes are independent: they
//! never consult each other and a failure in one must not prevent the
//! others from running.

use crate::gitio::GitInspector;
use crate::state_files;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use super::GateStatus;

/// Readme freshness window for the documentation gate
const README_FRESH_SECS: u64 = 24 * 3600;

/// Context shared by all gate probes
pub struct GateContext {
    pub project_dir: PathBuf,
    pub skip_tests: bool,
    pub skip_cli: bool,
    /// Session start; commits at or after this instant count as progress
    pub session_started: DateTime<Utc>,
}

/// Result of running a single gate probe
pub struct GateOutcome {
    pub status: GateStatus,
    pub evidence: Value,
}

impl GateOutcome {
    pub fn verified(evidence: Value) -> Self {
        Self {
            status: GateStatus::Verified,
            evidence,
        }
    }

    pub fn failed(evidence: Value) -> Self {
        Self {
            status: GateStatus::Failed,
            evidence,
        }
    }

    pub fn skipped(reason: &str) -> Self {
        Self {
            status: GateStatus::Skipped,
            evidence: json!({ "reason": reason }),
        }
    }
}

static PASS_COUNT_REGEX: OnceLock<Regex> = OnceLock::new();
static FAIL_COUNT_REGEX: OnceLock<Regex> = OnceLock::new();

fn pass_count_regex() -> &'static Regex {
    PASS_COUNT_REGEX.get_or_init(|| Regex::new(r"(?i)(\d+)\s+pass(?:ed|ing)?\b").unwrap())
}

fn fail_count_regex() -> &'static Regex {
    FAIL_COUNT_REGEX.get_or_init(|| Regex::new(r"(?i)(\d+)\s+fail(?:ed|ing)?\b").unwrap())
}

/// A detected test runner invocation
struct TestRunner {
    command: Vec<String>,
    ecosystem: &'static str,
}

/// Detect the project's test runner from manifest files.
///
/// Bun projects may carry either the binary or the text lockfile name;
/// both are accepted.
fn detect_test_runner(project_dir: &Path) -> Option<TestRunner> {
    if project_dir.join("package.json").exists() {
        let bun = project_dir.join("bun.lockb").exists() || project_dir.join("bun.lock").exists();
        let command = if bun {
            vec!["bun".to_string(), "test".to_string()]
        } else {
            vec!["npm".to_string(), "test".to_string()]
        };
        return Some(TestRunner {
            command,
            ecosystem: "node",
        });
    }
    if project_dir.join("Cargo.toml").exists() {
        return Some(TestRunner {
            command: vec!["cargo".to_string(), "test".to_string()],
            ecosystem: "rust",
        });
    }
    if project_dir.join("go.mod").exists() {
        return Some(TestRunner {
            command: vec!["go".to_string(), "test".to_string(), "./...".to_string()],
            ecosystem: "go",
        });
    }
    if project_dir.join("pyproject.toml").exists() || project_dir.join("requirements.txt").exists()
    {
        return Some(TestRunner {
            command: vec!["pytest".to_string()],
            ecosystem: "python",
        });
    }
    None
}

fn run_command(project_dir: &Path, argv: &[String]) -> Result<(i32, String), String> {
    let output = Command::new(&argv[0])
        .args(&argv[1..])
        .current_dir(project_dir)
        .output()
        .map_err(|e| format!("Failed to run {:?}: {}", argv, e))?;

    let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok((output.status.code().unwrap_or(-1), combined))
}

/// Gate: the project's test suite passes
pub fn tests_passed(ctx: &GateContext) -> GateOutcome {
    if ctx.skip_tests {
        return GateOutcome::skipped("test verification disabled");
    }

    let runner = match detect_test_runner(&ctx.project_dir) {
        Some(runner) => runner,
        None => return GateOutcome::skipped("no test runner detected"),
    };

    let (exit_code, output) = match run_command(&ctx.project_dir, &runner.command) {
        Ok(result) => result,
        Err(e) => return GateOutcome::failed(json!({ "error": e })),
    };

    let log_path = state_files::test_output_log_path(&ctx.project_dir);
    let _ = state_files::prepare_logs_dir(&ctx.project_dir);
    if let Err(e) = std::fs::write(&log_path, &output) {
        log::warn!("[Evidence] Failed to write test output log: {}", e);
    }

    let passed = pass_count_regex()
        .captures_iter(&output)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u32>().ok()))
        .sum::<u32>();
    let failed = fail_count_regex()
        .captures_iter(&output)
        .filter_map(|c| c.get(1).and_then(|m| m.as_str().parse::<u32>().ok()))
        .sum::<u32>();

    let evidence = json!({
        "command": runner.command.join(" "),
        "ecosystem": runner.ecosystem,
        "exit_code": exit_code,
        "tests_passed": passed,
        "tests_failed": failed,
        "log_file": log_path.to_string_lossy(),
    });

    if exit_code == 0 {
        GateOutcome::verified(evidence)
    } else {
        GateOutcome::failed(evidence)
    }
}

/// Gate: documentation exists and is not stale
pub fn documentation_exists(ctx: &GateContext) -> GateOutcome {
    let docs_dir = ctx.project_dir.join("docs");
    if docs_dir.is_dir() {
        let markdown_files = std::fs::read_dir(&docs_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .filter(|e| {
                        e.path()
                            .extension()
                            .map(|ext| ext.eq_ignore_ascii_case("md"))
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);

        if markdown_files > 0 {
            return GateOutcome::verified(json!({
                "location": "docs",
                "markdown_files": markdown_files,
            }));
        }
    }

    for name in ["README.md", "readme.md", "Readme.md"] {
        let readme = ctx.project_dir.join(name);
        if let Ok(metadata) = std::fs::metadata(&readme) {
            if let Ok(modified) = metadata.modified() {
                let age = std::time::SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or_default();
                if age.as_secs() <= README_FRESH_SECS {
                    return GateOutcome::verified(json!({
                        "location": name,
                        "modified_seconds_ago": age.as_secs(),
                    }));
                }
            }
        }
    }

    GateOutcome::failed(json!({
        "reason": "no markdown in docs/ and no recently modified readme",
    }))
}

/// Detect a CLI entry point from the project manifest
fn detect_cli_command(project_dir: &Path) -> Option<Vec<String>> {
    let package_json = project_dir.join("package.json");
    if package_json.exists() {
        if let Ok(content) = std::fs::read_to_string(&package_json) {
            if let Ok(manifest) = serde_json::from_str::<Value>(&content) {
                let bin_path = match manifest.get("bin") {
                    Some(Value::String(path)) => Some(path.clone()),
                    Some(Value::Object(map)) => map
                        .values()
                        .next()
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string()),
                    _ => None,
                };
                if let Some(path) = bin_path {
                    return Some(vec![
                        "node".to_string(),
                        path,
                        "--help".to_string(),
                    ]);
                }
            }
        }
        return None;
    }

    if project_dir.join("Cargo.toml").exists() {
        return Some(vec![
            "cargo".to_string(),
            "run".to_string(),
            "--quiet".to_string(),
            "--".to_string(),
            "--help".to_string(),
        ]);
    }

    let pyproject = project_dir.join("pyproject.toml");
    if pyproject.exists() {
        if let Ok(content) = std::fs::read_to_string(&pyproject) {
            let mut in_scripts = false;
            for line in content.lines() {
                let trimmed = line.trim();
                if trimmed.starts_with('[') {
                    in_scripts = trimmed == "[project.scripts]";
                    continue;
                }
                if in_scripts {
                    if let Some((name, _)) = trimmed.split_once('=') {
                        let name = name.trim().trim_matches('"');
                        if !name.is_empty() {
                            return Some(vec![name.to_string(), "--help".to_string()]);
                        }
                    }
                }
            }
        }
    }

    None
}

/// Gate: the project's CLI entry point answers `--help`
pub fn cli_functional(ctx: &GateContext) -> GateOutcome {
    if ctx.skip_cli {
        return GateOutcome::skipped("cli verification disabled");
    }

    let command = match detect_cli_command(&ctx.project_dir) {
        Some(command) => command,
        None => return GateOutcome::skipped("no cli entry point detected"),
    };

    let (exit_code, _output) = match run_command(&ctx.project_dir, &command) {
        Ok(result) => result,
        Err(e) => return GateOutcome::failed(json!({ "error": e })),
    };

    let evidence = json!({
        "command": command.join(" "),
        "exit_code": exit_code,
    });

    if exit_code == 0 {
        GateOutcome::verified(evidence)
    } else {
        GateOutcome::failed(evidence)
    }
}

/// Gate: the working tree has changed files
pub fn files_modified(ctx: &GateContext) -> GateOutcome {
    let inspector = match GitInspector::open(&ctx.project_dir) {
        Ok(inspector) => inspector,
        Err(_) => return GateOutcome::skipped("not a version-controlled tree"),
    };

    match inspector.changed_file_count() {
        Ok(count) if count >= 1 => GateOutcome::verified(json!({ "files_changed": count })),
        Ok(_) => GateOutcome::failed(json!({ "files_changed": 0 })),
        Err(e) => GateOutcome::failed(json!({ "error": e })),
    }
}

/// Gate: commits were made during this session
pub fn commits_made(ctx: &GateContext) -> GateOutcome {
    let inspector = match GitInspector::open(&ctx.project_dir) {
        Ok(inspector) => inspector,
        Err(_) => return GateOutcome::skipped("not a version-controlled tree"),
    };

    match inspector.commit_count_since(&ctx.session_started) {
        Ok(count) if count >= 1 => {
            // Push status is informational, never gating
            let pushed = inspector.branch_pushed();
            GateOutcome::verified(json!({
                "commit_count": count,
                "pushed": pushed,
            }))
        }
        Ok(_) => GateOutcome::failed(json!({ "commit_count": 0 })),
        Err(e) => GateOutcome::failed(json!({ "error": e })),
    }
}

/// Gate: every checkbox in the fix-plan document is checked.
///
/// Only the exact forms `- [ ]` and `- [x]` count.
pub fn fix_plan_complete(ctx: &GateContext) -> GateOutcome {
    let plan_path = ["fix_plan.md", "@fix_plan.md"]
        .iter()
        .map(|name| ctx.project_dir.join(name))
        .find(|path| path.exists());

    let plan_path = match plan_path {
        Some(path) => path,
        None => return GateOutcome::skipped("no fix plan document"),
    };

    let content = match std::fs::read_to_string(&plan_path) {
        Ok(content) => content,
        Err(e) => {
            return GateOutcome::failed(json!({
                "error": format!("Failed to read {:?}: {}", plan_path, e),
            }))
        }
    };

    let mut completed = 0usize;
    let mut uncompleted_items: Vec<String> = Vec::new();

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("- [x]") {
            completed += 1;
        } else if trimmed.starts_with("- [ ]") {
            uncompleted_items.push(trimmed["- [ ]".len()..].trim().to_string());
        }
    }

    let total = completed + uncompleted_items.len();
    if total == 0 {
        return GateOutcome::skipped("fix plan has no checkboxes");
    }

    let completion_percentage = (completed as f64 / total as f64) * 100.0;
    let evidence = json!({
        "plan_file": plan_path.to_string_lossy(),
        "total_items": total,
        "completed_items": completed,
        "completion_percentage": completion_percentage,
        "uncompleted_items": uncompleted_items,
    });

    if uncompleted_items.is_empty() {
        GateOutcome::verified(evidence)
    } else {
        GateOutcome::failed(evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gitio::test_support::{commit_file, init_repo};
    use tempfile::TempDir;

    fn ctx(dir: &Path) -> GateContext {
        GateContext {
            project_dir: dir.to_path_buf(),
            skip_tests: false,
            skip_cli: false,
            session_started: Utc::now() - chrono::Duration::hours(1),
        }
    }

    #[test]
    fn test_tests_passed_skipped_without_runner() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = tests_passed(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Skipped);
    }

    #[test]
    fn test_tests_passed_respects_skip_flag() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("Cargo.toml"), "[package]").unwrap();

        let mut context = ctx(temp_dir.path());
        context.skip_tests = true;
        let outcome = tests_passed(&context);
        assert_eq!(outcome.status, GateStatus::Skipped);
    }

    #[test]
    fn test_detect_test_runner_prefers_bun_with_either_lockfile() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("package.json"), "{}").unwrap();

        std::fs::write(temp_dir.path().join("bun.lock"), "").unwrap();
        let runner = detect_test_runner(temp_dir.path()).unwrap();
        assert_eq!(runner.command[0], "bun");

        std::fs::remove_file(temp_dir.path().join("bun.lock")).unwrap();
        std::fs::write(temp_dir.path().join("bun.lockb"), "").unwrap();
        let runner = detect_test_runner(temp_dir.path()).unwrap();
        assert_eq!(runner.command[0], "bun");

        std::fs::remove_file(temp_dir.path().join("bun.lockb")).unwrap();
        let runner = detect_test_runner(temp_dir.path()).unwrap();
        assert_eq!(runner.command[0], "npm");
    }

    #[test]
    fn test_documentation_exists_via_docs_dir() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::create_dir(temp_dir.path().join("docs")).unwrap();
        std::fs::write(temp_dir.path().join("docs/guide.md"), "# Guide").unwrap();

        let outcome = documentation_exists(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Verified);
        assert_eq!(outcome.evidence["markdown_files"], 1);
    }

    #[test]
    fn test_documentation_exists_via_fresh_readme() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("README.md"), "# Hello").unwrap();

        let outcome = documentation_exists(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Verified);
    }

    #[test]
    fn test_documentation_missing_fails() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = documentation_exists(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Failed);
    }

    #[test]
    fn test_cli_functional_skipped_without_entry_point() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = cli_functional(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Skipped);
    }

    #[test]
    fn test_detect_cli_command_from_package_json_bin() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("package.json"),
            r#"{"name": "tool", "bin": {"tool": "./cli.js"}}"#,
        )
        .unwrap();

        let command = detect_cli_command(temp_dir.path()).unwrap();
        assert_eq!(command, vec!["node", "./cli.js", "--help"]);
    }

    #[test]
    fn test_detect_cli_command_from_pyproject_scripts() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("pyproject.toml"),
            "[project]\nname = \"tool\"\n[project.scripts]\nmytool = \"tool.cli:main\"\n",
        )
        .unwrap();

        let command = detect_cli_command(temp_dir.path()).unwrap();
        assert_eq!(command, vec!["mytool", "--help"]);
    }

    #[test]
    fn test_files_modified_skipped_outside_git() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = files_modified(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Skipped);
    }

    #[test]
    fn test_files_modified_verified_and_failed() {
        let temp_dir = TempDir::new().unwrap();
        let repo = init_repo(temp_dir.path());
        commit_file(&repo, "a.txt", "one", "initial");

        let outcome = files_modified(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Failed);

        std::fs::write(temp_dir.path().join("a.txt"), "changed").unwrap();
        let outcome = files_modified(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Verified);
        assert_eq!(outcome.evidence["files_changed"], 1);
    }

    #[test]
    fn test_commits_made_counts_session_commits() {
        let temp_dir = TempDir::new().unwrap();
        let repo = init_repo(temp_dir.path());
        commit_file(&repo, "a.txt", "one", "work");

        let outcome = commits_made(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Verified);
        assert_eq!(outcome.evidence["commit_count"], 1);

        // A session starting after the commit sees none
        let late_ctx = GateContext {
            session_started: Utc::now() + chrono::Duration::hours(1),
            ..ctx(temp_dir.path())
        };
        let outcome = commits_made(&late_ctx);
        assert_eq!(outcome.status, GateStatus::Failed);
    }

    #[test]
    fn test_fix_plan_missing_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = fix_plan_complete(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Skipped);
    }

    #[test]
    fn test_fix_plan_without_checkboxes_is_skipped() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("fix_plan.md"), "# Plan\nJust prose.").unwrap();

        let outcome = fix_plan_complete(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Skipped);
    }

    #[test]
    fn test_fix_plan_with_unchecked_items_fails() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("fix_plan.md"),
            "# Plan\n- [x] first task\n- [ ] second task\n- [ ] third task\n",
        )
        .unwrap();

        let outcome = fix_plan_complete(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Failed);
        let uncompleted = outcome.evidence["uncompleted_items"].as_array().unwrap();
        assert_eq!(uncompleted.len(), 2);
        assert_eq!(uncompleted[0], "second task");
    }

    #[test]
    fn test_fix_plan_all_checked_is_verified() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("fix_plan.md"),
            "- [x] first\n- [x] second\n",
        )
        .unwrap();

        let outcome = fix_plan_complete(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Verified);
        assert_eq!(outcome.evidence["completion_percentage"], 100.0);
    }

    #[test]
    fn test_fix_plan_accepts_alternate_name() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("@fix_plan.md"), "- [x] only item\n").unwrap();

        let outcome = fix_plan_complete(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Verified);
    }

    #[test]
    fn test_fix_plan_only_exact_forms_count() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join("fix_plan.md"),
            "- [X] uppercase does not count\n- [x] counts\n",
        )
        .unwrap();

        let outcome = fix_plan_complete(&ctx(temp_dir.path()));
        assert_eq!(outcome.status, GateStatus::Verified);
        assert_eq!(outcome.evidence["total_items"], 1);
    }
}
