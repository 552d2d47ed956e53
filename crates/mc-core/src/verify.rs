//! Verification runner: executes a set of verification nodes against a
//! workspace and folds their output into a typed report.
//!
//! Required nodes run sequentially in declared order; optional nodes run
//! concurrently afterwards. With no nodes configured, a single combined
//! command is run and four synthetic rows (test/lint/type/security) are
//! derived from its output.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::future::join_all;
use regex::Regex;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::{VerificationConfig, VerificationNodeConfig};
use mc_db::models::Snapshot;

/// What a verification node's output is parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationKind {
    Test,
    Lint,
    Type,
    Security,
    Custom,
}

impl VerificationKind {
    pub fn from_config(kind: &str) -> Self {
        match kind {
            "test" => Self::Test,
            "lint" => Self::Lint,
            "type" => Self::Type,
            "security" => Self::Security,
            _ => Self::Custom,
        }
    }
}

/// Result of one verification node.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub kind: VerificationKind,
    pub passed: bool,
    pub exit_code: Option<i32>,
    pub output: String,
    pub metrics: HashMap<String, i64>,
    pub duration: Duration,
    pub required: bool,
    pub weight: f64,
}

/// A verification run's full report.
#[derive(Debug, Clone, Default)]
pub struct VerificationReport {
    pub results: Vec<VerificationResult>,
    pub raw_output: String,
}

impl VerificationReport {
    /// Passed iff every required result passed.
    pub fn overall_passed(&self) -> bool {
        self.results.iter().filter(|r| r.required).all(|r| r.passed)
    }

    /// Weighted pass score across all results.
    pub fn weighted_score(&self) -> f64 {
        self.results
            .iter()
            .map(|r| if r.passed { r.weight } else { 0.0 })
            .sum()
    }

    pub fn failed_kinds(&self) -> Vec<VerificationKind> {
        self.results
            .iter()
            .filter(|r| !r.passed)
            .map(|r| r.kind)
            .collect()
    }

    fn metric(&self, kind: VerificationKind, key: &str) -> i64 {
        self.results
            .iter()
            .find(|r| r.kind == kind)
            .and_then(|r| r.metrics.get(key).copied())
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

static PASSED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) passed").unwrap());
static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) failed").unwrap());
static ERROR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+) error").unwrap());
static LINT_LINE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^.+:\d+:\d+:").unwrap());
static TYPE_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\S+:\d+: error:").unwrap());

fn capture_count(re: &Regex, output: &str) -> i64 {
    re.captures(output)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}

/// Parse a test-runner summary line ("N passed", "N failed", "N error").
pub fn parse_test_summary(output: &str) -> HashMap<String, i64> {
    let passed = capture_count(&PASSED_RE, output);
    let failed = capture_count(&FAILED_RE, output) + capture_count(&ERROR_RE, output);

    HashMap::from([
        ("test_total".to_owned(), passed + failed),
        ("test_passed".to_owned(), passed),
        ("test_failed".to_owned(), failed),
    ])
}

/// Count lint diagnostics in `file:line:col:` format.
pub fn parse_lint_output(output: &str) -> HashMap<String, i64> {
    let count = if output.trim().is_empty() || output.contains("All checks passed") {
        0
    } else {
        output
            .lines()
            .filter(|line| LINT_LINE_RE.is_match(line))
            .count() as i64
    };
    HashMap::from([("lint_errors".to_owned(), count)])
}

/// Count type-checker diagnostics in `file:line: error:` format.
///
/// Anchored so that test-runner tracebacks containing "error:" do not
/// produce false positives.
pub fn parse_type_output(output: &str) -> HashMap<String, i64> {
    let count = if output.contains("Success") {
        0
    } else {
        output
            .lines()
            .filter(|line| TYPE_LINE_RE.is_match(line))
            .count() as i64
    };
    HashMap::from([("type_errors".to_owned(), count)])
}

/// Count security-scanner findings (">> Issue:" lines).
pub fn parse_security_output(output: &str) -> HashMap<String, i64> {
    let count = if output.contains("No issues identified") {
        0
    } else {
        output.lines().filter(|line| line.contains(">> Issue:")).count() as i64
    };
    HashMap::from([("security_findings".to_owned(), count)])
}

fn parse_metrics(kind: VerificationKind, output: &str) -> HashMap<String, i64> {
    match kind {
        VerificationKind::Test => parse_test_summary(output),
        VerificationKind::Lint => parse_lint_output(output),
        VerificationKind::Type => parse_type_output(output),
        VerificationKind::Security => parse_security_output(output),
        VerificationKind::Custom => HashMap::new(),
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run a shell command capturing combined output. A timeout kills the
/// child and reports `None` as the exit code.
pub async fn run_shell(command: &str, cwd: &Path, timeout: Duration) -> (Option<i32>, String) {
    let spawned = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => return (None, format!("Command failed to start: {e}")),
    };

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        buf
    };
    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        buf
    };

    match tokio::time::timeout(timeout, async {
        tokio::join!(child.wait(), read_stdout, read_stderr)
    })
    .await
    {
        Ok((Ok(status), out, err)) => {
            let mut combined = String::from_utf8_lossy(&out).into_owned();
            combined.push_str(&String::from_utf8_lossy(&err));
            (status.code(), combined)
        }
        Ok((Err(e), _, _)) => (None, format!("Command wait failed: {e}")),
        Err(_) => {
            let _ = child.kill().await;
            (
                None,
                format!("Command timed out after {}s", timeout.as_secs()),
            )
        }
    }
}

async fn run_node(node: &VerificationNodeConfig, cwd: &Path) -> VerificationResult {
    let kind = VerificationKind::from_config(&node.kind);
    let start = Instant::now();
    let (exit_code, output) =
        run_shell(&node.command, cwd, Duration::from_secs(node.timeout.max(1))).await;

    VerificationResult {
        kind,
        passed: exit_code == Some(0),
        exit_code,
        metrics: parse_metrics(kind, &output),
        output,
        duration: start.elapsed(),
        required: node.required,
        weight: node.weight,
    }
}

/// Synthesize the four standard result rows from one combined command.
pub fn report_from_single_command(output: &str, exit_code: Option<i32>) -> VerificationReport {
    let test_metrics = parse_test_summary(output);
    let lint_metrics = parse_lint_output(output);
    let type_metrics = parse_type_output(output);
    let security_metrics = parse_security_output(output);

    let overall_ok = exit_code == Some(0);
    let test_failed = test_metrics["test_failed"];
    let test_total = test_metrics["test_total"];

    let rows = [
        (
            VerificationKind::Test,
            (test_failed == 0 && test_total > 0) || (test_total == 0 && overall_ok),
            test_metrics,
        ),
        (VerificationKind::Lint, lint_metrics["lint_errors"] == 0, lint_metrics),
        (VerificationKind::Type, type_metrics["type_errors"] == 0, type_metrics),
        (
            VerificationKind::Security,
            security_metrics["security_findings"] == 0,
            security_metrics,
        ),
    ];

    let results = rows
        .into_iter()
        .map(|(kind, passed, metrics)| VerificationResult {
            kind,
            // A clean combined exit marks every row passed.
            passed: passed || overall_ok,
            exit_code,
            output: output.to_owned(),
            metrics,
            duration: Duration::ZERO,
            required: true,
            weight: 1.0,
        })
        .collect();

    VerificationReport {
        results,
        raw_output: output.to_owned(),
    }
}

/// Runs verification nodes against a workspace.
#[derive(Debug, Clone)]
pub struct VerificationRunner {
    config: VerificationConfig,
}

impl VerificationRunner {
    pub fn new(config: VerificationConfig) -> Self {
        Self { config }
    }

    /// Run all nodes (or the single-command fallback) in `cwd`.
    pub async fn run(&self, cwd: &Path) -> Result<VerificationReport> {
        if self.config.nodes.is_empty() {
            let timeout = Duration::from_secs(self.config.timeout.max(1));
            let (exit_code, output) = run_shell(&self.config.command, cwd, timeout).await;
            return Ok(report_from_single_command(&output, exit_code));
        }

        let (required, optional): (Vec<_>, Vec<_>) =
            self.config.nodes.iter().partition(|n| n.required);

        let mut results = Vec::with_capacity(self.config.nodes.len());

        for node in required {
            results.push(run_node(node, cwd).await);
        }

        if !optional.is_empty() {
            let futures: Vec<_> = optional.into_iter().map(|n| run_node(n, cwd)).collect();
            results.extend(join_all(futures).await);
        }

        let raw_output = results
            .iter()
            .map(|r| r.output.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        Ok(VerificationReport {
            results,
            raw_output,
        })
    }
}

/// Fold a verification report into a health snapshot row.
pub fn snapshot_from_report(report: &VerificationReport) -> Snapshot {
    let mut snapshot = Snapshot::default();
    snapshot.test_total = report.metric(VerificationKind::Test, "test_total");
    snapshot.test_passed = report.metric(VerificationKind::Test, "test_passed");
    snapshot.test_failed = report.metric(VerificationKind::Test, "test_failed");
    snapshot.lint_errors = report.metric(VerificationKind::Lint, "lint_errors");
    snapshot.type_errors = report.metric(VerificationKind::Type, "type_errors");
    snapshot.security_findings = report.metric(VerificationKind::Security, "security_findings");

    const MAX_RAW: usize = 20_000;
    snapshot.raw_output = if report.raw_output.len() > MAX_RAW {
        report.raw_output[report.raw_output.len() - MAX_RAW..].to_owned()
    } else {
        report.raw_output.clone()
    };
    snapshot
}

/// Run a setup command (e.g. dependency install) in a workspace, failing
/// on a non-zero exit or timeout.
pub async fn run_setup_command(config: &VerificationConfig, cwd: &Path) -> Result<()> {
    if config.setup_command.is_empty() {
        return Ok(());
    }
    let timeout = Duration::from_secs(config.setup_timeout.max(1));
    let (exit_code, output) = run_shell(&config.setup_command, cwd, timeout).await;
    match exit_code {
        Some(0) => Ok(()),
        Some(code) => {
            let snippet: String = output.chars().take(500).collect();
            anyhow::bail!("workspace setup failed (exit {code}): {snippet}")
        }
        None => Err(anyhow::anyhow!("workspace setup did not complete: {output}"))
            .context(config.setup_command.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts_passed_failed_and_errors() {
        let metrics = parse_test_summary("== 12 passed, 3 failed, 1 error in 4.2s ==");
        assert_eq!(metrics["test_passed"], 12);
        assert_eq!(metrics["test_failed"], 4);
        assert_eq!(metrics["test_total"], 16);
    }

    #[test]
    fn test_summary_of_empty_output_is_zero() {
        let metrics = parse_test_summary("");
        assert_eq!(metrics["test_total"], 0);
    }

    #[test]
    fn lint_counts_diagnostic_lines() {
        let output = "src/a.py:3:1: E302 expected 2 blank lines\nsrc/b.py:10:5: F401 unused\nnoise\n";
        assert_eq!(parse_lint_output(output)["lint_errors"], 2);
        assert_eq!(parse_lint_output("All checks passed!")["lint_errors"], 0);
        assert_eq!(parse_lint_output("")["lint_errors"], 0);
    }

    #[test]
    fn type_output_is_anchored() {
        let output = "src/a.py:3: error: bad type\nTraceback error: not counted\n";
        assert_eq!(parse_type_output(output)["type_errors"], 1);
        assert_eq!(parse_type_output("Success: no issues")["type_errors"], 0);
    }

    #[test]
    fn security_counts_issue_lines() {
        let output = ">> Issue: hardcoded password\n>> Issue: eval\n";
        assert_eq!(parse_security_output(output)["security_findings"], 2);
        assert_eq!(
            parse_security_output("No issues identified.")["security_findings"],
            0
        );
    }

    #[test]
    fn single_command_report_passes_on_clean_exit() {
        let report = report_from_single_command("all good", Some(0));
        assert!(report.overall_passed());
        assert_eq!(report.results.len(), 4);
    }

    #[test]
    fn single_command_report_fails_on_failing_tests() {
        let report = report_from_single_command("== 1 passed, 2 failed ==", Some(1));
        assert!(!report.overall_passed());
        let snapshot = snapshot_from_report(&report);
        assert_eq!(snapshot.test_failed, 2);
        assert_eq!(snapshot.test_passed, 1);
    }

    #[test]
    fn weighted_score_sums_passing_weights() {
        let report = VerificationReport {
            results: vec![
                VerificationResult {
                    kind: VerificationKind::Test,
                    passed: true,
                    exit_code: Some(0),
                    output: String::new(),
                    metrics: HashMap::new(),
                    duration: Duration::ZERO,
                    required: true,
                    weight: 2.0,
                },
                VerificationResult {
                    kind: VerificationKind::Lint,
                    passed: false,
                    exit_code: Some(1),
                    output: String::new(),
                    metrics: HashMap::new(),
                    duration: Duration::ZERO,
                    required: false,
                    weight: 1.0,
                },
            ],
            raw_output: String::new(),
        };
        assert!((report.weighted_score() - 2.0).abs() < f64::EPSILON);
        assert!(report.overall_passed(), "optional failure does not gate");
        assert_eq!(report.failed_kinds(), vec![VerificationKind::Lint]);
    }

    #[tokio::test]
    async fn runner_executes_nodes_in_order() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = VerificationConfig {
            nodes: vec![
                VerificationNodeConfig {
                    kind: "test".to_owned(),
                    command: "echo '2 passed'".to_owned(),
                    ..VerificationNodeConfig::default()
                },
                VerificationNodeConfig {
                    kind: "lint".to_owned(),
                    command: "true".to_owned(),
                    required: false,
                    ..VerificationNodeConfig::default()
                },
            ],
            ..VerificationConfig::default()
        };

        let runner = VerificationRunner::new(config);
        let report = runner.run(dir.path()).await.unwrap();
        assert!(report.overall_passed());
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].metrics["test_passed"], 2);
    }

    #[tokio::test]
    async fn runner_reports_required_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = VerificationConfig {
            nodes: vec![VerificationNodeConfig {
                kind: "test".to_owned(),
                command: "false".to_owned(),
                ..VerificationNodeConfig::default()
            }],
            ..VerificationConfig::default()
        };

        let runner = VerificationRunner::new(config);
        let report = runner.run(dir.path()).await.unwrap();
        assert!(!report.overall_passed());
    }

    #[tokio::test]
    async fn run_shell_times_out() {
        let dir = tempfile::TempDir::new().unwrap();
        let (code, output) = run_shell("sleep 30", dir.path(), Duration::from_millis(100)).await;
        assert!(code.is_none());
        assert!(output.contains("timed out"));
    }
}
