//! Fixup flow: promote the working branch to green when it verifies, or
//! race N repair candidates and land the best one.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{info, warn};

use super::GreenBranchManager;
use crate::git::{git, git_ok, rev_parse};
use crate::verify::VerificationKind;
use crate::worker::build_worker_env;

/// Distinct repair strategies, one per candidate slot.
const FIXUP_PROMPTS: &[&str] = &[
    "Fix the failing tests by modifying the implementation code. Do NOT change any test files.",
    "Fix by adjusting the test expectations to match the current implementation behavior.",
    "Fix by refactoring the surrounding code to make both tests and implementation consistent.",
];

/// Result of a single fixup candidate attempt.
#[derive(Debug, Clone, Default)]
pub struct FixupCandidate {
    pub branch: String,
    pub verification_passed: bool,
    pub tests_passed: i64,
    pub lint_errors: i64,
    pub diff_lines: i64,
    pub failure_reason: String,
    workspace: Option<PathBuf>,
}

/// Result of the promote-or-repair pass over the working branch.
#[derive(Debug, Clone, Default)]
pub struct FixupResult {
    /// Whether the green branch now contains the round's work (either the
    /// working branch verified clean, or a repair candidate landed).
    pub promoted: bool,
    pub fixup_attempts: usize,
    pub winner: Option<FixupCandidate>,
    pub candidates: Vec<FixupCandidate>,
}

impl GreenBranchManager {
    /// Try to promote the working branch to green.
    ///
    /// When working verifies clean it is fast-forwarded into green. When
    /// it does not, N repair candidates run in parallel (each in its own
    /// pool workspace, on its own branch from green); the best passing
    /// candidate -- most tests passing, then fewest lint errors, then
    /// smallest diff -- is merged into green. All candidate branches are
    /// deleted afterwards.
    pub async fn run_fixup(&self) -> Result<FixupResult> {
        let working = self.working_branch_name();
        let working_head = rev_parse(self.workspace(), &working)
            .await?
            .unwrap_or_default();
        if working_head.is_empty() {
            warn!("working branch missing, nothing to promote");
            return Ok(FixupResult::default());
        }

        let report = self.verify_at_branch(&working_head, &working).await?;
        if report.overall_passed() {
            let promoted = self.promote_working().await?;
            return Ok(FixupResult {
                promoted,
                ..FixupResult::default()
            });
        }

        let failure_output = tail(&report.raw_output, 4000);
        let n = self.fixup_candidate_count().max(1);
        info!(candidates = n, "working branch failed verification, running fixup");

        let futures: Vec<_> = (0..n)
            .map(|i| {
                let prompt = FIXUP_PROMPTS[i % FIXUP_PROMPTS.len()];
                self.run_fixup_candidate(i, prompt, &failure_output)
            })
            .collect();
        let candidates: Vec<FixupCandidate> = join_all(futures).await;

        let mut result = FixupResult {
            fixup_attempts: n,
            candidates: candidates.clone(),
            ..FixupResult::default()
        };

        let mut passing: Vec<FixupCandidate> = candidates
            .iter()
            .filter(|c| c.verification_passed)
            .cloned()
            .collect();
        if passing.is_empty() {
            warn!(candidates = n, "all fixup candidates failed verification");
            self.release_candidates(&candidates).await;
            return Ok(result);
        }

        passing.sort_by_key(|c| (-c.tests_passed, c.lint_errors, c.diff_lines));
        let winner = passing.remove(0);

        let landed = self.land_fixup_winner(&winner).await?;
        if landed {
            info!(
                branch = %winner.branch,
                tests_passed = winner.tests_passed,
                lint_errors = winner.lint_errors,
                diff_lines = winner.diff_lines,
                "fixup winner merged into green"
            );
            result.promoted = true;
            result.winner = Some(winner);
        }

        self.release_candidates(&candidates).await;
        Ok(result)
    }

    fn working_branch_name(&self) -> String {
        self.working().to_owned()
    }

    fn fixup_candidate_count(&self) -> usize {
        self.config().green_branch.fixup_candidates
    }

    /// Fast-forward green to the working branch (regular merge fallback).
    async fn promote_working(&self) -> Result<bool> {
        let green = self.green().to_owned();
        let working = self.working().to_owned();

        let _lock = self.lock().await;
        let ws = self.workspace();
        git_ok(ws, &["checkout", &green]).await?;

        if !git_ok(ws, &["merge", "--ff-only", &working]).await? {
            let message = format!("Promote {working} into {green}");
            let merge = git(ws, &["merge", "--no-ff", &working, "-m", &message]).await?;
            if !merge.ok {
                git_ok(ws, &["merge", "--abort"]).await?;
                warn!(output = %merge.output, "failed to promote working into green");
                return Ok(false);
            }
        }

        self.sync_to_source().await?;
        info!(working = %working, green = %green, "promoted working into green");
        Ok(true)
    }

    /// Run one repair candidate in its own pool workspace.
    async fn run_fixup_candidate(
        &self,
        index: usize,
        prompt: &str,
        failure_output: &str,
    ) -> FixupCandidate {
        let branch = format!("mc/fixup-candidate-{index}");
        let mut candidate = FixupCandidate {
            branch: branch.clone(),
            ..FixupCandidate::default()
        };

        let ws = match self.pool().acquire().await {
            Ok(Some(ws)) => ws,
            Ok(None) => {
                candidate.failure_reason = "no workspace available".to_owned();
                return candidate;
            }
            Err(e) => {
                candidate.failure_reason = format!("workspace acquisition failed: {e}");
                return candidate;
            }
        };
        candidate.workspace = Some(ws.clone());

        if let Err(e) = self.prepare_candidate_branch(&ws, &branch).await {
            candidate.failure_reason = format!("branch setup failed: {e}");
            return candidate;
        }

        let full_prompt = format!(
            "{prompt}\n\n## Verification Failure\n{failure_output}\n\n\
             ## Verification Command\n{command}\n\n\
             Run the verification command after making changes. \
             Commit your fix if verification passes.",
            command = self.config().target.verification.command,
        );

        let scheduler = &self.config().scheduler;
        let mut argv: Vec<String> = vec![scheduler.worker_program.clone()];
        argv.extend(scheduler.worker_args.iter().cloned());
        argv.push(full_prompt);

        let timeout = Duration::from_secs(scheduler.llm_timeout.max(1));
        if let Err(e) = run_argv(&argv, &ws, timeout).await {
            warn!(candidate = index, error = %e, "fixup session failed");
        }

        // Commit whatever the session left uncommitted.
        if let Err(e) = commit_all(&ws, &format!("Fixup candidate {index}")).await {
            warn!(candidate = index, error = %e, "failed to commit fixup work");
        }

        match self.verify_candidate(&ws).await {
            Ok(report) => {
                candidate.verification_passed = report.overall_passed();
                candidate.tests_passed = metric(&report.results, VerificationKind::Test, "test_passed");
                candidate.lint_errors = metric(&report.results, VerificationKind::Lint, "lint_errors");
            }
            Err(e) => {
                candidate.failure_reason = format!("verification failed to run: {e}");
                return candidate;
            }
        }

        let green_ref = format!("origin/{}", self.green());
        let range = format!("{green_ref}..HEAD");
        if let Ok(diff) = git(&ws, &["diff", "--stat", &range]).await {
            candidate.diff_lines = count_diff_lines(&diff.output);
        }

        candidate
    }

    async fn prepare_candidate_branch(&self, ws: &Path, branch: &str) -> Result<()> {
        let green_ref = format!("origin/{}", self.green());
        git_ok(ws, &["fetch", "origin"]).await?;
        if !git_ok(ws, &["checkout", "-B", branch, &green_ref]).await? {
            anyhow::bail!("could not create candidate branch {branch}");
        }
        Ok(())
    }

    async fn verify_candidate(&self, ws: &Path) -> Result<crate::verify::VerificationReport> {
        self.runner().run(ws).await
    }

    /// Fetch the winning candidate branch from its workspace and merge it
    /// into green.
    async fn land_fixup_winner(&self, winner: &FixupCandidate) -> Result<bool> {
        let Some(ref candidate_ws) = winner.workspace else {
            return Ok(false);
        };
        let green = self.green().to_owned();
        let remote_name = format!("fixup-{}", winner.branch.replace('/', "-"));

        let _lock = self.lock().await;
        let ws = self.workspace();
        let candidate_path = candidate_ws.to_string_lossy().into_owned();

        git_ok(ws, &["remote", "add", &remote_name, &candidate_path]).await?;

        let landed = async {
            if !git_ok(ws, &["fetch", &remote_name, &winner.branch]).await? {
                return Ok::<bool, anyhow::Error>(false);
            }
            git_ok(ws, &["checkout", &green]).await?;

            let remote_ref = format!("{remote_name}/{}", winner.branch);
            if !git_ok(ws, &["merge", "--ff-only", &remote_ref]).await? {
                let message = format!("Merge fixup candidate {}", winner.branch);
                let merge = git(ws, &["merge", "--no-ff", &remote_ref, "-m", &message]).await?;
                if !merge.ok {
                    git_ok(ws, &["merge", "--abort"]).await?;
                    return Ok(false);
                }
            }

            self.sync_to_source().await?;
            Ok(true)
        }
        .await;

        git_ok(ws, &["remote", "remove", &remote_name]).await?;
        landed
    }

    /// Delete every candidate branch and return the workspaces to the
    /// pool. Pool resets preserve branch refs, so the branches must be
    /// reclaimed here.
    async fn release_candidates(&self, candidates: &[FixupCandidate]) {
        let base = self.config().target.branch.clone();
        for candidate in candidates {
            if let Some(ref ws) = candidate.workspace {
                // Step off the candidate branch so it can be deleted.
                let _ = git_ok(ws, &["checkout", &base]).await;
                let _ = git_ok(ws, &["branch", "-D", &candidate.branch]).await;
                if let Err(e) = self.pool().release(ws).await {
                    warn!(workspace = %ws.display(), error = %e, "failed to release candidate workspace");
                }
            }
        }
    }
}

fn metric(
    results: &[crate::verify::VerificationResult],
    kind: VerificationKind,
    key: &str,
) -> i64 {
    results
        .iter()
        .find(|r| r.kind == kind)
        .and_then(|r| r.metrics.get(key).copied())
        .unwrap_or(0)
}

/// Count total insertions + deletions from `git diff --stat` output.
///
/// The summary line looks like:
/// `3 files changed, 10 insertions(+), 5 deletions(-)`
fn count_diff_lines(diff_stat_output: &str) -> i64 {
    for line in diff_stat_output.lines().rev() {
        if !line.contains("changed") {
            continue;
        }
        let mut total: i64 = 0;
        for part in line.split(',') {
            let part = part.trim();
            if part.contains("insertion") || part.contains("deletion") {
                let digits: String = part.chars().filter(char::is_ascii_digit).collect();
                if let Ok(n) = digits.parse::<i64>() {
                    total += n;
                }
            }
        }
        return total;
    }
    0
}

/// Stage and commit everything in a workspace; no-op when clean.
async fn commit_all(ws: &Path, message: &str) -> Result<()> {
    git_ok(ws, &["config", "user.email", "mission-control@localhost"]).await?;
    git_ok(ws, &["config", "user.name", "mission-control"]).await?;
    git_ok(ws, &["add", "-A"]).await?;

    let status = git(ws, &["status", "--porcelain"]).await?;
    if status.output.trim().is_empty() {
        return Ok(());
    }

    let commit = git(ws, &["commit", "-m", message]).await?;
    if !commit.ok {
        anyhow::bail!("git commit failed: {}", commit.output);
    }
    Ok(())
}

/// Run an argv-form command with a timeout, discarding output into a
/// bounded tail. Kills the child on expiry.
async fn run_argv(argv: &[String], cwd: &Path, timeout: Duration) -> Result<()> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("empty argv"))?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .env_clear()
        .envs(build_worker_env(&Default::default()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let drain = async {
        let mut sink = Vec::new();
        if let Some(ref mut pipe) = stdout {
            pipe.read_to_end(&mut sink).await.ok();
        }
        if let Some(ref mut pipe) = stderr {
            pipe.read_to_end(&mut sink).await.ok();
        }
    };

    match tokio::time::timeout(timeout, async { tokio::join!(child.wait(), drain) }).await {
        Ok((status, ())) => {
            let status = status?;
            if !status.success() {
                anyhow::bail!("fixup session exited with {status}");
            }
            Ok(())
        }
        Err(_) => {
            let _ = child.kill().await;
            anyhow::bail!("fixup session timed out after {}s", timeout.as_secs())
        }
    }
}

fn tail(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut start = s.len() - max;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_line_counting() {
        let output = " src/a.rs | 10 ++++++----\n 3 files changed, 10 insertions(+), 5 deletions(-)\n";
        assert_eq!(count_diff_lines(output), 15);
        assert_eq!(count_diff_lines("1 file changed, 2 insertions(+)\n"), 2);
        assert_eq!(count_diff_lines(""), 0);
    }

    #[test]
    fn tail_keeps_suffix() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }
}
