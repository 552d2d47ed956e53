//! Green-branch manager: serializes worker branches onto the verified
//! integration branch.
//!
//! Two branches live in the orchestrator's own workspace clone:
//! `mc/working` (scratch) and `mc/green` (verified integration head).
//! Merges follow a three-phase optimistic protocol: fast git ops under the
//! merge lock, slow verification outside it, finalization back under it.
//! A merge that fails verification is removed via `git revert -m 1`, which
//! stays correct even when HEAD advanced during verification.

mod batch;
mod fixup;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub use batch::BatchUnit;
pub use fixup::{FixupCandidate, FixupResult};

use crate::config::{MergePolicy, MissionConfig};
use crate::git::{git, git_ok, rev_parse};
use crate::verify::{VerificationReport, VerificationRunner, run_setup_command, run_shell};
use crate::workspace::WorkspacePool;
use mc_db::Store;
use mc_db::models::{MergeRequest, MergeStatus, WorkUnit};
use mc_db::queries::merge_requests;

/// Where a failed merge attempt gave up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailureStage {
    #[default]
    None,
    Fetch,
    MergeConflict,
    PreMergeVerification,
    AcceptanceCriteria,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Fetch => "fetch",
            Self::MergeConflict => "merge_conflict",
            Self::PreMergeVerification => "pre_merge_verification",
            Self::AcceptanceCriteria => "acceptance_criteria",
        };
        f.write_str(s)
    }
}

/// Result of merging a single work unit into the green branch.
#[derive(Debug, Clone)]
pub struct UnitMergeResult {
    pub merged: bool,
    pub rebase_ok: bool,
    pub verification_passed: bool,
    pub failure_output: String,
    pub failure_stage: FailureStage,
    pub merge_commit_hash: String,
    pub changed_files: Vec<String>,
    pub sync_ok: bool,
}

impl Default for UnitMergeResult {
    fn default() -> Self {
        Self {
            merged: false,
            rebase_ok: true,
            verification_passed: false,
            failure_output: String::new(),
            failure_stage: FailureStage::None,
            merge_commit_hash: String::new(),
            changed_files: Vec::new(),
            sync_ok: true,
        }
    }
}

impl UnitMergeResult {
    fn failure(stage: FailureStage, output: impl Into<String>) -> Self {
        Self {
            failure_stage: stage,
            failure_output: output.into(),
            rebase_ok: stage != FailureStage::MergeConflict,
            ..Self::default()
        }
    }
}

/// Outcome of integrating one completed unit, as seen by the dispatcher.
#[derive(Debug, Clone)]
pub enum IntegrationOutcome {
    Merged { commit_hash: String },
    Rejected { stage: FailureStage, details: String },
}

/// Seam between the dispatcher and whichever integration path the
/// controller mode selects.
#[async_trait]
pub trait Integrator: Send + Sync {
    async fn integrate(
        &self,
        unit: &WorkUnit,
        workspace: &Path,
        branch: &str,
    ) -> Result<IntegrationOutcome>;
}

/// Manages the working/green branch pair and the serialized merge queue.
pub struct GreenBranchManager {
    config: MissionConfig,
    store: Arc<Store>,
    pool: Arc<WorkspacePool>,
    workspace: PathBuf,
    runner: VerificationRunner,
    merge_lock: Mutex<()>,
    merges_since_push: AtomicUsize,
}

impl GreenBranchManager {
    pub fn new(
        config: MissionConfig,
        store: Arc<Store>,
        pool: Arc<WorkspacePool>,
        workspace: PathBuf,
    ) -> Self {
        let runner = VerificationRunner::new(config.target.verification.clone());
        Self {
            config,
            store,
            pool,
            workspace,
            runner,
            merge_lock: Mutex::new(()),
            merges_since_push: AtomicUsize::new(0),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    fn source_repo(&self) -> &Path {
        &self.config.target.path
    }

    fn green(&self) -> &str {
        &self.config.green_branch.green_branch
    }

    fn working(&self) -> &str {
        &self.config.green_branch.working_branch
    }

    async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.merge_lock.lock().await
    }

    fn config(&self) -> &MissionConfig {
        &self.config
    }

    fn pool(&self) -> &Arc<WorkspacePool> {
        &self.pool
    }

    fn runner(&self) -> &VerificationRunner {
        &self.runner
    }

    fn verify_before_merge(&self) -> bool {
        self.config.green_branch.verify_before_merge
    }

    fn auto_push(&self) -> bool {
        self.config.green_branch.auto_push
    }

    fn bump_merge_counter(&self, n: usize) {
        self.merges_since_push.fetch_add(n, Ordering::Relaxed);
    }

    /// Create (or reset) the working and green branches.
    ///
    /// Branches are created in the SOURCE repo first so worker clones
    /// (whose origin is the source repo) can check them out. When
    /// resetting with auto-push enabled, unpushed green commits are
    /// flushed upstream before the reset destroys them.
    pub async fn initialize(&self) -> Result<()> {
        let base = self.config.target.branch.clone();
        let gb = &self.config.green_branch;
        let source = self.source_repo().to_path_buf();

        if gb.reset_on_init && gb.auto_push {
            if rev_parse(&source, self.green()).await?.is_some() {
                let range = format!("{base}..{}", self.green());
                let ahead = git(&source, &["rev-list", "--count", &range]).await?;
                if ahead.ok && !matches!(ahead.output.trim(), "" | "0") {
                    warn!(
                        commits = %ahead.output.trim(),
                        "green branch has unpushed commits, pushing before reset"
                    );
                    self.push_green_upstream().await?;
                }
            }
        }

        for branch in [gb.working_branch.clone(), gb.green_branch.clone()] {
            if rev_parse(&source, &branch).await?.is_none() {
                info!(branch = %branch, base = %base, "creating branch in source repo");
                git_ok(&source, &["branch", &branch, &base]).await?;
            } else if gb.reset_on_init {
                info!(branch = %branch, base = %base, "resetting branch in source repo");
                let refname = format!("refs/heads/{branch}");
                git_ok(&source, &["update-ref", &refname, &base]).await?;
            }
        }

        git_ok(&self.workspace, &["fetch", "origin"]).await?;
        git_ok(&self.workspace, &["checkout", &base]).await?;

        for branch in [gb.working_branch.clone(), gb.green_branch.clone()] {
            if rev_parse(&self.workspace, &branch).await?.is_none() {
                let origin_ref = format!("origin/{branch}");
                git_ok(&self.workspace, &["branch", &branch, &origin_ref]).await?;
            } else if gb.reset_on_init {
                let refname = format!("refs/heads/{branch}");
                git_ok(&self.workspace, &["update-ref", &refname, &base]).await?;
            }
        }

        run_setup_command(&self.config.target.verification, &self.workspace).await
    }

    /// Current commit hash of the green branch.
    pub async fn green_hash(&self) -> Result<String> {
        Ok(rev_parse(&self.workspace, self.green())
            .await?
            .unwrap_or_default())
    }

    // -----------------------------------------------------------------
    // Single-unit merge (three-phase protocol)
    // -----------------------------------------------------------------

    /// Merge a unit branch into the green branch.
    ///
    /// Phase 1 (locked, fast): fetch + rebase + `merge --no-ff`.
    /// Phase 2 (unlocked, slow): verification pinned to the merge commit,
    /// then acceptance criteria; rollback via revert on failure.
    /// Phase 3 (locked): tolerate HEAD advancement, sync refs to the
    /// source repo, batch-push upstream.
    pub async fn merge_unit(
        &self,
        worker_workspace: &Path,
        branch_name: &str,
        acceptance_criteria: &str,
        unit_id: Option<&str>,
    ) -> Result<UnitMergeResult> {
        // --- Phase 1 ---
        if let Some(failed) = self.merge_git_ops(worker_workspace, branch_name).await? {
            self.record_merge_request(unit_id, branch_name, "", &failed)
                .await;
            return Ok(failed);
        }

        let merge_commit_hash = self.green_hash().await?;
        let range_base = format!("{merge_commit_hash}~1");
        let diff = git(
            &self.workspace,
            &["diff", "--name-only", &range_base, &merge_commit_hash],
        )
        .await?;
        let changed_files: Vec<String> = diff
            .output
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();

        // --- Phase 2 (no merge lock held) ---
        let mut verification_passed = true;
        if self.config.green_branch.verify_before_merge {
            let green_branch = self.green().to_owned();
            let report = self
                .verify_at_branch(&merge_commit_hash, &green_branch)
                .await?;
            verification_passed = report.overall_passed();
            if !verification_passed {
                warn!(branch = %branch_name, "pre-merge verification failed, rolling back");
                self.rollback_merge(&merge_commit_hash, branch_name).await;
                let failed = UnitMergeResult {
                    failure_output: truncate(&report.raw_output, 2000),
                    failure_stage: FailureStage::PreMergeVerification,
                    merge_commit_hash: merge_commit_hash.clone(),
                    ..UnitMergeResult::default()
                };
                self.record_merge_request(unit_id, branch_name, &merge_commit_hash, &failed)
                    .await;
                return Ok(failed);
            }
        }

        if !acceptance_criteria.is_empty() {
            let (code, output) = run_shell(
                acceptance_criteria,
                &self.workspace,
                Duration::from_secs(120),
            )
            .await;
            if code != Some(0) {
                warn!(branch = %branch_name, "acceptance criteria failed, rolling back");
                self.rollback_merge(&merge_commit_hash, branch_name).await;
                let failed = UnitMergeResult {
                    failure_output: truncate(&output, 2000),
                    failure_stage: FailureStage::AcceptanceCriteria,
                    merge_commit_hash: merge_commit_hash.clone(),
                    ..UnitMergeResult::default()
                };
                self.record_merge_request(unit_id, branch_name, &merge_commit_hash, &failed)
                    .await;
                return Ok(failed);
            }
        }

        // --- Phase 3 ---
        let sync_ok;
        {
            let _lock = self.merge_lock.lock().await;
            let current_head = self.green_hash().await?;
            if current_head != merge_commit_hash {
                // Another merge landed while we verified. Our commit is
                // still in history and was verified at its own hash, so
                // sync is safe.
                info!(
                    branch = %branch_name,
                    verified = %short(&merge_commit_hash),
                    head = %short(&current_head),
                    "HEAD advanced during verification, proceeding"
                );
            }

            sync_ok = self.sync_to_source().await?;

            if self.config.green_branch.auto_push {
                self.merges_since_push.fetch_add(1, Ordering::Relaxed);
                self.maybe_push(false).await?;
            }
        }

        let result = UnitMergeResult {
            merged: true,
            verification_passed,
            merge_commit_hash,
            changed_files,
            sync_ok,
            ..UnitMergeResult::default()
        };
        self.record_merge_request(unit_id, branch_name, &result.merge_commit_hash, &result)
            .await;
        Ok(result)
    }

    /// Phase 1: fast git operations under the merge lock.
    ///
    /// Returns `None` on success (the merge commit is on the green branch)
    /// or the failure result.
    async fn merge_git_ops(
        &self,
        worker_workspace: &Path,
        branch_name: &str,
    ) -> Result<Option<UnitMergeResult>> {
        let green = self.green().to_owned();
        let remote_name = format!("worker-{branch_name}");
        let ws = &self.workspace;

        let _lock = self.merge_lock.lock().await;

        let worker_path = worker_workspace.to_string_lossy().into_owned();
        git_ok(ws, &["remote", "add", &remote_name, &worker_path]).await?;
        if !git_ok(ws, &["fetch", &remote_name, branch_name]).await? {
            git_ok(ws, &["remote", "remove", &remote_name]).await?;
            return Ok(Some(UnitMergeResult::failure(
                FailureStage::Fetch,
                "Failed to fetch unit branch",
            )));
        }

        let outcome = async {
            git_ok(ws, &["checkout", &green]).await?;
            git_ok(ws, &["reset", "--hard", "HEAD"]).await?;
            git_ok(ws, &["clean", "-fd"]).await?;

            let rebase_branch = format!("mc/rebase-{branch_name}");
            let remote_ref = format!("{remote_name}/{branch_name}");
            git_ok(ws, &["branch", "-D", &rebase_branch]).await?;
            git_ok(ws, &["branch", &rebase_branch, &remote_ref]).await?;

            let rebase = git(ws, &["rebase", &green, &rebase_branch]).await?;
            if !rebase.ok {
                git_ok(ws, &["rebase", "--abort"]).await?;
                git_ok(ws, &["checkout", &green]).await?;
                git_ok(ws, &["branch", "-D", &rebase_branch]).await?;
                warn!(branch = %branch_name, "rebase conflict");
                return Ok(Some(UnitMergeResult::failure(
                    FailureStage::MergeConflict,
                    format!("Rebase conflict: {}", truncate(&rebase.output, 500)),
                )));
            }

            git_ok(ws, &["checkout", &green]).await?;
            let message = format!("Merge {branch_name} (rebased) into {green}");
            let merge = git(
                ws,
                &["merge", "--no-ff", &rebase_branch, "-m", &message],
            )
            .await?;
            git_ok(ws, &["branch", "-D", &rebase_branch]).await?;
            if !merge.ok {
                git_ok(ws, &["merge", "--abort"]).await?;
                warn!(branch = %branch_name, "merge failed after rebase");
                return Ok(Some(UnitMergeResult::failure(
                    FailureStage::MergeConflict,
                    format!("Merge failed after rebase: {}", truncate(&merge.output, 500)),
                )));
            }

            info!(branch = %branch_name, green = %green, "merged unit branch");
            Ok(None)
        }
        .await;

        // Always end back on green with the temp remote removed.
        git_ok(ws, &["checkout", &green]).await?;
        git_ok(ws, &["remote", "remove", &remote_name]).await?;

        outcome
    }

    /// Rollback a merge commit with `git revert -m 1`, which is safe even
    /// when HEAD has advanced past it.
    async fn rollback_merge(&self, merge_commit_hash: &str, branch_name: &str) {
        let _lock = self.merge_lock.lock().await;
        let green = self.green().to_owned();
        let _ = git_ok(&self.workspace, &["checkout", &green]).await;
        match git(
            &self.workspace,
            &["revert", "--no-edit", "-m", "1", merge_commit_hash],
        )
        .await
        {
            Ok(result) if result.ok => {
                info!(
                    commit = %short(merge_commit_hash),
                    branch = %branch_name,
                    "reverted merge after verification failure"
                );
            }
            Ok(result) => {
                error!(
                    commit = %short(merge_commit_hash),
                    branch = %branch_name,
                    output = %result.output,
                    "failed to revert merge"
                );
                let _ = git_ok(&self.workspace, &["revert", "--abort"]).await;
            }
            Err(e) => {
                error!(commit = %short(merge_commit_hash), error = %e, "revert invocation failed");
            }
        }
    }

    /// Run verification pinned to a specific commit, reachable from the
    /// given branch in the manager workspace.
    ///
    /// Prefers a pool workspace with the commit checked out detached, so
    /// verification of one merge pipelines with git phases of the next.
    /// Falls back to verifying in the manager workspace under the merge
    /// lock when the pool is exhausted.
    async fn verify_at_branch(
        &self,
        commit_hash: &str,
        branch: &str,
    ) -> Result<VerificationReport> {
        let green = self.green().to_owned();

        if let Some(vws) = self.pool.acquire().await? {
            let manager_path = self.workspace.to_string_lossy().into_owned();
            let pinned = git_ok(&vws, &["fetch", &manager_path, branch]).await?
                && git_ok(&vws, &["checkout", "--detach", commit_hash]).await?;

            if pinned {
                let report = self.runner.run(&vws).await;
                self.pool.release(&vws).await?;
                return report;
            }
            // Commit not reachable from this clone; fall back to the
            // locked path below.
            self.pool.release(&vws).await?;
        }

        let _lock = self.merge_lock.lock().await;
        git_ok(&self.workspace, &["checkout", "--detach", commit_hash]).await?;
        let report = self.runner.run(&self.workspace).await;
        git_ok(&self.workspace, &["checkout", &green]).await?;
        report
    }

    /// Run verification on the current green branch head.
    pub async fn verify_green(&self) -> Result<VerificationReport> {
        let _lock = self.merge_lock.lock().await;
        let green = self.green().to_owned();
        git_ok(&self.workspace, &["checkout", &green]).await?;
        self.runner.run(&self.workspace).await
    }

    // -----------------------------------------------------------------
    // Round-mode light path
    // -----------------------------------------------------------------

    /// Merge a unit branch into the working branch without verification.
    ///
    /// The round controller promotes working to green (through the fixup
    /// gate) at round end. Returns whether the merge landed.
    pub async fn merge_to_working(
        &self,
        worker_workspace: &Path,
        branch_name: &str,
    ) -> Result<bool> {
        let working = self.working().to_owned();
        let remote_name = format!("worker-{branch_name}");
        let ws = &self.workspace;

        let _lock = self.merge_lock.lock().await;

        let worker_path = worker_workspace.to_string_lossy().into_owned();
        git_ok(ws, &["remote", "add", &remote_name, &worker_path]).await?;

        let merged = async {
            if !git_ok(ws, &["fetch", &remote_name, branch_name]).await? {
                return Ok::<bool, anyhow::Error>(false);
            }
            if !git_ok(ws, &["checkout", &working]).await? {
                return Ok(false);
            }
            let remote_ref = format!("{remote_name}/{branch_name}");
            let message = format!("Merge {branch_name} into {working}");
            let merge = git(ws, &["merge", "--no-ff", &remote_ref, "-m", &message]).await?;
            if !merge.ok {
                git_ok(ws, &["merge", "--abort"]).await?;
                warn!(branch = %branch_name, "merge into working failed");
                return Ok(false);
            }
            Ok(true)
        }
        .await?;

        git_ok(ws, &["remote", "remove", &remote_name]).await?;
        Ok(merged)
    }

    // -----------------------------------------------------------------
    // Sync / push
    // -----------------------------------------------------------------

    /// Force-sync the green and working refs from the workspace clone back
    /// to the source repo, where worker clones fetch from.
    pub async fn sync_to_source(&self) -> Result<bool> {
        let source = self.source_repo().to_path_buf();
        let ws_path = self.workspace.to_string_lossy().into_owned();
        let mut all_ok = true;
        for branch in [self.green().to_owned(), self.working().to_owned()] {
            // Force-update: the workspace always has the latest merges.
            let refspec = format!("+{branch}:{branch}");
            let result = git(&source, &["fetch", &ws_path, &refspec]).await?;
            if !result.ok {
                warn!(branch = %branch, output = %result.output, "failed to sync branch to source");
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    /// Push when enough merges have accumulated (or forced). Returns
    /// whether a push was performed.
    pub async fn maybe_push(&self, force: bool) -> Result<bool> {
        let gb = &self.config.green_branch;
        if !gb.auto_push {
            return Ok(false);
        }
        if force || self.merges_since_push.load(Ordering::Relaxed) >= gb.push_batch_size {
            let pushed = self.push_green_upstream().await?;
            if pushed {
                self.merges_since_push.store(0, Ordering::Relaxed);
            }
            return Ok(pushed);
        }
        Ok(false)
    }

    /// Merge the green branch into the push branch in the SOURCE repo and
    /// push to origin.
    ///
    /// Runs in the source repo because the workspace clone's origin points
    /// back at the source repo, not upstream.
    pub async fn push_green_upstream(&self) -> Result<bool> {
        let gb = &self.config.green_branch;
        if !gb.auto_push {
            return Ok(false);
        }

        let source = self.source_repo().to_path_buf();
        let push_branch = gb.push_branch.clone();
        let green_ref = "refs/mc/green-push";

        // Fetch green into a named ref; force-update because green is
        // reset at each mission start.
        let ws_path = self.workspace.to_string_lossy().into_owned();
        let refspec = format!("+{}:{green_ref}", self.green());
        let fetch = git(&source, &["fetch", &ws_path, &refspec]).await?;
        if !fetch.ok {
            error!(output = %fetch.output, "failed to fetch green for push");
            return Ok(false);
        }

        // Stash any dirty state before the checkout.
        let stash = git(&source, &["stash", "--include-untracked"]).await?;
        let stashed = stash.ok && !stash.output.contains("No local changes");

        let pushed = async {
            if !git_ok(&source, &["checkout", &push_branch]).await? {
                return Ok::<bool, anyhow::Error>(false);
            }
            git_ok(&source, &["pull", "--rebase", "origin", &push_branch]).await?;

            if !git_ok(&source, &["merge", "--ff-only", green_ref]).await? {
                let merge = git(&source, &["merge", "--no-edit", green_ref]).await?;
                if !merge.ok {
                    error!(output = %merge.output, "failed to merge green into push branch");
                    return Ok(false);
                }
            }

            let push = git(&source, &["push", "origin", &push_branch]).await?;
            if !push.ok {
                error!(output = %push.output, "failed to push upstream");
                return Ok(false);
            }
            info!(branch = %push_branch, "pushed green upstream");
            Ok(true)
        }
        .await;

        if stashed {
            git_ok(&source, &["stash", "pop"]).await?;
        }

        pushed
    }

    async fn record_merge_request(
        &self,
        unit_id: Option<&str>,
        branch_name: &str,
        commit_hash: &str,
        result: &UnitMergeResult,
    ) {
        let Some(unit_id) = unit_id else { return };

        let record = async {
            let mut mr = MergeRequest::new(unit_id, branch_name);
            mr.commit_hash = commit_hash.to_owned();
            mr.position = merge_requests::next_merge_position(&self.store).await?;
            if result.merged {
                mr.status = MergeStatus::Merged;
                mr.verified_at = Some(Utc::now());
                mr.merged_at = Some(Utc::now());
            } else if result.failure_stage == FailureStage::MergeConflict
                || result.failure_stage == FailureStage::Fetch
            {
                mr.status = MergeStatus::Conflict;
                mr.rejection_reason = result.failure_output.clone();
            } else {
                mr.status = MergeStatus::Rejected;
                mr.rejection_reason = result.failure_output.clone();
            }
            merge_requests::insert_merge_request(&self.store, &mr).await
        };

        if let Err(e) = record.await {
            warn!(unit_id = %unit_id, error = %e, "failed to record merge request");
        }
    }
}

#[async_trait]
impl Integrator for GreenBranchManager {
    async fn integrate(
        &self,
        unit: &WorkUnit,
        workspace: &Path,
        branch: &str,
    ) -> Result<IntegrationOutcome> {
        match self.config.green_branch.merge_policy {
            MergePolicy::Working => {
                if self.merge_to_working(workspace, branch).await? {
                    Ok(IntegrationOutcome::Merged {
                        commit_hash: unit.commit_hash.clone().unwrap_or_default(),
                    })
                } else {
                    Ok(IntegrationOutcome::Rejected {
                        stage: FailureStage::MergeConflict,
                        details: "changes could not be integrated".to_owned(),
                    })
                }
            }
            MergePolicy::Green => {
                let result = self
                    .merge_unit(workspace, branch, &unit.acceptance_criteria, Some(&unit.id))
                    .await?;
                if result.merged {
                    Ok(IntegrationOutcome::Merged {
                        commit_hash: result.merge_commit_hash,
                    })
                } else {
                    Ok(IntegrationOutcome::Rejected {
                        stage: result.failure_stage,
                        details: result.failure_output,
                    })
                }
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

fn short(hash: &str) -> &str {
    &hash[..hash.len().min(8)]
}
