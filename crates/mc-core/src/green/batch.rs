//! Speculative batch merge with bisection.
//!
//! N unit branches are merged onto one speculative branch and verified
//! once. When the combined result is green, the green branch fast-forwards
//! to it; when it is not, recursive halving isolates the offending units
//! in O(log N) verification passes.

use std::path::PathBuf;

use anyhow::Result;
use futures::future::BoxFuture;
use tracing::{info, warn};

use super::{FailureStage, GreenBranchManager, UnitMergeResult, truncate};
use crate::git::{git, git_ok, rev_parse};
use mc_db::models::new_id;

/// One candidate in a batch merge.
#[derive(Debug, Clone)]
pub struct BatchUnit {
    pub workspace: PathBuf,
    pub branch: String,
    pub acceptance_criteria: String,
    pub unit_id: Option<String>,
}

impl GreenBranchManager {
    /// Merge multiple units speculatively as a batch.
    ///
    /// Single-item lists delegate to [`GreenBranchManager::merge_unit`].
    /// Any batch-protocol error falls back to individual merges.
    pub async fn merge_batch(&self, units: &[BatchUnit]) -> Result<Vec<UnitMergeResult>> {
        if units.len() <= 1 {
            let Some(unit) = units.first() else {
                return Ok(Vec::new());
            };
            return Ok(vec![self.merge_one(unit).await?]);
        }

        let green = self.green().to_owned();
        let spec_branch = "mc/speculative-batch";

        // Phase 1: merge all units onto the speculative branch under lock.
        let mut results: Vec<UnitMergeResult> = Vec::with_capacity(units.len());
        let mut merge_hashes: Vec<String> = Vec::new();
        let mut failed_indices: Vec<usize> = Vec::new();

        let spec_branch_ok = {
            let _lock = self.lock().await;
            let ws = self.workspace();
            git_ok(ws, &["checkout", &green]).await?;
            // -B resets a stale speculative branch from a previous batch.
            let created = git_ok(ws, &["checkout", "-B", spec_branch, &green]).await?;

            if created {
                for (i, unit) in units.iter().enumerate() {
                    match self.merge_branch_onto(spec_branch, unit).await? {
                        Some(failure) => {
                            results.push(failure);
                            failed_indices.push(i);
                        }
                        None => {
                            let hash = rev_parse(ws, "HEAD").await?.unwrap_or_default();
                            merge_hashes.push(hash);
                            results.push(UnitMergeResult::default());
                        }
                    }
                }
            }

            git_ok(ws, &["checkout", &green]).await?;
            created
        };

        if !spec_branch_ok {
            warn!("could not create speculative branch, falling back");
            return self.fallback_individual(units).await;
        }

        let mergeable: Vec<usize> = (0..units.len())
            .filter(|i| !failed_indices.contains(i))
            .collect();
        if mergeable.is_empty() {
            git_ok(self.workspace(), &["branch", "-D", spec_branch]).await?;
            return Ok(results);
        }

        // Phase 2: one verification of the combined result, outside the
        // lock and pinned to the speculative head.
        if self.verify_before_merge() {
            let spec_head = rev_parse(self.workspace(), spec_branch)
                .await?
                .unwrap_or_default();
            let report = self.verify_at_branch(&spec_head, spec_branch).await?;

            if !report.overall_passed() {
                warn!(
                    units = mergeable.len(),
                    "batch verification failed, bisecting"
                );
                let subset: Vec<BatchUnit> =
                    mergeable.iter().map(|&i| units[i].clone()).collect();
                let bisected = self.bisect_batch(&subset).await?;
                for (j, &idx) in mergeable.iter().enumerate() {
                    results[idx] = bisected[j].clone();
                }
                git_ok(self.workspace(), &["branch", "-D", spec_branch]).await?;
                return Ok(results);
            }
        }

        // Phase 3: fast-forward green to the speculative branch.
        let landed;
        let mut sync_ok = true;
        {
            let _lock = self.lock().await;
            let ws = self.workspace();
            git_ok(ws, &["checkout", &green]).await?;
            let mut ff = git(ws, &["merge", "--ff-only", spec_branch]).await?;
            if !ff.ok {
                let message = format!("Merge speculative batch into {green}");
                ff = git(ws, &["merge", "--no-ff", spec_branch, "-m", &message]).await?;
            }
            landed = ff.ok;

            if landed {
                sync_ok = self.sync_to_source().await?;
                if self.auto_push() {
                    self.bump_merge_counter(mergeable.len());
                    self.maybe_push(false).await?;
                }
            } else {
                warn!(output = %ff.output, "failed to land speculative batch, falling back");
                git_ok(ws, &["branch", "-D", spec_branch]).await?;
            }
        }

        if !landed {
            return self.fallback_individual(units).await;
        }

        git_ok(self.workspace(), &["branch", "-D", spec_branch]).await?;

        let mut hash_iter = merge_hashes.into_iter();
        for &idx in &mergeable {
            results[idx] = UnitMergeResult {
                merged: true,
                verification_passed: true,
                merge_commit_hash: hash_iter.next().unwrap_or_default(),
                sync_ok,
                ..UnitMergeResult::default()
            };
        }
        info!(merged = mergeable.len(), "speculative batch landed");

        Ok(results)
    }

    async fn merge_one(&self, unit: &BatchUnit) -> Result<UnitMergeResult> {
        self.merge_unit(
            &unit.workspace,
            &unit.branch,
            &unit.acceptance_criteria,
            unit.unit_id.as_deref(),
        )
        .await
    }

    /// Fetch a unit branch, rebase it onto `target`, and merge `--no-ff`.
    /// The caller must hold the merge lock with `target` checked out.
    async fn merge_branch_onto(
        &self,
        target: &str,
        unit: &BatchUnit,
    ) -> Result<Option<UnitMergeResult>> {
        let ws = self.workspace();
        let branch = unit.branch.as_str();
        let remote_name = format!("worker-{branch}");
        let worker_path = unit.workspace.to_string_lossy().into_owned();

        git_ok(ws, &["remote", "add", &remote_name, &worker_path]).await?;

        if !git_ok(ws, &["fetch", &remote_name, branch]).await? {
            git_ok(ws, &["remote", "remove", &remote_name]).await?;
            return Ok(Some(UnitMergeResult::failure(
                FailureStage::Fetch,
                "Failed to fetch unit branch",
            )));
        }

        let rebase_branch = format!("mc/rebase-{branch}");
        let remote_ref = format!("{remote_name}/{branch}");
        git_ok(ws, &["branch", "-D", &rebase_branch]).await?;
        git_ok(ws, &["branch", &rebase_branch, &remote_ref]).await?;

        let rebase = git(ws, &["rebase", target, &rebase_branch]).await?;
        if !rebase.ok {
            git_ok(ws, &["rebase", "--abort"]).await?;
            git_ok(ws, &["checkout", target]).await?;
            git_ok(ws, &["branch", "-D", &rebase_branch]).await?;
            git_ok(ws, &["remote", "remove", &remote_name]).await?;
            return Ok(Some(UnitMergeResult::failure(
                FailureStage::MergeConflict,
                format!("Rebase conflict: {}", truncate(&rebase.output, 500)),
            )));
        }

        git_ok(ws, &["checkout", target]).await?;
        let message = format!("Merge {branch} (rebased) into {target}");
        let merge = git(ws, &["merge", "--no-ff", &rebase_branch, "-m", &message]).await?;
        git_ok(ws, &["branch", "-D", &rebase_branch]).await?;
        git_ok(ws, &["remote", "remove", &remote_name]).await?;

        if !merge.ok {
            git_ok(ws, &["merge", "--abort"]).await?;
            return Ok(Some(UnitMergeResult::failure(
                FailureStage::MergeConflict,
                format!("Merge failed after rebase: {}", truncate(&merge.output, 500)),
            )));
        }

        Ok(None)
    }

    /// Recursively split a failing batch in half to isolate offenders.
    fn bisect_batch<'a>(
        &'a self,
        units: &'a [BatchUnit],
    ) -> BoxFuture<'a, Result<Vec<UnitMergeResult>>> {
        Box::pin(async move {
            if units.len() <= 1 {
                let Some(unit) = units.first() else {
                    return Ok(Vec::new());
                };
                return Ok(vec![self.merge_one(unit).await?]);
            }

            let mid = units.len() / 2;
            let mut left = self.test_half_batch(&units[..mid]).await?;
            let right = self.test_half_batch(&units[mid..]).await?;
            left.extend(right);
            Ok(left)
        })
    }

    /// Merge a half-batch onto a temp branch and verify it as a group. A
    /// clean half merges individually; a dirty half recurses.
    fn test_half_batch<'a>(
        &'a self,
        units: &'a [BatchUnit],
    ) -> BoxFuture<'a, Result<Vec<UnitMergeResult>>> {
        Box::pin(async move {
            if units.len() <= 1 {
                let Some(unit) = units.first() else {
                    return Ok(Vec::new());
                };
                return Ok(vec![self.merge_one(unit).await?]);
            }

            let green = self.green().to_owned();
            let temp_branch = format!("mc/bisect-{}", &new_id()[..8]);

            let all_ok = {
                let _lock = self.lock().await;
                let ws = self.workspace();
                git_ok(ws, &["checkout", &green]).await?;
                git_ok(ws, &["checkout", "-B", &temp_branch, &green]).await?;

                let mut all_ok = true;
                for unit in units {
                    if self.merge_branch_onto(&temp_branch, unit).await?.is_some() {
                        all_ok = false;
                        break;
                    }
                }

                git_ok(ws, &["checkout", &green]).await?;
                all_ok
            };

            if !all_ok {
                // A conflict inside this half; split further.
                git_ok(self.workspace(), &["branch", "-D", &temp_branch]).await?;
                return self.bisect_batch(units).await;
            }

            let temp_head = rev_parse(self.workspace(), &temp_branch)
                .await?
                .unwrap_or_default();
            let report = self.verify_at_branch(&temp_head, &temp_branch).await?;
            git_ok(self.workspace(), &["branch", "-D", &temp_branch]).await?;

            if report.overall_passed() {
                // The whole half is clean; land each unit individually.
                let mut results = Vec::with_capacity(units.len());
                for unit in units {
                    results.push(self.merge_one(unit).await?);
                }
                Ok(results)
            } else {
                self.bisect_batch(units).await
            }
        })
    }

    async fn fallback_individual(&self, units: &[BatchUnit]) -> Result<Vec<UnitMergeResult>> {
        let mut results = Vec::with_capacity(units.len());
        for unit in units {
            results.push(self.merge_one(unit).await?);
        }
        Ok(results)
    }
}
