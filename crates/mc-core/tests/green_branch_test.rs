//! Green-branch serializer scenarios on real git repositories: conflicting
//! merges, verification rollback, speculative batching with bisection, and
//! working-branch promotion.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use mc_core::config::{MergePolicy, MissionConfig};
use mc_core::green::{BatchUnit, FailureStage, GreenBranchManager};
use mc_core::workspace::WorkspacePool;
use mc_db::Store;
use mc_db::models::{MergeStatus, Plan, WorkUnit};
use mc_db::queries::{merge_requests, plans, work_units};
use mc_test_utils::{commit_file, create_temp_repo, git, test_store};

struct Harness {
    _source_dir: TempDir,
    source: PathBuf,
    _pool_dir: TempDir,
    store: Arc<Store>,
    pool: Arc<WorkspacePool>,
    green: Arc<GreenBranchManager>,
}

async fn harness(verification_command: &str) -> Harness {
    harness_with(verification_command, |_| {}).await
}

async fn harness_with(
    verification_command: &str,
    tweak: impl FnOnce(&mut MissionConfig),
) -> Harness {
    let (source_dir, source) = create_temp_repo();
    let pool_dir = TempDir::new().unwrap();

    let mut config = MissionConfig::default();
    config.target.name = "test".to_owned();
    config.target.path = source.clone();
    config.target.branch = "main".to_owned();
    config.target.verification.command = verification_command.to_owned();
    config.target.verification.timeout = 30;
    config.green_branch.merge_policy = MergePolicy::Green;
    tweak(&mut config);

    let store = Arc::new(test_store().await.unwrap());
    let pool = Arc::new(WorkspacePool::new(
        &source,
        pool_dir.path(),
        10,
        "main",
        Some("mc/green".to_owned()),
    ));
    pool.initialize(0).await.unwrap();

    let manager_ws = pool.acquire().await.unwrap().expect("manager workspace");
    let green = Arc::new(GreenBranchManager::new(
        config,
        Arc::clone(&store),
        Arc::clone(&pool),
        manager_ws,
    ));
    green.initialize().await.unwrap();

    Harness {
        _source_dir: source_dir,
        source,
        _pool_dir: pool_dir,
        store,
        pool,
        green,
    }
}

/// Acquire a worker clone and commit `content` to `file` on a unit branch
/// based on the current green head.
async fn worker_branch(h: &Harness, branch: &str, file: &str, content: &str) -> PathBuf {
    let ws = h.pool.acquire().await.unwrap().expect("worker workspace");
    git(&ws, &["config", "user.email", "worker@mc.dev"]).unwrap();
    git(&ws, &["config", "user.name", "worker"]).unwrap();
    git(&ws, &["fetch", "origin"]).unwrap();
    git(&ws, &["checkout", "-b", branch, "origin/mc/green"]).unwrap();
    commit_file(&ws, file, content, &format!("{branch}: edit {file}"));
    ws
}

fn green_commit_count(h: &Harness) -> i64 {
    git(h.green.workspace(), &["rev-list", "--count", "mc/green"])
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

fn green_merge_count(h: &Harness) -> i64 {
    git(
        h.green.workspace(),
        &["rev-list", "--merges", "--count", "mc/green"],
    )
    .unwrap()
    .trim()
    .parse()
    .unwrap()
}

// S4 -- three units editing the same file: exactly one merges, the other
// two fail with merge conflicts, and green gains exactly one merge commit.
#[tokio::test]
async fn conflicting_units_serialize_to_one_merge() {
    let h = harness("true").await;

    let plan = Plan::new("obj");
    plans::insert_plan(&h.store, &plan).await.unwrap();
    let mut unit_ids = Vec::new();
    for i in 0..3 {
        let unit = WorkUnit::new(&plan.id, format!("unit-{i}"));
        work_units::insert_work_unit(&h.store, &unit).await.unwrap();
        unit_ids.push(unit.id);
    }

    // All three workers start from the same green snapshot, as concurrent
    // dispatch would have them.
    let mut workers = Vec::new();
    for i in 0..3 {
        let branch = format!("mc/unit-{i}");
        let ws = worker_branch(&h, &branch, "conflict.txt", &format!("version {i}\n")).await;
        workers.push((ws, branch));
    }

    let mut results = Vec::new();
    for ((ws, branch), unit_id) in workers.iter().zip(&unit_ids) {
        let result = h
            .green
            .merge_unit(ws, branch, "", Some(unit_id))
            .await
            .unwrap();
        results.push(result);
    }

    assert!(results[0].merged);
    assert!(!results[0].merge_commit_hash.is_empty());
    assert_eq!(results[0].changed_files, vec!["conflict.txt"]);

    for result in &results[1..] {
        assert!(!result.merged);
        assert_eq!(result.failure_stage, FailureStage::MergeConflict);
        assert!(!result.rebase_ok);
    }

    assert_eq!(green_merge_count(&h), 1);

    // The merge queue reflects the serialized order and outcomes.
    let mrs = merge_requests::merge_requests_for_plan(&h.store, &plan.id)
        .await
        .unwrap();
    assert_eq!(mrs.len(), 3);
    assert_eq!(mrs[0].status, MergeStatus::Merged);
    assert_eq!(mrs[1].status, MergeStatus::Conflict);
    assert_eq!(mrs[2].status, MergeStatus::Conflict);
    assert!(mrs.windows(2).all(|w| w[0].position < w[1].position));
}

// S5 -- post-merge verification failure: the merge lands, then a revert
// lands on top of it; the unit is not merged.
#[tokio::test]
async fn verification_failure_reverts_the_merge() {
    let h = harness("false").await;
    let before = green_commit_count(&h);

    let ws = worker_branch(&h, "mc/unit-bad", "feature.txt", "new feature\n").await;
    let result = h.green.merge_unit(&ws, "mc/unit-bad", "", None).await.unwrap();

    assert!(!result.merged);
    assert_eq!(result.failure_stage, FailureStage::PreMergeVerification);
    assert!(!result.merge_commit_hash.is_empty());

    // Work commit + merge commit + revert commit.
    assert_eq!(green_commit_count(&h), before + 3);
    assert_eq!(green_merge_count(&h), 1, "merge stays in history");

    let head_subject = git(
        h.green.workspace(),
        &["log", "-1", "--format=%s", "mc/green"],
    )
    .unwrap();
    assert!(
        head_subject.starts_with("Revert"),
        "HEAD should be the revert: {head_subject:?}"
    );

    // The reverted content is gone from the tree.
    git(h.green.workspace(), &["checkout", "mc/green"]).unwrap();
    assert!(!h.green.workspace().join("feature.txt").exists());
}

#[tokio::test]
async fn acceptance_criteria_failure_also_reverts() {
    let h = harness("true").await;

    let ws = worker_branch(&h, "mc/unit-ac", "feature.txt", "content\n").await;
    let result = h
        .green
        .merge_unit(&ws, "mc/unit-ac", "false", None)
        .await
        .unwrap();

    assert!(!result.merged);
    assert_eq!(result.failure_stage, FailureStage::AcceptanceCriteria);

    let head_subject = git(
        h.green.workspace(),
        &["log", "-1", "--format=%s", "mc/green"],
    )
    .unwrap();
    assert!(head_subject.starts_with("Revert"));
}

#[tokio::test]
async fn compatible_batch_lands_in_one_verification() {
    let h = harness("true").await;

    let ws_a = worker_branch(&h, "mc/unit-a", "a.txt", "a\n").await;
    let ws_b = worker_branch(&h, "mc/unit-b", "b.txt", "b\n").await;

    let units = vec![
        BatchUnit {
            workspace: ws_a,
            branch: "mc/unit-a".to_owned(),
            acceptance_criteria: String::new(),
            unit_id: None,
        },
        BatchUnit {
            workspace: ws_b,
            branch: "mc/unit-b".to_owned(),
            acceptance_criteria: String::new(),
            unit_id: None,
        },
    ];
    let results = h.green.merge_batch(&units).await.unwrap();

    assert!(results.iter().all(|r| r.merged));
    git(h.green.workspace(), &["checkout", "mc/green"]).unwrap();
    assert!(h.green.workspace().join("a.txt").exists());
    assert!(h.green.workspace().join("b.txt").exists());
    assert_eq!(green_merge_count(&h), 2);
}

// Bisection: the batch fails combined verification, the offender is
// isolated, and only the good unit lands.
#[tokio::test]
async fn failing_batch_bisects_to_the_offender() {
    let h = harness("test ! -f bad_marker.txt").await;

    let ws_good = worker_branch(&h, "mc/unit-good", "good.txt", "good\n").await;
    let ws_bad = worker_branch(&h, "mc/unit-bad", "bad_marker.txt", "bad\n").await;

    let units = vec![
        BatchUnit {
            workspace: ws_good,
            branch: "mc/unit-good".to_owned(),
            acceptance_criteria: String::new(),
            unit_id: None,
        },
        BatchUnit {
            workspace: ws_bad,
            branch: "mc/unit-bad".to_owned(),
            acceptance_criteria: String::new(),
            unit_id: None,
        },
    ];
    let results = h.green.merge_batch(&units).await.unwrap();

    assert!(results[0].merged, "clean unit should land: {:?}", results[0]);
    assert!(!results[1].merged, "offender must be rejected");
    assert_eq!(results[1].failure_stage, FailureStage::PreMergeVerification);

    git(h.green.workspace(), &["checkout", "mc/green"]).unwrap();
    assert!(h.green.workspace().join("good.txt").exists());
    assert!(!h.green.workspace().join("bad_marker.txt").exists());
}

#[tokio::test]
async fn conflicted_batch_member_is_rejected_up_front() {
    let h = harness("true").await;

    // Base the conflicting branch on the ORIGINAL green, then land a
    // different version of the same file so its rebase conflicts.
    let ws_conflict = worker_branch(&h, "mc/unit-conflict", "shared.txt", "other\n").await;

    let ws_first = worker_branch(&h, "mc/unit-first", "shared.txt", "first\n").await;
    let first = h
        .green
        .merge_unit(&ws_first, "mc/unit-first", "", None)
        .await
        .unwrap();
    assert!(first.merged);

    let ws_clean = worker_branch(&h, "mc/unit-clean", "clean.txt", "clean\n").await;

    let units = vec![
        BatchUnit {
            workspace: ws_conflict,
            branch: "mc/unit-conflict".to_owned(),
            acceptance_criteria: String::new(),
            unit_id: None,
        },
        BatchUnit {
            workspace: ws_clean,
            branch: "mc/unit-clean".to_owned(),
            acceptance_criteria: String::new(),
            unit_id: None,
        },
    ];
    let results = h.green.merge_batch(&units).await.unwrap();

    assert!(!results[0].merged);
    assert_eq!(results[0].failure_stage, FailureStage::MergeConflict);
    assert!(results[1].merged);
}

#[tokio::test]
async fn working_merge_then_promotion() {
    let h = harness("true").await;

    let ws = worker_branch(&h, "mc/unit-w", "work.txt", "round work\n").await;
    let merged = h.green.merge_to_working(&ws, "mc/unit-w").await.unwrap();
    assert!(merged);

    // Green does not have the work yet.
    git(h.green.workspace(), &["checkout", "mc/green"]).unwrap();
    assert!(!h.green.workspace().join("work.txt").exists());

    let fixup = h.green.run_fixup().await.unwrap();
    assert!(fixup.promoted);
    assert_eq!(fixup.fixup_attempts, 0, "clean working needs no candidates");

    git(h.green.workspace(), &["checkout", "mc/green"]).unwrap();
    assert!(h.green.workspace().join("work.txt").exists());

    // The synced source repo sees the promotion too.
    let source_green = git(&h.source, &["rev-parse", "mc/green"]).unwrap();
    let ws_green = git(h.green.workspace(), &["rev-parse", "mc/green"]).unwrap();
    assert_eq!(source_green.trim(), ws_green.trim());
}

// Repair path: a failing working branch races candidates; every candidate
// branch is deleted afterwards, winner included.
#[tokio::test]
async fn fixup_candidates_leave_no_branches_behind() {
    let h = harness_with("test ! -f bad.txt", |c| {
        // A do-nothing worker command: candidates stay at the green head,
        // which passes verification, so one of them wins.
        c.scheduler.worker_program = "true".to_owned();
        c.scheduler.worker_args = Vec::new();
        c.green_branch.fixup_candidates = 2;
    })
    .await;

    let ws = worker_branch(&h, "mc/unit-bad", "bad.txt", "broken\n").await;
    assert!(h.green.merge_to_working(&ws, "mc/unit-bad").await.unwrap());
    h.pool.release(&ws).await.unwrap();

    let fixup = h.green.run_fixup().await.unwrap();
    assert_eq!(fixup.fixup_attempts, 2);
    assert_eq!(fixup.candidates.len(), 2);
    assert!(fixup.promoted, "a clean candidate should land");
    assert!(fixup.winner.is_some());

    // Green never picked up the failing file.
    git(h.green.workspace(), &["checkout", "mc/green"]).unwrap();
    assert!(!h.green.workspace().join("bad.txt").exists());

    // No candidate branch survives in any pool workspace.
    let mut held = Vec::new();
    while let Some(ws) = h.pool.acquire().await.unwrap() {
        let branches = git(&ws, &["branch", "--list", "mc/fixup-candidate-*"]).unwrap();
        assert!(
            branches.trim().is_empty(),
            "candidate branches must be reclaimed: {branches:?}"
        );
        held.push(ws);
    }
    for ws in held {
        h.pool.release(&ws).await.unwrap();
    }
}

#[tokio::test]
async fn conflicting_working_merge_is_rejected() {
    let h = harness("true").await;

    let ws_a = worker_branch(&h, "mc/unit-wa", "same.txt", "a\n").await;
    assert!(h.green.merge_to_working(&ws_a, "mc/unit-wa").await.unwrap());

    let ws_b = worker_branch(&h, "mc/unit-wb", "same.txt", "b\n").await;
    assert!(!h.green.merge_to_working(&ws_b, "mc/unit-wb").await.unwrap());
}

#[tokio::test]
async fn reset_on_init_reuses_existing_branches() {
    let h = harness("true").await;

    // Land something on green, then re-initialize: with reset_on_init the
    // branches move back to the base branch head.
    let ws = worker_branch(&h, "mc/unit-r", "r.txt", "r\n").await;
    let result = h.green.merge_unit(&ws, "mc/unit-r", "", None).await.unwrap();
    assert!(result.merged);
    let main_head = git(&h.source, &["rev-parse", "main"]).unwrap();

    h.green.initialize().await.unwrap();
    let green_head = git(&h.source, &["rev-parse", "mc/green"]).unwrap();
    assert_eq!(green_head, main_head);
}
