//! End-to-end single-unit flow: real pool, real local backend, a stub
//! worker script that commits on its branch, and the full verified merge
//! onto green.

use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use mc_core::backend::LocalBackend;
use mc_core::config::{MergePolicy, MissionConfig};
use mc_core::dispatch::Dispatcher;
use mc_core::green::GreenBranchManager;
use mc_core::lockreg::FileLockRegistry;
use mc_core::workspace::WorkspacePool;
use mc_db::models::{MergeStatus, Mission, Plan, Round, UnitStatus, WorkUnit};
use mc_db::queries::unit_events::{self, EventEntity};
use mc_db::queries::{handoffs, merge_requests, missions, plans, rounds, work_units};
use mc_test_utils::{create_temp_repo, git, test_store, write_script};

const WORKER_SCRIPT: &str = r#"git config user.email worker@mc.dev
git config user.name worker
echo "fresh content" > feature.txt
git add feature.txt
git commit -q -m "unit work"
HASH=$(git rev-parse HEAD)
echo "MC_RESULT:{\"status\":\"completed\",\"summary\":\"implemented feature\",\"commits\":[\"$HASH\"],\"discoveries\":[\"config was stale\"],\"concerns\":[],\"files_changed\":[\"feature.txt\"]}"
"#;

#[tokio::test]
async fn stub_worker_lands_on_green_through_the_full_pipeline() {
    let (_source_dir, source) = create_temp_repo();
    let pool_dir = TempDir::new().unwrap();
    let script_dir = TempDir::new().unwrap();
    let worker = write_script(script_dir.path(), "worker.sh", WORKER_SCRIPT);

    let mut config = MissionConfig::default();
    config.target.name = "e2e".to_owned();
    config.target.path = source.clone();
    config.target.verification.command = "true".to_owned();
    config.green_branch.merge_policy = MergePolicy::Green;
    config.scheduler.worker_program = worker.to_string_lossy().into_owned();
    config.scheduler.worker_args = Vec::new();
    config.scheduler.monitor_interval = 1;
    let config = Arc::new(config);

    let store = Arc::new(test_store().await.unwrap());
    let pool = Arc::new(WorkspacePool::new(
        &source,
        pool_dir.path(),
        6,
        "main",
        Some("mc/green".to_owned()),
    ));
    pool.initialize(0).await.unwrap();

    let manager_ws = pool.acquire().await.unwrap().unwrap();
    let green = Arc::new(GreenBranchManager::new(
        (*config).clone(),
        Arc::clone(&store),
        Arc::clone(&pool),
        manager_ws,
    ));
    green.initialize().await.unwrap();

    let backend = Arc::new(LocalBackend::new(Arc::clone(&pool), 1024 * 1024));

    let mission = Mission::new("land one unit");
    missions::insert_mission(&store, &mission).await.unwrap();
    let round = Round::new(&mission.id, 1);
    rounds::insert_round(&store, &round).await.unwrap();
    let plan = Plan::new("land one unit");
    plans::insert_plan(&store, &plan).await.unwrap();

    let mut unit = WorkUnit::new(&plan.id, "add feature file");
    unit.description = "Write feature.txt and commit it".to_owned();
    unit.files_hint = "feature.txt".to_owned();
    work_units::insert_work_unit(&store, &unit).await.unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        backend,
        green.clone(),
        Arc::clone(&config),
        2,
        CancellationToken::new(),
        Arc::new(FileLockRegistry::new()),
        None,
    ));
    dispatcher.execute_units(&plan, &round).await.unwrap();

    // The unit completed and carries the worker's commit.
    let unit = work_units::get_work_unit(&store, &unit.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.status, UnitStatus::Completed, "{}", unit.output_summary);
    assert!(unit.commit_hash.is_some());
    assert_eq!(unit.output_summary, "implemented feature");
    assert_eq!(unit.branch_name, format!("mc/unit-{}", unit.id));

    // Green contains the work, and the recorded commit is in its history.
    git(green.workspace(), &["checkout", "mc/green"]).unwrap();
    assert!(green.workspace().join("feature.txt").exists());
    git(
        green.workspace(),
        &[
            "merge-base",
            "--is-ancestor",
            unit.commit_hash.as_deref().unwrap(),
            "mc/green",
        ],
    )
    .expect("landed commit must be an ancestor of green");

    // The handoff round-tripped with its lists.
    let handoff = handoffs::get_handoff(&store, unit.handoff_id.as_deref().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handoff.status, "completed");
    assert_eq!(handoff.discoveries, vec!["config was stale"]);
    assert_eq!(handoff.files_changed, vec!["feature.txt"]);

    // The event stream tells the whole story and derives completed.
    let events = unit_events::replay_events(&store, EventEntity::Unit, &unit.id)
        .await
        .unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["dispatched", "running", "completed", "merged"]);
    assert_eq!(
        unit_events::derive_status_from_db(&store, &unit.id)
            .await
            .unwrap(),
        UnitStatus::Completed
    );

    // The serialized merge queue recorded the landing.
    let mrs = merge_requests::merge_requests_for_plan(&store, &plan.id)
        .await
        .unwrap();
    assert_eq!(mrs.len(), 1);
    assert_eq!(mrs[0].status, MergeStatus::Merged);
    assert_eq!(mrs[0].position, 1);
}
