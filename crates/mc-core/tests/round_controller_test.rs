//! Round-controller stop conditions and signal handling, driven by a
//! scripted planner that produces empty plans.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use mc_core::backend::{ExecHandle, ExecStatus, WorkerBackend};
use mc_core::config::MissionConfig;
use mc_core::green::{GreenBranchManager, IntegrationOutcome, Integrator};
use mc_core::planner::{PlanDraft, PlanRequest, Planner, draft_from_units};
use mc_core::round::RoundController;
use mc_core::workspace::WorkspacePool;
use mc_db::Store;
use mc_db::models::{Plan, Signal, SignalStatus, SignalType, WorkUnit};
use mc_db::queries::{missions, rounds, signals};
use mc_test_utils::{create_temp_repo, test_store};

/// Planner that returns empty plans and can drop one signal into the bus
/// on its first call (once the mission row exists).
struct ScriptedPlanner {
    store: Arc<Store>,
    inject: Mutex<Option<(SignalType, String)>>,
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan_round(&self, request: &PlanRequest) -> Result<PlanDraft> {
        let pending = self.inject.lock().expect("poisoned").take();
        if let Some((signal_type, payload)) = pending {
            let recent = missions::recent_missions(&self.store, 1).await?;
            if let Some(mission) = recent.first() {
                let signal = Signal::new(&mission.id, signal_type, payload);
                signals::insert_signal(&self.store, &signal).await?;
            }
        }
        Ok(draft_from_units(Plan::new(&request.objective), Vec::new()))
    }
}

struct NullBackend;

#[async_trait]
impl WorkerBackend for NullBackend {
    async fn provision_workspace(
        &self,
        _unit_id: &str,
        _source: &Path,
        _base_branch: &str,
    ) -> Result<PathBuf> {
        anyhow::bail!("no workers in this test")
    }

    async fn spawn(
        &self,
        _unit_id: &str,
        _workspace: &Path,
        _argv: &[String],
        _env: &HashMap<String, String>,
        _timeout: Duration,
    ) -> Result<ExecHandle> {
        anyhow::bail!("no workers in this test")
    }

    async fn check_status(&self, _handle: &ExecHandle) -> ExecStatus {
        ExecStatus::Failed
    }

    async fn get_output(&self, _handle: &ExecHandle) -> String {
        String::new()
    }

    async fn kill(&self, _handle: &ExecHandle) -> Result<()> {
        Ok(())
    }

    async fn release_workspace(&self, _workspace: &Path) -> Result<()> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }
}

struct NullIntegrator;

#[async_trait]
impl Integrator for NullIntegrator {
    async fn integrate(
        &self,
        _unit: &WorkUnit,
        _workspace: &Path,
        _branch: &str,
    ) -> Result<IntegrationOutcome> {
        Ok(IntegrationOutcome::Merged {
            commit_hash: String::new(),
        })
    }
}

struct Fixture {
    store: Arc<Store>,
    controller: RoundController,
    _source_dir: TempDir,
    _pool_dir: TempDir,
}

async fn fixture(
    tweak: impl FnOnce(&mut MissionConfig),
    inject: Option<(SignalType, String)>,
) -> Fixture {
    let (source_dir, source) = create_temp_repo();
    let pool_dir = TempDir::new().unwrap();

    let mut config = MissionConfig::default();
    config.target.name = "test".to_owned();
    config.target.path = source.clone();
    config.target.objective = "do the thing".to_owned();
    config.rounds.cooldown_between_rounds = 0;
    config.rounds.stall_threshold = 100;
    tweak(&mut config);
    let config = Arc::new(config);

    let store = Arc::new(test_store().await.unwrap());
    let pool = Arc::new(WorkspacePool::new(
        &source,
        pool_dir.path(),
        4,
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

    let planner = Arc::new(ScriptedPlanner {
        store: Arc::clone(&store),
        inject: Mutex::new(inject),
    });

    let controller = RoundController::new(
        Arc::clone(&config),
        Arc::clone(&store),
        planner,
        Arc::new(NullBackend),
        green,
        Arc::new(NullIntegrator),
        None,
    );

    Fixture {
        store,
        controller,
        _source_dir: source_dir,
        _pool_dir: pool_dir,
    }
}

// max_rounds boundary: rounds 1..N run, round N+1 never begins.
#[tokio::test]
async fn max_rounds_is_inclusive() {
    let fx = fixture(|c| c.rounds.max_rounds = 2, None).await;

    let result = fx.controller.run().await;
    assert_eq!(result.stopped_reason, "max_rounds");
    assert_eq!(result.total_rounds, 2);
    assert!(!result.objective_met);

    let mission = missions::get_mission(&fx.store, &result.mission_id)
        .await
        .unwrap()
        .unwrap();
    let mission_rounds = rounds::rounds_for_mission(&fx.store, &mission.id)
        .await
        .unwrap();
    assert_eq!(mission_rounds.len(), 2, "round 3 must never begin");
    assert_eq!(mission.stopped_reason, "max_rounds");
}

#[tokio::test]
async fn stall_fires_after_threshold_flat_scores() {
    let fx = fixture(
        |c| {
            c.rounds.max_rounds = 50;
            c.rounds.stall_threshold = 3;
            c.rounds.stall_score_epsilon = 0.01;
        },
        None,
    )
    .await;

    let result = fx.controller.run().await;
    assert_eq!(result.stopped_reason, "stalled");
    assert_eq!(result.round_scores.len(), 3, "needs threshold samples first");
}

#[tokio::test]
async fn fewer_samples_than_threshold_never_stall() {
    let fx = fixture(
        |c| {
            c.rounds.max_rounds = 2;
            c.rounds.stall_threshold = 3;
        },
        None,
    )
    .await;

    let result = fx.controller.run().await;
    // Two flat scores are below the stall sample requirement, so the
    // mission runs into the round cap instead.
    assert_eq!(result.stopped_reason, "max_rounds");
}

#[tokio::test]
async fn stop_before_run_is_user_stopped() {
    let fx = fixture(|_| {}, None).await;

    fx.controller.stop();
    let result = fx.controller.run().await;
    assert_eq!(result.stopped_reason, "user_stopped");
    assert_eq!(result.total_rounds, 0);

    let mission = missions::get_mission(&fx.store, &result.mission_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(mission.stopped_reason, "user_stopped");
}

#[tokio::test]
async fn stop_signal_halts_at_next_round_boundary() {
    let fx = fixture(
        |c| c.rounds.max_rounds = 50,
        Some((SignalType::Stop, String::new())),
    )
    .await;

    let result = fx.controller.run().await;
    assert_eq!(result.stopped_reason, "signal_stopped");
    assert_eq!(result.total_rounds, 1, "signal lands during round 1");

    let all: Vec<Signal> = sqlx::query_as("SELECT * FROM signals")
        .fetch_all(fx.store.pool())
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, SignalStatus::Acknowledged);
}

#[tokio::test]
async fn adjust_signal_applies_at_next_round_boundary() {
    let fx = fixture(
        |c| c.rounds.max_rounds = 50,
        Some((SignalType::Adjust, r#"{"max_rounds": 1}"#.to_owned())),
    )
    .await;

    let result = fx.controller.run().await;
    // Round 1 injected the adjustment; at the round-2 boundary the new
    // cap is already exceeded.
    assert_eq!(result.stopped_reason, "max_rounds");
    assert_eq!(result.total_rounds, 1);

    let all: Vec<Signal> = sqlx::query_as("SELECT * FROM signals")
        .fetch_all(fx.store.pool())
        .await
        .unwrap();
    assert_eq!(all[0].status, SignalStatus::Acknowledged);
}
