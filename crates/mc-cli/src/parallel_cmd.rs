//! `mc parallel` -- one planning pass, one parallel dispatch, no rounds.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use mc_core::dispatch::Dispatcher;
use mc_core::lockreg::FileLockRegistry;
use mc_core::overlap::resolve_file_overlaps;
use mc_core::planner::{PlanRequest, Planner, SubprocessPlanner, persist_plan_draft};
use mc_db::models::{Mission, Round, RoundStatus, UnitStatus};
use mc_db::queries::{missions, rounds, work_units};

use crate::setup;

pub async fn run(
    config_path: &Path,
    db_path: &Path,
    workers: Option<usize>,
    dry_run: bool,
) -> Result<bool> {
    let mut config = setup::load_config(config_path)?;
    if let Some(workers) = workers {
        config.scheduler.parallel.num_workers = workers.max(1);
    }

    let store = setup::open_store(db_path).await?;
    let components = setup::build_components(config, store, db_path).await?;
    let config = Arc::clone(&components.config);
    let store = Arc::clone(&components.store);

    let mission = Mission::new(&config.target.objective);
    missions::insert_mission(&store, &mission).await?;
    let mut round = Round::new(&mission.id, 1);
    round.snapshot_hash = components.green.green_hash().await.unwrap_or_default();
    rounds::insert_round(&store, &round).await?;

    let planner = SubprocessPlanner::new(Arc::clone(&config));
    let request = PlanRequest {
        objective: config.target.objective.clone(),
        snapshot_hash: round.snapshot_hash.clone(),
        prior_discoveries: Vec::new(),
        round_number: 1,
        feedback_context: String::new(),
    };
    let mut draft = planner.plan_round(&request).await?;
    draft.plan.round_id = Some(round.id.clone());
    persist_plan_draft(&store, &mut draft).await?;

    let mut units = work_units::units_for_plan(&store, &draft.plan.id).await?;
    resolve_file_overlaps(&mut units);
    for unit in &units {
        work_units::update_work_unit(&store, unit).await?;
    }

    println!("plan {} with {} unit(s):", draft.plan.id, units.len());
    for unit in &units {
        let deps = unit.dependency_ids();
        let deps = if deps.is_empty() {
            String::new()
        } else {
            format!(" (after {})", deps.join(", "))
        };
        println!("  [{}] {}{}", unit.id, unit.title, deps);
    }

    if dry_run {
        return Ok(true);
    }

    round.status = RoundStatus::Executing;
    round.total_units = units.len() as i64;
    rounds::update_round(&store, &round).await?;

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        components.backend.clone(),
        components.green.clone(),
        Arc::clone(&config),
        config.scheduler.parallel.num_workers,
        CancellationToken::new(),
        Arc::new(FileLockRegistry::new()),
        Some(Arc::clone(&components.stream)),
    ));
    dispatcher.execute_units(&draft.plan, &round).await?;

    let units = work_units::units_for_plan(&store, &draft.plan.id).await?;
    let completed = units
        .iter()
        .filter(|u| u.status == UnitStatus::Completed)
        .count();
    round.completed_units = completed as i64;
    round.failed_units = units
        .iter()
        .filter(|u| u.status == UnitStatus::Failed)
        .count() as i64;
    round.status = RoundStatus::Completed;
    rounds::update_round(&store, &round).await?;

    println!("dispatch finished: {completed}/{} units completed", units.len());
    Ok(completed == units.len())
}
