//! Round controller: the outer plan -> dispatch -> merge -> evaluate loop
//! driving one mission until its objective is met or a stop condition
//! fires.

pub mod evaluate;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::WorkerBackend;
use crate::config::MissionConfig;
use crate::dispatch::Dispatcher;
use crate::events::{EventRecord, EventStream};
use crate::green::{GreenBranchManager, Integrator};
use crate::lockreg::FileLockRegistry;
use crate::overlap::resolve_file_overlaps;
use crate::planner::context::build_planner_context;
use crate::planner::{PlanRequest, Planner, persist_plan_draft};
use crate::round::evaluate::{curate_discoveries, evaluate_objective};
use crate::verify::snapshot_from_report;
use mc_db::Store;
use mc_db::models::{
    Mission, MissionStatus, Round, RoundStatus, Signal, SignalType, UnitEventType, UnitStatus,
};
use mc_db::queries::{handoffs, rounds, signals, snapshots, unit_events, work_units};
use mc_db::queries::missions as mission_queries;

/// Summary of a completed mission.
#[derive(Debug, Clone, Default)]
pub struct MissionResult {
    pub mission_id: String,
    pub objective: String,
    pub final_score: f64,
    pub objective_met: bool,
    pub total_rounds: i64,
    pub total_cost_usd: f64,
    pub wall_time_seconds: f64,
    pub stopped_reason: String,
    pub round_scores: Vec<f64>,
}

/// Summary of a single round.
#[derive(Debug, Clone, Default)]
pub struct RoundResult {
    pub round_id: String,
    pub number: i64,
    pub score: f64,
    pub objective_met: bool,
    pub total_units: i64,
    pub completed_units: i64,
    pub failed_units: i64,
    pub discoveries: Vec<String>,
    pub cost_usd: f64,
}

/// Settings an adjust signal may change while a mission runs. Applied at
/// the next round boundary.
#[derive(Debug, Clone, Copy)]
struct LiveSettings {
    max_rounds: i64,
    num_workers: usize,
}

/// Drives one mission.
pub struct RoundController {
    config: Arc<MissionConfig>,
    store: Arc<Store>,
    planner: Arc<dyn Planner>,
    backend: Arc<dyn WorkerBackend>,
    green: Arc<GreenBranchManager>,
    integrator: Arc<dyn Integrator>,
    locks: Arc<FileLockRegistry>,
    stream: Option<Arc<EventStream>>,
    cancel: CancellationToken,
    live: StdMutex<LiveSettings>,
}

impl RoundController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<MissionConfig>,
        store: Arc<Store>,
        planner: Arc<dyn Planner>,
        backend: Arc<dyn WorkerBackend>,
        green: Arc<GreenBranchManager>,
        integrator: Arc<dyn Integrator>,
        stream: Option<Arc<EventStream>>,
    ) -> Self {
        let live = LiveSettings {
            max_rounds: config.rounds.max_rounds,
            num_workers: config.scheduler.parallel.num_workers,
        };
        Self {
            config,
            store,
            planner,
            backend,
            green,
            integrator,
            locks: Arc::new(FileLockRegistry::new()),
            stream,
            cancel: CancellationToken::new(),
            live: StdMutex::new(live),
        }
    }

    /// Token other tasks may use to stop this controller.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request a stop; the dispatcher notices at its next poll tick.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Run the mission loop until the objective is met or a stopping
    /// condition fires.
    pub async fn run(&self) -> MissionResult {
        let mut result = MissionResult {
            objective: self.config.target.objective.clone(),
            ..MissionResult::default()
        };
        let start = std::time::Instant::now();

        let mut mission = Mission::new(&self.config.target.objective);
        if let Err(e) = mission_queries::insert_mission(&self.store, &mission).await {
            error!(error = %e, "failed to insert mission");
            result.stopped_reason = "db_error".to_owned();
            return result;
        }
        result.mission_id = mission.id.clone();

        // Restart recovery: units a crashed run left claimed or running go
        // back to pending while they still have attempts.
        match work_units::recover_stale_units(
            &self.store,
            self.config.scheduler.session_timeout as i64,
        )
        .await
        {
            Ok(recovered) if !recovered.is_empty() => {
                info!(count = recovered.len(), "recovered stale work units");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "stale-unit recovery failed"),
        }

        if let Some(ref stream) = self.stream {
            stream.emit(&EventRecord::new("mission_started").mission(&mission.id));
        }

        let outcome = self.run_rounds(&mut mission, &mut result).await;
        match outcome {
            Ok(()) => {}
            Err(e) => {
                if self.cancel.is_cancelled() {
                    info!("mission cancelled");
                    result.stopped_reason = "cancelled".to_owned();
                } else {
                    error!(error = %e, "mission infrastructure error");
                    result.stopped_reason = "error".to_owned();
                }
            }
        }

        // Terminal mission update always lands, whatever happened above.
        mission.status = if result.objective_met {
            MissionStatus::Completed
        } else {
            MissionStatus::Stopped
        };
        mission.finished_at = Some(Utc::now());
        mission.stopped_reason = result.stopped_reason.clone();
        mission.final_score = result.round_scores.last().copied().unwrap_or(0.0);
        if let Err(e) = mission_queries::update_mission(&self.store, &mission).await {
            error!(error = %e, "failed to write terminal mission update");
        }

        if let Err(e) = self.backend.cleanup().await {
            warn!(error = %e, "backend cleanup failed");
        }

        if let Some(ref stream) = self.stream {
            stream.emit(
                &EventRecord::new("mission_finished")
                    .mission(&mission.id)
                    .details(serde_json::json!({
                        "stopped_reason": result.stopped_reason,
                        "objective_met": result.objective_met,
                    })),
            );
        }

        result.wall_time_seconds = start.elapsed().as_secs_f64();
        result
    }

    async fn run_rounds(&self, mission: &mut Mission, result: &mut MissionResult) -> Result<()> {
        let mut round_number: i64 = 0;
        let mut discoveries: Vec<String> = Vec::new();

        loop {
            round_number += 1;
            mission.total_rounds = round_number;

            if let Err(e) = signals::expire_stale_signals(&self.store, 10).await {
                warn!(error = %e, "failed to expire stale signals");
            }

            if let Some(reason) = self.should_stop(mission, &result.round_scores).await {
                result.stopped_reason = reason;
                break;
            }

            info!(round = round_number, "starting round");
            let round_result = self.run_round(mission, round_number, &discoveries).await?;

            result.round_scores.push(round_result.score);
            result.total_rounds = round_number;
            result.total_cost_usd += round_result.cost_usd;
            discoveries.extend(round_result.discoveries.iter().cloned());

            mission.final_score = round_result.score;
            if let Err(e) = mission_queries::update_mission(&self.store, mission).await {
                error!(round = round_number, error = %e, "failed to update mission after round");
            }

            if round_result.objective_met {
                result.stopped_reason = "objective_met".to_owned();
                result.objective_met = true;
                result.final_score = round_result.score;
                break;
            }

            let cooldown = self.config.rounds.cooldown_between_rounds;
            if cooldown > 0 {
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs(cooldown)) => {}
                    () = self.cancel.cancelled() => {}
                }
            }
        }

        Ok(())
    }

    /// Execute a single plan-execute-evaluate cycle.
    async fn run_round(
        &self,
        mission: &Mission,
        round_number: i64,
        prior_discoveries: &[String],
    ) -> Result<RoundResult> {
        let mut round = Round::new(&mission.id, round_number);
        round.snapshot_hash = self.green.green_hash().await.unwrap_or_default();
        rounds::insert_round(&self.store, &round)
            .await
            .context("database error inserting round")?;

        let mut result = RoundResult {
            round_id: round.id.clone(),
            number: round_number,
            ..RoundResult::default()
        };

        // 1. Plan.
        let feedback_context = build_planner_context(&self.store, &mission.id)
            .await
            .unwrap_or_default();
        let curated =
            curate_discoveries(prior_discoveries, self.config.rounds.max_discovery_chars);
        let request = PlanRequest {
            objective: mission.objective.clone(),
            snapshot_hash: round.snapshot_hash.clone(),
            prior_discoveries: curated,
            round_number,
            feedback_context,
        };
        let mut draft = self.planner.plan_round(&request).await?;
        draft.plan.round_id = Some(round.id.clone());
        persist_plan_draft(&self.store, &mut draft)
            .await
            .context("database error persisting plan tree")?;
        round.plan_id = Some(draft.plan.id.clone());

        // File-overlap resolution injects synthetic dependency edges in
        // deterministic order.
        let mut units = work_units::units_for_plan(&self.store, &draft.plan.id).await?;
        resolve_file_overlaps(&mut units);
        for unit in &units {
            work_units::update_work_unit(&self.store, unit).await?;
        }

        result.total_units = draft.plan.total_units;
        round.total_units = draft.plan.total_units;
        round.status = RoundStatus::Executing;
        rounds::update_round(&self.store, &round).await?;

        if draft.plan.total_units == 0 {
            round.status = RoundStatus::Completed;
            round.finished_at = Some(Utc::now());
            rounds::update_round(&self.store, &round).await?;
            return Ok(result);
        }

        let snapshot_before = snapshots::latest_snapshot(&self.store).await.ok().flatten();

        // 2. Dispatch. The semaphore bound comes from live settings so
        // adjust signals apply from this round on.
        let num_workers = self.live.lock().unwrap_or_else(|e| e.into_inner()).num_workers;
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.backend),
            Arc::clone(&self.integrator),
            Arc::clone(&self.config),
            num_workers,
            self.cancel.clone(),
            Arc::clone(&self.locks),
            self.stream.clone(),
        ));
        dispatcher.execute_units(&draft.plan, &round).await?;

        // 3. Harvest handoffs.
        let round_handoffs = handoffs::handoffs_for_round(&self.store, &round.id)
            .await
            .unwrap_or_default();
        let mut all_discoveries: Vec<String> = Vec::new();
        for handoff in &round_handoffs {
            all_discoveries.extend(handoff.discoveries.iter().cloned());
        }

        // 4. Fixup: promote working to green if possible.
        round.status = RoundStatus::Evaluating;
        rounds::update_round(&self.store, &round).await?;

        let fixup = self.green.run_fixup().await?;
        info!(
            promoted = fixup.promoted,
            attempts = fixup.fixup_attempts,
            "fixup finished"
        );
        if fixup.promoted {
            let pushed = self.green.maybe_push(true).await?;
            if pushed {
                info!("auto-pushed green upstream");
            }
        }

        // 5. Evaluate deterministically from before/after snapshots.
        let report = self.green.verify_green().await?;
        let mut snapshot_after = snapshot_from_report(&report);
        snapshot_after.round_id = Some(round.id.clone());
        if let Err(e) = snapshots::insert_snapshot(&self.store, &snapshot_after).await {
            error!(error = %e, "failed to insert post-round snapshot");
        }

        let prev_score = rounds::rounds_for_mission(&self.store, &mission.id)
            .await
            .unwrap_or_default()
            .iter()
            .rev()
            .find(|r| r.id != round.id)
            .map(|r| r.objective_score)
            .unwrap_or(0.0);

        let units = work_units::units_for_plan(&self.store, &draft.plan.id).await?;
        let completed_count = units
            .iter()
            .filter(|u| u.status == UnitStatus::Completed)
            .count() as i64;
        let failed_count = units
            .iter()
            .filter(|u| u.status == UnitStatus::Failed)
            .count() as i64;
        result.cost_usd = units.iter().map(|u| u.cost_usd).sum();

        let evaluation = evaluate_objective(
            snapshot_before.as_ref(),
            Some(&snapshot_after),
            completed_count,
            result.total_units,
            fixup.promoted,
            prev_score,
        );

        // 6. Record the reward signal for this round.
        let reward = evaluation.score - prev_score;
        info!(round = round_number, reward = reward, "round reward");
        if let Some(ref stream) = self.stream {
            stream.emit(
                &EventRecord::new("round_completed")
                    .mission(&mission.id)
                    .round(&round.id)
                    .details(serde_json::json!({
                        "score": evaluation.score,
                        "reward": reward,
                        "promoted": fixup.promoted,
                        "completed_units": completed_count,
                        "failed_units": failed_count,
                    })),
            );
        }

        // 7. Finalize.
        let kept: Vec<&String> = all_discoveries
            .iter()
            .take(self.config.rounds.max_discoveries_per_round)
            .collect();
        round.discoveries = serde_json::to_string(&kept).unwrap_or_else(|_| "[]".to_owned());
        round.objective_score = evaluation.score;
        round.objective_met = evaluation.met;
        round.completed_units = completed_count;
        round.failed_units = failed_count;
        round.status = RoundStatus::Completed;
        round.finished_at = Some(Utc::now());
        rounds::update_round(&self.store, &round).await?;

        result.score = evaluation.score;
        result.objective_met = evaluation.met;
        result.completed_units = completed_count;
        result.failed_units = failed_count;
        result.discoveries = all_discoveries;

        Ok(result)
    }

    /// Check stop conditions in order. Returns the stop reason, if any.
    async fn should_stop(&self, mission: &Mission, scores: &[f64]) -> Option<String> {
        if self.cancel.is_cancelled() {
            return Some("user_stopped".to_owned());
        }

        if let Some(reason) = self.check_signals(&mission.id).await {
            return Some(reason);
        }

        let live = *self.live.lock().unwrap_or_else(|e| e.into_inner());
        // total_rounds was already bumped for the round about to run, so
        // round N still runs when max_rounds == N.
        if mission.total_rounds > live.max_rounds {
            return Some("max_rounds".to_owned());
        }

        let threshold = self.config.rounds.stall_threshold;
        if threshold > 0 && scores.len() >= threshold {
            let recent = &scores[scores.len() - threshold..];
            let max = recent.iter().cloned().fold(f64::MIN, f64::max);
            let min = recent.iter().cloned().fold(f64::MAX, f64::min);
            if max - min < self.config.rounds.stall_score_epsilon {
                return Some("stalled".to_owned());
            }
        }

        None
    }

    /// Poll pending control signals. Returns a stop reason when a stop
    /// signal was consumed.
    async fn check_signals(&self, mission_id: &str) -> Option<String> {
        let pending = match signals::pending_signals(&self.store, mission_id).await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to check signals");
                return None;
            }
        };

        for signal in pending {
            match signal.signal_type {
                SignalType::Stop => {
                    self.acknowledge(&signal).await;
                    self.cancel.cancel();
                    return Some("signal_stopped".to_owned());
                }
                SignalType::RetryUnit => {
                    self.handle_retry_signal(&signal).await;
                }
                SignalType::Adjust => {
                    self.handle_adjust_signal(&signal).await;
                }
            }
        }
        None
    }

    async fn handle_retry_signal(&self, signal: &Signal) {
        let unit_id = signal.payload.trim().to_owned();
        if !unit_id.is_empty() {
            match work_units::reset_unit_for_retry(&self.store, &unit_id).await {
                Ok(true) => {
                    info!(unit_id = %unit_id, "work unit reset for retry");
                    if let Ok(Some(unit)) =
                        work_units::get_work_unit(&self.store, &unit_id).await
                    {
                        let _ = unit_events::record_unit_event(
                            &self.store,
                            &unit,
                            UnitEventType::RetryQueued,
                            "retry signal",
                            0,
                            0,
                        )
                        .await;
                    }
                }
                Ok(false) => {
                    warn!(unit_id = %unit_id, "retry signal ignored (not failed or out of attempts)");
                }
                Err(e) => error!(unit_id = %unit_id, error = %e, "failed to handle retry signal"),
            }
        }
        self.acknowledge(signal).await;
    }

    async fn handle_adjust_signal(&self, signal: &Signal) {
        if let Ok(params) = serde_json::from_str::<Value>(&signal.payload) {
            let mut live = self.live.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(max_rounds) = params.get("max_rounds").and_then(Value::as_i64) {
                live.max_rounds = max_rounds;
                info!(max_rounds, "adjusted max_rounds");
            }
            if let Some(num_workers) = params.get("num_workers").and_then(Value::as_u64) {
                live.num_workers = (num_workers as usize).max(1);
                info!(num_workers, "adjusted num_workers (next round)");
            }
        } else {
            warn!(payload = %signal.payload, "unparseable adjust payload");
        }
        self.acknowledge(signal).await;
    }

    async fn acknowledge(&self, signal: &Signal) {
        if let Err(e) = signals::acknowledge_signal(&self.store, &signal.id).await {
            error!(signal_id = %signal.id, error = %e, "failed to acknowledge signal");
        }
    }
}
