//! Dependency-aware parallel dispatcher.
//!
//! Walks a plan's work units in topological order, bounded by a worker
//! semaphore. Cycles are failed up front, a failing unit cascade-fails its
//! transitive dependents, and a pending set that can no longer make
//! progress is failed as a deadlock.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::{ExecStatus, WorkerBackend};
use crate::config::MissionConfig;
use crate::events::{EventRecord, EventStream};
use crate::green::{FailureStage, IntegrationOutcome, Integrator};
use crate::lockreg::FileLockRegistry;
use crate::worker::{
    TokenUsage, build_worker_env, compute_token_cost, output_tail, parse_mc_result,
    parse_stream_json, render_worker_prompt,
};
use mc_db::Store;
use mc_db::models::{Handoff, Plan, Round, UnitEventType, UnitStatus, WorkUnit};
use mc_db::queries::{handoffs, unit_events, work_units};

struct UnitDone {
    unit_id: String,
    success: bool,
}

/// Executes one plan's units to a terminal status.
pub struct Dispatcher {
    store: Arc<Store>,
    backend: Arc<dyn WorkerBackend>,
    integrator: Arc<dyn Integrator>,
    config: Arc<MissionConfig>,
    /// Worker-pool bound for this round; rebuilt each round so adjust
    /// signals take effect at round boundaries.
    num_workers: usize,
    cancel: CancellationToken,
    locks: Arc<FileLockRegistry>,
    stream: Option<Arc<EventStream>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        backend: Arc<dyn WorkerBackend>,
        integrator: Arc<dyn Integrator>,
        config: Arc<MissionConfig>,
        num_workers: usize,
        cancel: CancellationToken,
        locks: Arc<FileLockRegistry>,
        stream: Option<Arc<EventStream>>,
    ) -> Self {
        Self {
            store,
            backend,
            integrator,
            config,
            num_workers: num_workers.max(1),
            cancel,
            locks,
            stream,
        }
    }

    /// Run all units of a plan to a terminal status.
    pub async fn execute_units(self: &Arc<Self>, plan: &Plan, round: &Round) -> Result<()> {
        let mut units = work_units::units_for_plan(&self.store, &plan.id).await?;
        if units.is_empty() {
            return Ok(());
        }

        // Adopt every unit into this round (its epoch binding).
        for unit in &mut units {
            unit.round_id = Some(round.id.clone());
            work_units::update_work_unit(&self.store, unit).await?;
        }

        let mut unit_map: HashMap<String, WorkUnit> =
            units.into_iter().map(|u| (u.id.clone(), u)).collect();

        // deps_of[u] = prerequisites of u; unknown referenced ids are
        // dropped. dependents_of is the reverse adjacency.
        let mut deps_of: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents_of: HashMap<String, HashSet<String>> =
            unit_map.keys().map(|id| (id.clone(), HashSet::new())).collect();

        for unit in unit_map.values() {
            let dep_ids: HashSet<String> = unit
                .dependency_ids()
                .into_iter()
                .filter(|id| unit_map.contains_key(id))
                .collect();
            for dep_id in &dep_ids {
                dependents_of
                    .entry(dep_id.clone())
                    .or_default()
                    .insert(unit.id.clone());
            }
            deps_of.insert(unit.id.clone(), dep_ids);
        }

        // Cycle detection (Kahn): anything the topological walk never
        // visits is part of a cycle.
        let mut temp_deps: HashMap<String, HashSet<String>> = deps_of.clone();
        let mut queue: Vec<String> = temp_deps
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        let mut visited: HashSet<String> = HashSet::new();
        while let Some(id) = queue.pop() {
            visited.insert(id.clone());
            for dependent in dependents_of.get(&id).cloned().unwrap_or_default() {
                if let Some(deps) = temp_deps.get_mut(&dependent) {
                    deps.remove(&id);
                    if deps.is_empty() && !visited.contains(&dependent) {
                        queue.push(dependent);
                    }
                }
            }
        }

        let cycle_units: Vec<String> = unit_map
            .keys()
            .filter(|id| !visited.contains(*id))
            .cloned()
            .collect();
        if !cycle_units.is_empty() {
            error!(units = ?cycle_units, "circular dependency detected");
            for id in &cycle_units {
                if let Some(mut unit) = unit_map.remove(id) {
                    self.fail_unit(&mut unit, "Deadlock: circular dependency detected", false)
                        .await;
                }
                deps_of.remove(id);
                dependents_of.remove(id);
            }
        }

        if unit_map.is_empty() {
            return Ok(());
        }

        let semaphore = Arc::new(Semaphore::new(self.num_workers));
        let (tx, mut rx) = mpsc::channel::<UnitDone>(unit_map.len().max(1));

        let mut pending: HashSet<String> = unit_map.keys().cloned().collect();
        let mut running: HashSet<String> = HashSet::new();
        let mut completed: HashMap<String, bool> = HashMap::new();

        loop {
            // Ready: pending, not running, every dependency resolved
            // (success or failure both count; failure cascades separately),
            // and no file-claim conflict with a running unit.
            let mut ready: Vec<String> = pending
                .iter()
                .filter(|id| !running.contains(*id))
                .filter(|id| {
                    deps_of
                        .get(*id)
                        .map(|deps| deps.iter().all(|d| completed.contains_key(d)))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            ready.sort();

            for id in ready {
                let unit = unit_map[&id].clone();

                let files = unit.hinted_files();
                let conflicts = self.locks.claim(&id, &files);
                if !conflicts.is_empty() {
                    // A running unit holds overlapping paths; stay pending
                    // until it releases.
                    continue;
                }

                pending.remove(&id);
                running.insert(id.clone());

                self.emit(&unit, UnitEventType::Dispatched, "", TokenUsage::default())
                    .await;

                let dispatcher = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let tx = tx.clone();
                let round = round.clone();
                tokio::spawn(async move {
                    let Ok(permit) = semaphore.acquire_owned().await else {
                        return;
                    };
                    let success = dispatcher.execute_single_unit(unit.clone(), &round).await;
                    drop(permit);
                    let _ = tx
                        .send(UnitDone {
                            unit_id: unit.id,
                            success,
                        })
                        .await;
                });
            }

            if running.is_empty() {
                if pending.is_empty() {
                    break;
                }
                // Nothing running and nothing became ready: a deadlock
                // that survived cycle detection.
                error!(stuck = pending.len(), "units stuck with unmet dependencies");
                for id in pending.drain() {
                    if let Some(mut unit) = unit_map.remove(&id) {
                        self.fail_unit(&mut unit, "Deadlock: unmet dependencies", false)
                            .await;
                    }
                }
                break;
            }

            let Some(done) = rx.recv().await else { break };
            self.handle_done(
                done,
                &mut unit_map,
                &dependents_of,
                &mut pending,
                &mut running,
                &mut completed,
            )
            .await;
            while let Ok(done) = rx.try_recv() {
                self.handle_done(
                    done,
                    &mut unit_map,
                    &dependents_of,
                    &mut pending,
                    &mut running,
                    &mut completed,
                )
                .await;
            }
        }

        Ok(())
    }

    async fn handle_done(
        &self,
        done: UnitDone,
        unit_map: &mut HashMap<String, WorkUnit>,
        dependents_of: &HashMap<String, HashSet<String>>,
        pending: &mut HashSet<String>,
        running: &mut HashSet<String>,
        completed: &mut HashMap<String, bool>,
    ) {
        running.remove(&done.unit_id);
        completed.insert(done.unit_id.clone(), done.success);
        self.locks.release(&done.unit_id);

        if done.success {
            return;
        }

        // Cascade failure through every transitive dependent still
        // pending; all of them name the originally failed unit.
        let mut queue: Vec<String> = dependents_of
            .get(&done.unit_id)
            .map(|deps| deps.iter().cloned().collect())
            .unwrap_or_default();
        while let Some(id) = queue.pop() {
            if completed.contains_key(&id) || running.contains(&id) || !pending.contains(&id) {
                continue;
            }
            let Some(unit) = unit_map.get_mut(&id) else {
                continue;
            };
            let summary = format!("Dependency failed: {}", done.unit_id);
            let mut unit = unit.clone();
            self.fail_unit(&mut unit, &summary, false).await;
            unit_map.insert(id.clone(), unit);
            completed.insert(id.clone(), false);
            pending.remove(&id);
            if let Some(next) = dependents_of.get(&id) {
                queue.extend(next.iter().cloned());
            }
        }
    }

    /// Execute one unit: provision, spawn, poll, parse, integrate.
    /// Returns whether the unit reached completed status.
    async fn execute_single_unit(&self, mut unit: WorkUnit, round: &Round) -> bool {
        let source = self.config.target.path.clone();
        let base_branch = self.config.green_branch.green_branch.clone();

        let workspace = match self
            .backend
            .provision_workspace(&unit.id, &source, &base_branch)
            .await
        {
            Ok(ws) => ws,
            Err(e) => {
                error!(unit_id = %unit.id, error = %e, "failed to provision workspace");
                self.fail_unit(&mut unit, &format!("Infrastructure error: {e}"), true)
                    .await;
                return false;
            }
        };

        let result = self.run_in_workspace(&mut unit, round, &workspace).await;

        if let Err(e) = self.backend.release_workspace(&workspace).await {
            warn!(unit_id = %unit.id, error = %e, "failed to release workspace");
        }

        match result {
            Ok(success) => success,
            Err(e) => {
                error!(unit_id = %unit.id, error = %e, "infrastructure error executing unit");
                self.fail_unit(&mut unit, &format!("Infrastructure error: {e}"), true)
                    .await;
                false
            }
        }
    }

    async fn run_in_workspace(
        &self,
        unit: &mut WorkUnit,
        round: &Round,
        workspace: &Path,
    ) -> Result<bool> {
        let scheduler = &self.config.scheduler;

        unit.branch_name = format!("mc/unit-{}", unit.id);
        unit.status = UnitStatus::Running;
        unit.started_at = Some(Utc::now());
        work_units::update_work_unit(&self.store, unit).await?;
        self.emit(unit, UnitEventType::Running, "", TokenUsage::default())
            .await;

        // The worker commits on its own branch; create it up front so the
        // prompt's claim that it is checked out holds.
        crate::git::git_ok(workspace, &["checkout", "-B", &unit.branch_name]).await?;

        let prompt = render_worker_prompt(
            unit,
            &self.config.target.name,
            &workspace.to_string_lossy(),
            &unit.branch_name,
            &self.config.target.verification.command,
            "",
        );
        let env = build_worker_env(&self.config.env);

        let mut argv: Vec<String> = vec![scheduler.worker_program.clone()];
        argv.extend(scheduler.worker_args.iter().cloned());
        argv.push(prompt);

        let timeout_secs = unit
            .timeout
            .map(|t| t.max(1) as u64)
            .unwrap_or(scheduler.session_timeout);
        let timeout = Duration::from_secs(timeout_secs);

        let handle = self
            .backend
            .spawn(&unit.id, workspace, &argv, &env, timeout)
            .await?;

        // Poll with slack beyond the backend's own deadline.
        let poll_deadline = Instant::now()
            + Duration::from_secs_f64(
                timeout_secs as f64 * self.config.rounds.timeout_multiplier.max(1.0),
            );
        let monitor_interval = Duration::from_secs(scheduler.monitor_interval.max(1));

        let exec_status = loop {
            let status = self.backend.check_status(&handle).await;
            if status != ExecStatus::Running {
                break status;
            }
            if self.cancel.is_cancelled() {
                let _ = self.backend.kill(&handle).await;
                self.fail_unit(unit, "Stopped by signal", true).await;
                return Ok(false);
            }
            if Instant::now() >= poll_deadline {
                let _ = self.backend.kill(&handle).await;
                self.fail_unit(unit, &format!("Timed out after {timeout_secs}s"), true)
                    .await;
                return Ok(false);
            }
            tokio::time::sleep(monitor_interval).await;
        };

        let output = self.backend.get_output(&handle).await;
        unit.exit_code = Some(if exec_status == ExecStatus::Completed { 0 } else { 1 });

        let stream = parse_stream_json(&output);
        let usage = stream.usage;
        unit.cost_usd += compute_token_cost(usage, &scheduler.pricing);

        let report = parse_mc_result(&output).or_else(|| parse_mc_result(&stream.text));

        let reported_status = match report {
            Some(ref report) => {
                unit.output_summary = report.summary.clone();
                if let Some(first) = report.commits.first() {
                    unit.commit_hash = Some(first.clone());
                }

                let mut handoff = Handoff::new(&unit.id);
                handoff.round_id = Some(round.id.clone());
                handoff.status = if report.status.is_empty() {
                    "completed".to_owned()
                } else {
                    report.status.clone()
                };
                handoff.summary = report.summary.clone();
                handoff.commits = report.commits.clone();
                handoff.discoveries = report.discoveries.clone();
                handoff.concerns = report.concerns.clone();
                handoff.files_changed = report.files_changed.clone();
                handoffs::insert_handoff(&self.store, &handoff).await?;
                unit.handoff_id = Some(handoff.id.clone());

                handoff.status
            }
            None => {
                unit.output_summary =
                    output_tail(&output, scheduler.output_summary_max_chars);
                if exec_status == ExecStatus::Completed {
                    "completed".to_owned()
                } else {
                    "failed".to_owned()
                }
            }
        };

        match reported_status.as_str() {
            "completed" if unit.commit_hash.is_some() => {
                self.emit(unit, UnitEventType::Completed, "", usage).await;

                match self
                    .integrator
                    .integrate(unit, workspace, &unit.branch_name.clone())
                    .await?
                {
                    IntegrationOutcome::Merged { commit_hash } => {
                        unit.status = UnitStatus::Completed;
                        // The serialized path rebases, so the landed hash
                        // supersedes the worker-reported one.
                        if !commit_hash.is_empty() {
                            unit.commit_hash = Some(commit_hash.clone());
                        }
                        self.emit(unit, UnitEventType::Merged, &commit_hash, TokenUsage::default())
                            .await;
                    }
                    IntegrationOutcome::Rejected { stage, details } => {
                        warn!(unit_id = %unit.id, stage = %stage, "integration rejected");
                        unit.status = UnitStatus::Failed;
                        unit.attempt += 1;
                        unit.output_summary = match stage {
                            FailureStage::MergeConflict | FailureStage::Fetch => {
                                "Merge conflict: changes could not be integrated".to_owned()
                            }
                            _ => format!("Integration failed ({stage}): {details}"),
                        };
                        self.emit(unit, UnitEventType::MergeFailed, &details, TokenUsage::default())
                            .await;
                    }
                }
            }
            "completed" => {
                info!(unit_id = %unit.id, "unit completed with no commits");
                unit.status = UnitStatus::Completed;
                self.emit(unit, UnitEventType::Completed, "", usage).await;
            }
            "blocked" => {
                info!(unit_id = %unit.id, summary = %unit.output_summary, "unit blocked");
                unit.status = UnitStatus::Blocked;
            }
            _ => {
                unit.status = UnitStatus::Failed;
                unit.attempt += 1;
                self.emit(unit, UnitEventType::Failed, "", usage).await;
            }
        }

        unit.finished_at = Some(Utc::now());
        work_units::update_work_unit(&self.store, unit).await?;

        Ok(unit.status == UnitStatus::Completed)
    }

    /// Mark a unit failed with the given summary; optionally counts the
    /// attempt (genuine execution failures do, cascade/deadlock do not).
    async fn fail_unit(&self, unit: &mut WorkUnit, summary: &str, count_attempt: bool) {
        unit.status = UnitStatus::Failed;
        unit.output_summary = summary.to_owned();
        unit.finished_at = Some(Utc::now());
        if count_attempt {
            unit.attempt += 1;
        }
        if let Err(e) = work_units::update_work_unit(&self.store, unit).await {
            error!(unit_id = %unit.id, error = %e, "failed to persist unit failure");
        }
        self.emit(unit, UnitEventType::Failed, summary, TokenUsage::default())
            .await;
    }

    /// Record an event in the store and mirror it to the JSONL stream.
    async fn emit(&self, unit: &WorkUnit, event_type: UnitEventType, details: &str, usage: TokenUsage) {
        if let Err(e) = unit_events::record_unit_event(
            &self.store,
            unit,
            event_type,
            details,
            usage.input_tokens,
            usage.output_tokens,
        )
        .await
        {
            error!(unit_id = %unit.id, error = %e, "failed to record unit event");
        }

        if let Some(ref stream) = self.stream {
            stream.emit(
                &EventRecord::new(event_type.to_string())
                    .round(unit.round_id.as_deref().unwrap_or(""))
                    .unit(&unit.id)
                    .details(serde_json::json!({ "details": details }))
                    .tokens(usage.input_tokens, usage.output_tokens)
                    .cost(unit.cost_usd),
            );
        }
    }
}
