//! Query functions for the `work_units` table.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};

use crate::Store;
use crate::models::{UnitEventType, WorkUnit};
use crate::queries::unit_events;

pub async fn insert_work_unit(store: &Store, unit: &WorkUnit) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO work_units \
         (id, plan_id, plan_node_id, round_id, title, description, files_hint, \
          verification_hint, acceptance_criteria, priority, status, worker_id, \
          depends_on, branch_name, claimed_at, heartbeat_at, started_at, finished_at, \
          exit_code, commit_hash, output_summary, attempt, max_attempts, timeout, \
          cost_usd, handoff_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&unit.id)
    .bind(&unit.plan_id)
    .bind(&unit.plan_node_id)
    .bind(&unit.round_id)
    .bind(&unit.title)
    .bind(&unit.description)
    .bind(&unit.files_hint)
    .bind(&unit.verification_hint)
    .bind(&unit.acceptance_criteria)
    .bind(unit.priority)
    .bind(unit.status)
    .bind(&unit.worker_id)
    .bind(&unit.depends_on)
    .bind(&unit.branch_name)
    .bind(unit.claimed_at)
    .bind(unit.heartbeat_at)
    .bind(unit.started_at)
    .bind(unit.finished_at)
    .bind(unit.exit_code)
    .bind(&unit.commit_hash)
    .bind(&unit.output_summary)
    .bind(unit.attempt)
    .bind(unit.max_attempts)
    .bind(unit.timeout)
    .bind(unit.cost_usd)
    .bind(&unit.handoff_id)
    .execute(store.pool())
    .await
    .context("failed to insert work unit")?;

    Ok(())
}

pub async fn update_work_unit(store: &Store, unit: &WorkUnit) -> Result<()> {
    let _write = store.write().await;
    let result = sqlx::query(
        "UPDATE work_units SET \
         plan_id = ?, plan_node_id = ?, round_id = ?, title = ?, description = ?, \
         files_hint = ?, verification_hint = ?, acceptance_criteria = ?, priority = ?, \
         status = ?, worker_id = ?, depends_on = ?, branch_name = ?, claimed_at = ?, \
         heartbeat_at = ?, started_at = ?, finished_at = ?, exit_code = ?, \
         commit_hash = ?, output_summary = ?, attempt = ?, max_attempts = ?, \
         timeout = ?, cost_usd = ?, handoff_id = ? \
         WHERE id = ?",
    )
    .bind(&unit.plan_id)
    .bind(&unit.plan_node_id)
    .bind(&unit.round_id)
    .bind(&unit.title)
    .bind(&unit.description)
    .bind(&unit.files_hint)
    .bind(&unit.verification_hint)
    .bind(&unit.acceptance_criteria)
    .bind(unit.priority)
    .bind(unit.status)
    .bind(&unit.worker_id)
    .bind(&unit.depends_on)
    .bind(&unit.branch_name)
    .bind(unit.claimed_at)
    .bind(unit.heartbeat_at)
    .bind(unit.started_at)
    .bind(unit.finished_at)
    .bind(unit.exit_code)
    .bind(&unit.commit_hash)
    .bind(&unit.output_summary)
    .bind(unit.attempt)
    .bind(unit.max_attempts)
    .bind(unit.timeout)
    .bind(unit.cost_usd)
    .bind(&unit.handoff_id)
    .bind(&unit.id)
    .execute(store.pool())
    .await
    .context("failed to update work unit")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("work unit {} not found", unit.id);
    }

    Ok(())
}

pub async fn get_work_unit(store: &Store, id: &str) -> Result<Option<WorkUnit>> {
    let unit = sqlx::query_as::<_, WorkUnit>("SELECT * FROM work_units WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await
        .context("failed to fetch work unit")?;

    Ok(unit)
}

pub async fn units_for_plan(store: &Store, plan_id: &str) -> Result<Vec<WorkUnit>> {
    let units = sqlx::query_as::<_, WorkUnit>(
        "SELECT * FROM work_units WHERE plan_id = ? ORDER BY priority ASC, id ASC",
    )
    .bind(plan_id)
    .fetch_all(store.pool())
    .await
    .context("failed to list work units for plan")?;

    Ok(units)
}

/// Atomically claim the next claimable work unit for a worker.
///
/// A unit is claimable iff it is pending and every id in its CSV
/// `depends_on` column references a completed unit. The claim is a single
/// guarded UPDATE so two workers can never claim the same unit. Emits a
/// `claimed` event when the unit has a round binding.
pub async fn claim_work_unit(store: &Store, worker_id: &str) -> Result<Option<WorkUnit>> {
    let now = Utc::now();
    let claimed = {
        let _write = store.write().await;
        sqlx::query_as::<_, WorkUnit>(
            "UPDATE work_units SET \
                 status = 'claimed', worker_id = ?, claimed_at = ?, heartbeat_at = ? \
             WHERE id = ( \
                 SELECT wu.id FROM work_units wu \
                 WHERE wu.status = 'pending' \
                 AND NOT EXISTS ( \
                     SELECT 1 FROM work_units dep \
                     WHERE dep.id IN ( \
                         SELECT value FROM ( \
                             WITH RECURSIVE split(value, rest) AS ( \
                                 SELECT '', wu.depends_on || ',' \
                                 UNION ALL \
                                 SELECT substr(rest, 1, instr(rest, ',') - 1), \
                                        substr(rest, instr(rest, ',') + 1) \
                                 FROM split WHERE rest != '' \
                             ) \
                             SELECT trim(value) AS value FROM split WHERE trim(value) != '' \
                         ) \
                     ) \
                     AND dep.status != 'completed' \
                 ) \
                 ORDER BY wu.priority ASC, wu.id ASC \
                 LIMIT 1 \
             ) \
             RETURNING *",
        )
        .bind(worker_id)
        .bind(now)
        .bind(now)
        .fetch_optional(store.pool())
        .await
        .context("failed to claim work unit")?
    };

    if let Some(ref unit) = claimed {
        unit_events::record_unit_event(store, unit, UnitEventType::Claimed, "", 0, 0).await?;
    }

    Ok(claimed)
}

/// Release claimed/running units whose heartbeat is stale (worker likely
/// dead) back to pending, when retry budget remains.
pub async fn recover_stale_units(store: &Store, timeout_secs: i64) -> Result<Vec<WorkUnit>> {
    let cutoff = Utc::now() - Duration::seconds(timeout_secs);

    let _write = store.write().await;
    let units = sqlx::query_as::<_, WorkUnit>(
        "UPDATE work_units SET \
             status = 'pending', worker_id = NULL, claimed_at = NULL, heartbeat_at = NULL \
         WHERE status IN ('claimed', 'running') \
           AND heartbeat_at IS NOT NULL \
           AND heartbeat_at < ? \
           AND attempt < max_attempts \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(store.pool())
    .await
    .context("failed to recover stale work units")?;

    Ok(units)
}

/// Refresh the heartbeat for every unit a worker currently holds.
pub async fn update_heartbeat(store: &Store, worker_id: &str) -> Result<()> {
    let now = Utc::now();
    let _write = store.write().await;
    sqlx::query(
        "UPDATE work_units SET heartbeat_at = ? \
         WHERE worker_id = ? AND status IN ('claimed', 'running')",
    )
    .bind(now)
    .bind(worker_id)
    .execute(store.pool())
    .await
    .context("failed to update unit heartbeats")?;

    sqlx::query("UPDATE workers SET last_heartbeat = ? WHERE id = ?")
        .bind(now)
        .bind(worker_id)
        .execute(store.pool())
        .await
        .context("failed to update worker heartbeat")?;

    Ok(())
}

/// Reset a failed unit to pending for a retry, clearing worker, heartbeat,
/// and timestamps. Guarded on the current status and the retry budget;
/// returns whether a row was reset.
pub async fn reset_unit_for_retry(store: &Store, unit_id: &str) -> Result<bool> {
    let _write = store.write().await;
    let result = sqlx::query(
        "UPDATE work_units SET \
             status = 'pending', worker_id = NULL, claimed_at = NULL, \
             heartbeat_at = NULL, started_at = NULL, finished_at = NULL \
         WHERE id = ? AND status = 'failed' AND attempt < max_attempts",
    )
    .bind(unit_id)
    .execute(store.pool())
    .await
    .context("failed to reset work unit for retry")?;

    Ok(result.rows_affected() > 0)
}

/// Repair the mutable status column from the event stream.
///
/// Used at recovery time: the derived status wins over whatever a crash
/// left in the row.
pub async fn repair_status_from_events(store: &Store, unit_id: &str) -> Result<Option<WorkUnit>> {
    let derived = unit_events::derive_status_from_db(store, unit_id).await?;

    {
        let _write = store.write().await;
        sqlx::query("UPDATE work_units SET status = ? WHERE id = ? AND status != ?")
            .bind(derived)
            .bind(unit_id)
            .bind(derived)
            .execute(store.pool())
            .await
            .context("failed to repair work unit status")?;
    }

    get_work_unit(store, unit_id).await
}
