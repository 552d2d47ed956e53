//! Query functions for the `rounds` table.

use anyhow::{Context, Result};

use crate::Store;
use crate::models::Round;

pub async fn insert_round(store: &Store, round: &Round) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO rounds \
         (id, mission_id, number, status, plan_id, snapshot_hash, objective_score, \
          objective_met, total_units, completed_units, failed_units, discoveries, \
          started_at, finished_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&round.id)
    .bind(&round.mission_id)
    .bind(round.number)
    .bind(round.status)
    .bind(&round.plan_id)
    .bind(&round.snapshot_hash)
    .bind(round.objective_score)
    .bind(round.objective_met)
    .bind(round.total_units)
    .bind(round.completed_units)
    .bind(round.failed_units)
    .bind(&round.discoveries)
    .bind(round.started_at)
    .bind(round.finished_at)
    .execute(store.pool())
    .await
    .context("failed to insert round")?;

    Ok(())
}

pub async fn update_round(store: &Store, round: &Round) -> Result<()> {
    let _write = store.write().await;
    let result = sqlx::query(
        "UPDATE rounds SET \
         status = ?, plan_id = ?, snapshot_hash = ?, objective_score = ?, \
         objective_met = ?, total_units = ?, completed_units = ?, failed_units = ?, \
         discoveries = ?, finished_at = ? \
         WHERE id = ?",
    )
    .bind(round.status)
    .bind(&round.plan_id)
    .bind(&round.snapshot_hash)
    .bind(round.objective_score)
    .bind(round.objective_met)
    .bind(round.total_units)
    .bind(round.completed_units)
    .bind(round.failed_units)
    .bind(&round.discoveries)
    .bind(round.finished_at)
    .bind(&round.id)
    .execute(store.pool())
    .await
    .context("failed to update round")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("round {} not found", round.id);
    }

    Ok(())
}

pub async fn get_round(store: &Store, id: &str) -> Result<Option<Round>> {
    let round = sqlx::query_as::<_, Round>("SELECT * FROM rounds WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await
        .context("failed to fetch round")?;

    Ok(round)
}

/// All rounds of a mission in execution order.
pub async fn rounds_for_mission(store: &Store, mission_id: &str) -> Result<Vec<Round>> {
    let rounds = sqlx::query_as::<_, Round>(
        "SELECT * FROM rounds WHERE mission_id = ? ORDER BY number ASC",
    )
    .bind(mission_id)
    .fetch_all(store.pool())
    .await
    .context("failed to list rounds for mission")?;

    Ok(rounds)
}
