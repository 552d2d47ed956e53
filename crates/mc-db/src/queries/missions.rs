//! Query functions for the `missions` table.

use anyhow::{Context, Result};

use crate::Store;
use crate::models::Mission;

pub async fn insert_mission(store: &Store, mission: &Mission) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO missions \
         (id, objective, status, total_rounds, final_score, started_at, finished_at, stopped_reason) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&mission.id)
    .bind(&mission.objective)
    .bind(mission.status)
    .bind(mission.total_rounds)
    .bind(mission.final_score)
    .bind(mission.started_at)
    .bind(mission.finished_at)
    .bind(&mission.stopped_reason)
    .execute(store.pool())
    .await
    .context("failed to insert mission")?;

    Ok(())
}

pub async fn update_mission(store: &Store, mission: &Mission) -> Result<()> {
    let _write = store.write().await;
    let result = sqlx::query(
        "UPDATE missions SET \
         objective = ?, status = ?, total_rounds = ?, final_score = ?, \
         finished_at = ?, stopped_reason = ? \
         WHERE id = ?",
    )
    .bind(&mission.objective)
    .bind(mission.status)
    .bind(mission.total_rounds)
    .bind(mission.final_score)
    .bind(mission.finished_at)
    .bind(&mission.stopped_reason)
    .bind(&mission.id)
    .execute(store.pool())
    .await
    .context("failed to update mission")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("mission {} not found", mission.id);
    }

    Ok(())
}

pub async fn get_mission(store: &Store, id: &str) -> Result<Option<Mission>> {
    let mission = sqlx::query_as::<_, Mission>("SELECT * FROM missions WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await
        .context("failed to fetch mission")?;

    Ok(mission)
}

/// List the most recent missions, newest first.
pub async fn recent_missions(store: &Store, limit: i64) -> Result<Vec<Mission>> {
    let missions =
        sqlx::query_as::<_, Mission>("SELECT * FROM missions ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(store.pool())
            .await
            .context("failed to list recent missions")?;

    Ok(missions)
}
