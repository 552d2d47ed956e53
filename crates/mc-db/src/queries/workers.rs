//! Query functions for the `workers` table.

use anyhow::{Context, Result};

use crate::Store;
use crate::models::Worker;

pub async fn insert_worker(store: &Store, worker: &Worker) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO workers \
         (id, workspace_path, status, current_unit_id, pid, started_at, \
          last_heartbeat, units_completed, units_failed, total_cost_usd) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&worker.id)
    .bind(&worker.workspace_path)
    .bind(worker.status)
    .bind(&worker.current_unit_id)
    .bind(worker.pid)
    .bind(worker.started_at)
    .bind(worker.last_heartbeat)
    .bind(worker.units_completed)
    .bind(worker.units_failed)
    .bind(worker.total_cost_usd)
    .execute(store.pool())
    .await
    .context("failed to insert worker")?;

    Ok(())
}

pub async fn update_worker(store: &Store, worker: &Worker) -> Result<()> {
    let _write = store.write().await;
    let result = sqlx::query(
        "UPDATE workers SET \
         workspace_path = ?, status = ?, current_unit_id = ?, pid = ?, \
         last_heartbeat = ?, units_completed = ?, units_failed = ?, total_cost_usd = ? \
         WHERE id = ?",
    )
    .bind(&worker.workspace_path)
    .bind(worker.status)
    .bind(&worker.current_unit_id)
    .bind(worker.pid)
    .bind(worker.last_heartbeat)
    .bind(worker.units_completed)
    .bind(worker.units_failed)
    .bind(worker.total_cost_usd)
    .bind(&worker.id)
    .execute(store.pool())
    .await
    .context("failed to update worker")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("worker {} not found", worker.id);
    }

    Ok(())
}

pub async fn get_worker(store: &Store, id: &str) -> Result<Option<Worker>> {
    let worker = sqlx::query_as::<_, Worker>("SELECT * FROM workers WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await
        .context("failed to fetch worker")?;

    Ok(worker)
}

pub async fn all_workers(store: &Store) -> Result<Vec<Worker>> {
    let workers =
        sqlx::query_as::<_, Worker>("SELECT * FROM workers ORDER BY started_at ASC")
            .fetch_all(store.pool())
            .await
            .context("failed to list workers")?;

    Ok(workers)
}
