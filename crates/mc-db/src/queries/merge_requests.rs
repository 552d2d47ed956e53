//! Query functions for the `merge_requests` table.

use anyhow::{Context, Result};

use crate::Store;
use crate::models::MergeRequest;

pub async fn insert_merge_request(store: &Store, mr: &MergeRequest) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO merge_requests \
         (id, work_unit_id, worker_id, branch_name, commit_hash, status, position, \
          created_at, verified_at, merged_at, rejection_reason, rebase_attempts) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&mr.id)
    .bind(&mr.work_unit_id)
    .bind(&mr.worker_id)
    .bind(&mr.branch_name)
    .bind(&mr.commit_hash)
    .bind(mr.status)
    .bind(mr.position)
    .bind(mr.created_at)
    .bind(mr.verified_at)
    .bind(mr.merged_at)
    .bind(&mr.rejection_reason)
    .bind(mr.rebase_attempts)
    .execute(store.pool())
    .await
    .context("failed to insert merge request")?;

    Ok(())
}

pub async fn update_merge_request(store: &Store, mr: &MergeRequest) -> Result<()> {
    let _write = store.write().await;
    let result = sqlx::query(
        "UPDATE merge_requests SET \
         work_unit_id = ?, worker_id = ?, branch_name = ?, commit_hash = ?, \
         status = ?, position = ?, verified_at = ?, merged_at = ?, \
         rejection_reason = ?, rebase_attempts = ? \
         WHERE id = ?",
    )
    .bind(&mr.work_unit_id)
    .bind(&mr.worker_id)
    .bind(&mr.branch_name)
    .bind(&mr.commit_hash)
    .bind(mr.status)
    .bind(mr.position)
    .bind(mr.verified_at)
    .bind(mr.merged_at)
    .bind(&mr.rejection_reason)
    .bind(mr.rebase_attempts)
    .bind(&mr.id)
    .execute(store.pool())
    .await
    .context("failed to update merge request")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("merge request {} not found", mr.id);
    }

    Ok(())
}

/// The next pending merge request by position.
pub async fn next_pending_merge_request(store: &Store) -> Result<Option<MergeRequest>> {
    let mr = sqlx::query_as::<_, MergeRequest>(
        "SELECT * FROM merge_requests WHERE status = 'pending' ORDER BY position ASC LIMIT 1",
    )
    .fetch_optional(store.pool())
    .await
    .context("failed to fetch next pending merge request")?;

    Ok(mr)
}

pub async fn merge_requests_for_plan(store: &Store, plan_id: &str) -> Result<Vec<MergeRequest>> {
    let mrs = sqlx::query_as::<_, MergeRequest>(
        "SELECT mr.* FROM merge_requests mr \
         JOIN work_units wu ON mr.work_unit_id = wu.id \
         WHERE wu.plan_id = ? \
         ORDER BY mr.position ASC",
    )
    .bind(plan_id)
    .fetch_all(store.pool())
    .await
    .context("failed to list merge requests for plan")?;

    Ok(mrs)
}

/// Allocate the next merge position (monotonically increasing).
pub async fn next_merge_position(store: &Store) -> Result<i64> {
    let row: (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(position), 0) + 1 FROM merge_requests")
            .fetch_one(store.pool())
            .await
            .context("failed to compute next merge position")?;

    Ok(row.0)
}
