//! Query functions for the `snapshots` table.

use anyhow::{Context, Result};

use crate::Store;
use crate::models::Snapshot;

pub async fn insert_snapshot(store: &Store, snapshot: &Snapshot) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO snapshots \
         (id, round_id, taken_at, test_total, test_passed, test_failed, \
          lint_errors, type_errors, security_findings, raw_output) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&snapshot.id)
    .bind(&snapshot.round_id)
    .bind(snapshot.taken_at)
    .bind(snapshot.test_total)
    .bind(snapshot.test_passed)
    .bind(snapshot.test_failed)
    .bind(snapshot.lint_errors)
    .bind(snapshot.type_errors)
    .bind(snapshot.security_findings)
    .bind(&snapshot.raw_output)
    .execute(store.pool())
    .await
    .context("failed to insert snapshot")?;

    Ok(())
}

pub async fn latest_snapshot(store: &Store) -> Result<Option<Snapshot>> {
    let snapshot = sqlx::query_as::<_, Snapshot>(
        "SELECT * FROM snapshots ORDER BY taken_at DESC, id DESC LIMIT 1",
    )
    .fetch_optional(store.pool())
    .await
    .context("failed to fetch latest snapshot")?;

    Ok(snapshot)
}
