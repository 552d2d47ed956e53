//! Query functions for the `signals` table -- the control-plane signal bus.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};

use crate::Store;
use crate::models::{Signal, SignalStatus};

pub async fn insert_signal(store: &Store, signal: &Signal) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO signals (id, mission_id, signal_type, payload, status, created_at) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&signal.id)
    .bind(&signal.mission_id)
    .bind(signal.signal_type)
    .bind(&signal.payload)
    .bind(signal.status)
    .bind(signal.created_at)
    .execute(store.pool())
    .await
    .context("failed to insert signal")?;

    Ok(())
}

/// Pending signals for a mission in arrival order.
pub async fn pending_signals(store: &Store, mission_id: &str) -> Result<Vec<Signal>> {
    let signals = sqlx::query_as::<_, Signal>(
        "SELECT * FROM signals \
         WHERE mission_id = ? AND status = 'pending' \
         ORDER BY created_at ASC",
    )
    .bind(mission_id)
    .fetch_all(store.pool())
    .await
    .context("failed to list pending signals")?;

    Ok(signals)
}

pub async fn acknowledge_signal(store: &Store, signal_id: &str) -> Result<()> {
    let _write = store.write().await;
    sqlx::query("UPDATE signals SET status = ? WHERE id = ?")
        .bind(SignalStatus::Acknowledged)
        .bind(signal_id)
        .execute(store.pool())
        .await
        .context("failed to acknowledge signal")?;

    Ok(())
}

/// Move pending signals older than the timeout to expired. Returns the
/// number of rows expired.
pub async fn expire_stale_signals(store: &Store, timeout_minutes: i64) -> Result<u64> {
    let cutoff = Utc::now() - Duration::minutes(timeout_minutes);

    let _write = store.write().await;
    let result = sqlx::query(
        "UPDATE signals SET status = 'expired' \
         WHERE status = 'pending' AND created_at < ?",
    )
    .bind(cutoff)
    .execute(store.pool())
    .await
    .context("failed to expire stale signals")?;

    Ok(result.rows_affected())
}
