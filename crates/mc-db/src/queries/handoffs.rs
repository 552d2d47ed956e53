//! Query functions for the `handoffs` table.
//!
//! List columns are stored as JSON text and must round-trip exactly.

use anyhow::{Context, Result};
use sqlx::FromRow;

use crate::Store;
use crate::models::Handoff;

#[derive(Debug, FromRow)]
struct HandoffRow {
    id: String,
    work_unit_id: String,
    round_id: Option<String>,
    status: String,
    summary: String,
    commits: String,
    discoveries: String,
    concerns: String,
    files_changed: String,
}

fn decode_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

impl From<HandoffRow> for Handoff {
    fn from(row: HandoffRow) -> Self {
        Handoff {
            id: row.id,
            work_unit_id: row.work_unit_id,
            round_id: row.round_id,
            status: row.status,
            summary: row.summary,
            commits: decode_list(&row.commits),
            discoveries: decode_list(&row.discoveries),
            concerns: decode_list(&row.concerns),
            files_changed: decode_list(&row.files_changed),
        }
    }
}

pub async fn insert_handoff(store: &Store, handoff: &Handoff) -> Result<()> {
    let commits = serde_json::to_string(&handoff.commits)?;
    let discoveries = serde_json::to_string(&handoff.discoveries)?;
    let concerns = serde_json::to_string(&handoff.concerns)?;
    let files_changed = serde_json::to_string(&handoff.files_changed)?;

    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO handoffs \
         (id, work_unit_id, round_id, status, summary, commits, discoveries, \
          concerns, files_changed) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&handoff.id)
    .bind(&handoff.work_unit_id)
    .bind(&handoff.round_id)
    .bind(&handoff.status)
    .bind(&handoff.summary)
    .bind(commits)
    .bind(discoveries)
    .bind(concerns)
    .bind(files_changed)
    .execute(store.pool())
    .await
    .context("failed to insert handoff")?;

    Ok(())
}

pub async fn get_handoff(store: &Store, id: &str) -> Result<Option<Handoff>> {
    let row = sqlx::query_as::<_, HandoffRow>("SELECT * FROM handoffs WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await
        .context("failed to fetch handoff")?;

    Ok(row.map(Handoff::from))
}

pub async fn handoffs_for_round(store: &Store, round_id: &str) -> Result<Vec<Handoff>> {
    let rows = sqlx::query_as::<_, HandoffRow>(
        "SELECT * FROM handoffs WHERE round_id = ? ORDER BY id ASC",
    )
    .bind(round_id)
    .fetch_all(store.pool())
    .await
    .context("failed to list handoffs for round")?;

    Ok(rows.into_iter().map(Handoff::from).collect())
}

/// Most recent handoffs across a mission, oldest first within the window.
pub async fn recent_handoffs(store: &Store, mission_id: &str, limit: i64) -> Result<Vec<Handoff>> {
    let rows = sqlx::query_as::<_, HandoffRow>(
        "SELECT h.* FROM handoffs h \
         JOIN rounds r ON r.id = h.round_id \
         WHERE r.mission_id = ? \
         ORDER BY h.id DESC LIMIT ?",
    )
    .bind(mission_id)
    .bind(limit)
    .fetch_all(store.pool())
    .await
    .context("failed to list recent handoffs")?;

    let mut handoffs: Vec<Handoff> = rows.into_iter().map(Handoff::from).collect();
    handoffs.reverse();
    Ok(handoffs)
}
