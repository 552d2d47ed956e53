//! The append-only unit-event store and status derivation.
//!
//! Events are the ground truth for crash recovery: the mutable
//! `work_units.status` column is a cache, and [`derive_status`] (a pure
//! fold over the event sequence) wins whenever the two disagree.

use anyhow::{Context, Result};
use chrono::Utc;

use crate::Store;
use crate::models::{UnitEvent, UnitEventType, UnitStatus, WorkUnit};

/// Entity kinds that an event replay can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventEntity {
    Unit,
    Round,
    Mission,
}

/// Append an event for a work unit.
///
/// Units with no round binding (no `round_id`) emit nothing: this protects
/// against bootstrap-time writes before the dispatcher adopts the plan.
/// The append is durable when this returns.
pub async fn record_unit_event(
    store: &Store,
    unit: &WorkUnit,
    event_type: UnitEventType,
    details: &str,
    input_tokens: i64,
    output_tokens: i64,
) -> Result<()> {
    let Some(round_id) = unit.round_id.as_deref() else {
        tracing::debug!(
            unit_id = %unit.id,
            event = %event_type,
            "skipping event for unit with no round binding"
        );
        return Ok(());
    };

    let mission_id = mission_id_for_round(store, round_id).await?;

    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO unit_events \
         (timestamp, mission_id, round_id, work_unit_id, event_type, details, \
          input_tokens, output_tokens) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Utc::now())
    .bind(&mission_id)
    .bind(round_id)
    .bind(&unit.id)
    .bind(event_type.to_string())
    .bind(details)
    .bind(input_tokens)
    .bind(output_tokens)
    .execute(store.pool())
    .await
    .with_context(|| format!("failed to record {event_type} event for unit {}", unit.id))?;

    Ok(())
}

async fn mission_id_for_round(store: &Store, round_id: &str) -> Result<String> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT mission_id FROM rounds WHERE id = ?")
            .bind(round_id)
            .fetch_optional(store.pool())
            .await
            .context("failed to resolve mission for round")?;

    Ok(row.map(|(id,)| id).unwrap_or_default())
}

/// Replay all events for an entity in chronological (insertion) order.
pub async fn replay_events(
    store: &Store,
    entity: EventEntity,
    id: &str,
) -> Result<Vec<UnitEvent>> {
    let column = match entity {
        EventEntity::Unit => "work_unit_id",
        EventEntity::Round => "round_id",
        EventEntity::Mission => "mission_id",
    };

    let sql = format!("SELECT * FROM unit_events WHERE {column} = ? ORDER BY id ASC");
    let events = sqlx::query_as::<_, UnitEvent>(&sql)
        .bind(id)
        .fetch_all(store.pool())
        .await
        .context("failed to replay events")?;

    Ok(events)
}

/// Derive the canonical unit status from an event sequence.
///
/// Walks events in order, tracking the status implied by the last known
/// status-bearing event. Unknown event strings and non-status events are
/// skipped. An empty sequence derives pending.
pub fn derive_status(events: &[UnitEvent]) -> UnitStatus {
    let mut status = UnitStatus::Pending;
    for event in events {
        if let Some(implied) = event.kind().and_then(UnitEventType::implied_status) {
            status = implied;
        }
    }
    status
}

/// Replay a unit's events and fold them into its derived status.
pub async fn derive_status_from_db(store: &Store, unit_id: &str) -> Result<UnitStatus> {
    let events = replay_events(store, EventEntity::Unit, unit_id).await?;
    Ok(derive_status(&events))
}

/// Total token usage recorded against a mission's events.
pub async fn token_usage_for_mission(store: &Store, mission_id: &str) -> Result<(i64, i64)> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0) \
         FROM unit_events WHERE mission_id = ?",
    )
    .bind(mission_id)
    .fetch_one(store.pool())
    .await
    .context("failed to sum token usage for mission")?;

    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: &str) -> UnitEvent {
        UnitEvent {
            id: 0,
            timestamp: Utc::now(),
            mission_id: "m1".to_owned(),
            round_id: Some("r1".to_owned()),
            work_unit_id: "wu1".to_owned(),
            event_type: event_type.to_owned(),
            details: String::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    fn derive(types: &[&str]) -> UnitStatus {
        let events: Vec<UnitEvent> = types.iter().map(|t| event(t)).collect();
        derive_status(&events)
    }

    #[test]
    fn empty_sequence_is_pending() {
        assert_eq!(derive(&[]), UnitStatus::Pending);
    }

    #[test]
    fn full_lifecycle_is_completed() {
        assert_eq!(
            derive(&["dispatched", "claimed", "running", "completed", "merged"]),
            UnitStatus::Completed
        );
    }

    #[test]
    fn retry_cycle_ends_completed() {
        assert_eq!(
            derive(&[
                "dispatched",
                "claimed",
                "running",
                "merge_failed",
                "retry_queued",
                "dispatched",
                "claimed",
                "running",
                "completed",
                "merged",
            ]),
            UnitStatus::Completed
        );
    }

    #[test]
    fn rejection_is_failed() {
        assert_eq!(
            derive(&["dispatched", "claimed", "running", "merge_failed", "rejected"]),
            UnitStatus::Failed
        );
    }

    #[test]
    fn unknown_events_are_skipped() {
        assert_eq!(
            derive(&["dispatched", "some_unknown_event", "completed"]),
            UnitStatus::Completed
        );
    }

    #[test]
    fn research_counts_as_completed() {
        assert_eq!(
            derive(&["dispatched", "research_completed"]),
            UnitStatus::Completed
        );
    }

    #[test]
    fn degradation_marker_does_not_change_status() {
        assert_eq!(
            derive(&["dispatched", "running", "degradation_transition"]),
            UnitStatus::Running
        );
    }
}
