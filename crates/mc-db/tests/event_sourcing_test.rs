//! Event sourcing: replay, derivation, epoch binding, and crash recovery.

use mc_db::models::{Mission, Plan, Round, UnitEventType, UnitStatus, WorkUnit};
use mc_db::queries::unit_events::{self, EventEntity};
use mc_db::queries::{missions, plans, rounds, work_units};
use mc_db::Store;
use mc_test_utils::test_store;

struct Fixture {
    store: Store,
    mission: Mission,
    round: Round,
    plan: Plan,
}

async fn fixture() -> Fixture {
    let store = test_store().await.unwrap();
    let mission = Mission::new("objective");
    missions::insert_mission(&store, &mission).await.unwrap();
    let round = Round::new(&mission.id, 1);
    rounds::insert_round(&store, &round).await.unwrap();
    let plan = Plan::new("objective");
    plans::insert_plan(&store, &plan).await.unwrap();
    Fixture {
        store,
        mission,
        round,
        plan,
    }
}

async fn insert_unit(fx: &Fixture, bound: bool) -> WorkUnit {
    let mut unit = WorkUnit::new(&fx.plan.id, "task");
    if bound {
        unit.round_id = Some(fx.round.id.clone());
    }
    work_units::insert_work_unit(&fx.store, &unit).await.unwrap();
    unit
}

async fn record(fx: &Fixture, unit: &WorkUnit, event_type: UnitEventType) {
    unit_events::record_unit_event(&fx.store, unit, event_type, "", 0, 0)
        .await
        .unwrap();
}

#[tokio::test]
async fn replay_is_chronological() {
    let fx = fixture().await;
    let unit = insert_unit(&fx, true).await;

    record(&fx, &unit, UnitEventType::Dispatched).await;
    record(&fx, &unit, UnitEventType::Claimed).await;
    record(&fx, &unit, UnitEventType::Running).await;

    let events = unit_events::replay_events(&fx.store, EventEntity::Unit, &unit.id)
        .await
        .unwrap();
    assert_eq!(events.len(), 3);
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(types, vec!["dispatched", "claimed", "running"]);
    assert_eq!(events[0].mission_id, fx.mission.id);
    assert_eq!(events[0].round_id.as_deref(), Some(fx.round.id.as_str()));
}

#[tokio::test]
async fn replay_scopes_to_round_and_mission() {
    let fx = fixture().await;
    let unit_a = insert_unit(&fx, true).await;
    let unit_b = insert_unit(&fx, true).await;

    record(&fx, &unit_a, UnitEventType::Dispatched).await;
    record(&fx, &unit_b, UnitEventType::Dispatched).await;

    let by_round = unit_events::replay_events(&fx.store, EventEntity::Round, &fx.round.id)
        .await
        .unwrap();
    assert_eq!(by_round.len(), 2);

    let by_mission = unit_events::replay_events(&fx.store, EventEntity::Mission, &fx.mission.id)
        .await
        .unwrap();
    assert_eq!(by_mission.len(), 2);

    let none = unit_events::replay_events(&fx.store, EventEntity::Unit, "nonexistent")
        .await
        .unwrap();
    assert!(none.is_empty());
}

#[tokio::test]
async fn unit_without_round_binding_emits_nothing() {
    let fx = fixture().await;
    let unit = insert_unit(&fx, false).await;

    record(&fx, &unit, UnitEventType::Dispatched).await;

    let events = unit_events::replay_events(&fx.store, EventEntity::Unit, &unit.id)
        .await
        .unwrap();
    assert!(events.is_empty(), "bootstrap-time writes must be skipped");
}

#[tokio::test]
async fn derived_status_retry_cycle() {
    let fx = fixture().await;
    let unit = insert_unit(&fx, true).await;

    for event in [
        UnitEventType::Dispatched,
        UnitEventType::Claimed,
        UnitEventType::Running,
        UnitEventType::MergeFailed,
        UnitEventType::RetryQueued,
        UnitEventType::Dispatched,
        UnitEventType::Claimed,
        UnitEventType::Running,
        UnitEventType::Completed,
        UnitEventType::Merged,
    ] {
        record(&fx, &unit, event).await;
    }

    let derived = unit_events::derive_status_from_db(&fx.store, &unit.id)
        .await
        .unwrap();
    assert_eq!(derived, UnitStatus::Completed);
}

#[tokio::test]
async fn derived_status_rejection_is_failed() {
    let fx = fixture().await;
    let unit = insert_unit(&fx, true).await;

    for event in [
        UnitEventType::Dispatched,
        UnitEventType::MergeFailed,
        UnitEventType::Rejected,
    ] {
        record(&fx, &unit, event).await;
    }

    let derived = unit_events::derive_status_from_db(&fx.store, &unit.id)
        .await
        .unwrap();
    assert_eq!(derived, UnitStatus::Failed);
}

// Crash recovery: the mutable row lies ("running"), the event stream
// knows the truth ("completed"+"merged"), and the derived value wins.
#[tokio::test]
async fn crash_recovery_prefers_derived_status() {
    let fx = fixture().await;
    let mut unit = insert_unit(&fx, true).await;

    for event in [
        UnitEventType::Dispatched,
        UnitEventType::Claimed,
        UnitEventType::Running,
        UnitEventType::Completed,
        UnitEventType::Merged,
    ] {
        record(&fx, &unit, event).await;
    }

    // Simulate the crash: the row is stuck at running.
    unit.status = UnitStatus::Running;
    work_units::update_work_unit(&fx.store, &unit).await.unwrap();

    let derived = unit_events::derive_status_from_db(&fx.store, &unit.id)
        .await
        .unwrap();
    assert_eq!(derived, UnitStatus::Completed);

    let repaired = work_units::repair_status_from_events(&fx.store, &unit.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(repaired.status, UnitStatus::Completed);

    // A repaired completed unit is not claimable again.
    let claimed = work_units::claim_work_unit(&fx.store, "w1").await.unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn token_usage_sums_over_mission() {
    let fx = fixture().await;
    let unit = insert_unit(&fx, true).await;

    unit_events::record_unit_event(&fx.store, &unit, UnitEventType::Completed, "", 100, 20)
        .await
        .unwrap();
    unit_events::record_unit_event(&fx.store, &unit, UnitEventType::Merged, "", 5, 7)
        .await
        .unwrap();

    let (input, output) = unit_events::token_usage_for_mission(&fx.store, &fx.mission.id)
        .await
        .unwrap();
    assert_eq!(input, 105);
    assert_eq!(output, 27);
}
