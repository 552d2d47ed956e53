//! Feedback context for the planner: what cannot be learned from the
//! repository itself, condensed from recent handoffs.

use anyhow::Result;

use mc_db::Store;
use mc_db::queries::handoffs;

/// Build the planner's feedback context for a mission: the most recent
/// failures with their last concern, newest last.
pub async fn build_planner_context(store: &Store, mission_id: &str) -> Result<String> {
    let recent = handoffs::recent_handoffs(store, mission_id, 10).await?;

    let failed: Vec<_> = recent
        .iter()
        .filter(|h| h.status != "completed")
        .collect();
    if failed.is_empty() {
        return Ok(String::new());
    }

    let mut lines = vec!["## Recent Failures".to_owned()];
    for handoff in failed.iter().rev().take(3).rev() {
        let detail = handoff
            .concerns
            .last()
            .map(|c| truncated(c, 300))
            .unwrap_or_else(|| "unknown".to_owned());
        let unit = &handoff.work_unit_id[..handoff.work_unit_id.len().min(8)];
        lines.push(format!("- {unit}: {detail}"));
    }

    Ok(lines.join("\n"))
}

fn truncated(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mc_db::models::{Handoff, Mission, Plan, Round, WorkUnit};
    use mc_db::queries::{missions, plans, rounds, work_units};
    use mc_test_utils::test_store;

    #[tokio::test]
    async fn context_lists_recent_failures_only() {
        let store = test_store().await.unwrap();

        let mission = Mission::new("obj");
        missions::insert_mission(&store, &mission).await.unwrap();
        let round = Round::new(&mission.id, 1);
        rounds::insert_round(&store, &round).await.unwrap();
        let plan = Plan::new("obj");
        plans::insert_plan(&store, &plan).await.unwrap();

        for (status, concern) in [("completed", "fine"), ("failed", "tests broke")] {
            let unit = WorkUnit::new(&plan.id, "t");
            work_units::insert_work_unit(&store, &unit).await.unwrap();
            let mut handoff = Handoff::new(&unit.id);
            handoff.round_id = Some(round.id.clone());
            handoff.status = status.to_owned();
            handoff.concerns = vec![concern.to_owned()];
            handoffs::insert_handoff(&store, &handoff).await.unwrap();
        }

        let context = build_planner_context(&store, &mission.id).await.unwrap();
        assert!(context.contains("Recent Failures"));
        assert!(context.contains("tests broke"));
        assert!(!context.contains("fine"));
    }

    #[tokio::test]
    async fn no_failures_yields_empty_context() {
        let store = test_store().await.unwrap();
        let mission = Mission::new("obj");
        missions::insert_mission(&store, &mission).await.unwrap();

        let context = build_planner_context(&store, &mission.id).await.unwrap();
        assert!(context.is_empty());
    }
}
