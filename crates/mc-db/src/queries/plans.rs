//! Query functions for the `plans` and `plan_nodes` tables.

use anyhow::{Context, Result};

use crate::Store;
use crate::models::{Plan, PlanNode};

pub async fn insert_plan(store: &Store, plan: &Plan) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO plans \
         (id, round_id, objective, status, created_at, finished_at, \
          raw_planner_output, total_units, completed_units, failed_units) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&plan.id)
    .bind(&plan.round_id)
    .bind(&plan.objective)
    .bind(plan.status)
    .bind(plan.created_at)
    .bind(plan.finished_at)
    .bind(&plan.raw_planner_output)
    .bind(plan.total_units)
    .bind(plan.completed_units)
    .bind(plan.failed_units)
    .execute(store.pool())
    .await
    .context("failed to insert plan")?;

    Ok(())
}

pub async fn update_plan(store: &Store, plan: &Plan) -> Result<()> {
    let _write = store.write().await;
    let result = sqlx::query(
        "UPDATE plans SET \
         round_id = ?, objective = ?, status = ?, finished_at = ?, \
         raw_planner_output = ?, total_units = ?, completed_units = ?, failed_units = ? \
         WHERE id = ?",
    )
    .bind(&plan.round_id)
    .bind(&plan.objective)
    .bind(plan.status)
    .bind(plan.finished_at)
    .bind(&plan.raw_planner_output)
    .bind(plan.total_units)
    .bind(plan.completed_units)
    .bind(plan.failed_units)
    .bind(&plan.id)
    .execute(store.pool())
    .await
    .context("failed to update plan")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("plan {} not found", plan.id);
    }

    Ok(())
}

pub async fn get_plan(store: &Store, id: &str) -> Result<Option<Plan>> {
    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await
        .context("failed to fetch plan")?;

    Ok(plan)
}

pub async fn insert_plan_node(store: &Store, node: &PlanNode) -> Result<()> {
    let _write = store.write().await;
    sqlx::query(
        "INSERT INTO plan_nodes \
         (id, plan_id, parent_id, depth, scope, node_type, strategy, status, \
          children_ids, work_unit_id) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&node.id)
    .bind(&node.plan_id)
    .bind(&node.parent_id)
    .bind(node.depth)
    .bind(&node.scope)
    .bind(node.node_type)
    .bind(node.strategy)
    .bind(&node.status)
    .bind(&node.children_ids)
    .bind(&node.work_unit_id)
    .execute(store.pool())
    .await
    .context("failed to insert plan node")?;

    Ok(())
}

/// All nodes of a plan. The tree is reconstructed from `parent_id` and the
/// ordered `children_ids` CSV; back-pointers are never persisted.
pub async fn nodes_for_plan(store: &Store, plan_id: &str) -> Result<Vec<PlanNode>> {
    let nodes = sqlx::query_as::<_, PlanNode>(
        "SELECT * FROM plan_nodes WHERE plan_id = ? ORDER BY depth ASC, id ASC",
    )
    .bind(plan_id)
    .fetch_all(store.pool())
    .await
    .context("failed to list plan nodes")?;

    Ok(nodes)
}
