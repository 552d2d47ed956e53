//! Plan-tree persistence: nodes and units land as rows, and the tree is
//! reconstructible from `parent_id` and the ordered `children_ids` CSV.

use mc_core::planner::{draft_from_units, persist_plan_draft};
use mc_db::models::{NodeType, Plan, PlanStatus, WorkUnit};
use mc_db::queries::{plans, work_units};
use mc_test_utils::test_store;

#[tokio::test]
async fn persisted_tree_reconstructs_from_rows() {
    let store = test_store().await.unwrap();

    let plan = Plan::new("split the work");
    let units = vec![
        WorkUnit::new(&plan.id, "first leaf"),
        WorkUnit::new(&plan.id, "second leaf"),
        WorkUnit::new(&plan.id, "third leaf"),
    ];
    let mut draft = draft_from_units(plan, units);
    persist_plan_draft(&store, &mut draft).await.unwrap();

    let stored_plan = plans::get_plan(&store, &draft.plan.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored_plan.total_units, 3);
    assert_eq!(stored_plan.status, PlanStatus::Active);

    let nodes = plans::nodes_for_plan(&store, &draft.plan.id).await.unwrap();
    assert_eq!(nodes.len(), 4, "one branch root plus three leaves");

    let root = nodes
        .iter()
        .find(|n| n.parent_id.is_none())
        .expect("root node");
    assert_eq!(root.node_type, NodeType::Branch);
    assert_eq!(root.depth, 0);
    assert!(root.work_unit_id.is_none(), "branches carry no unit");

    // The ordered children CSV names every leaf, and each leaf points back
    // via parent_id without any persisted back-pointers.
    let child_ids: Vec<&str> = root
        .children_ids
        .split(',')
        .filter(|s| !s.is_empty())
        .collect();
    assert_eq!(child_ids.len(), 3);

    for child_id in &child_ids {
        let leaf = nodes
            .iter()
            .find(|n| n.id == *child_id)
            .expect("child row exists");
        assert_eq!(leaf.node_type, NodeType::Leaf);
        assert_eq!(leaf.parent_id.as_deref(), Some(root.id.as_str()));
        assert_eq!(leaf.depth, 1);

        // Leaves carry exactly one unit, and the unit points back at the
        // leaf node.
        let unit_id = leaf.work_unit_id.as_deref().expect("leaf carries a unit");
        let unit = work_units::get_work_unit(&store, unit_id)
            .await
            .unwrap()
            .expect("unit row exists");
        assert_eq!(unit.plan_node_id.as_deref(), Some(leaf.id.as_str()));
        assert_eq!(unit.plan_id, draft.plan.id);
    }
}

#[tokio::test]
async fn empty_plan_persists_root_only() {
    let store = test_store().await.unwrap();

    let plan = Plan::new("nothing to do");
    let mut draft = draft_from_units(plan, Vec::new());
    persist_plan_draft(&store, &mut draft).await.unwrap();

    assert_eq!(draft.plan.total_units, 0);
    let nodes = plans::nodes_for_plan(&store, &draft.plan.id).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].children_ids.is_empty());

    let units = work_units::units_for_plan(&store, &draft.plan.id)
        .await
        .unwrap();
    assert!(units.is_empty());
}
