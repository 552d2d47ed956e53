//! Planner contract: decompose an objective into a tree of plan nodes
//! whose leaves carry work units.
//!
//! The planner itself is an external LLM call; the core defines the trait,
//! the draft tree, its persistence, and a subprocess implementation that
//! parses the planner's JSON output. Any implementation meeting the trait
//! is valid.

pub mod context;

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::warn;

use crate::config::MissionConfig;
use crate::worker::extract_json;
use mc_db::Store;
use mc_db::models::{NodeType, Plan, PlanNode, PlanStatus, WorkUnit, new_id};
use mc_db::queries::{plans, work_units};

/// Inputs to one planning pass.
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub objective: String,
    /// Green-branch HEAD at round start.
    pub snapshot_hash: String,
    pub prior_discoveries: Vec<String>,
    pub round_number: i64,
    pub feedback_context: String,
}

/// A node in the in-memory draft tree. Transient cross-references live
/// only here; persistence writes plain rows and reconstructs the tree
/// from `parent_id` and the ordered `children_ids` CSV.
#[derive(Debug, Clone)]
pub struct PlanNodeDraft {
    pub node: PlanNode,
    pub children: Vec<PlanNodeDraft>,
    /// Exactly one unit for leaves; none for branches.
    pub unit: Option<WorkUnit>,
}

/// A complete planning result: the plan row plus its draft tree.
#[derive(Debug, Clone)]
pub struct PlanDraft {
    pub plan: Plan,
    pub root: PlanNodeDraft,
}

/// The planner seam.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan_round(&self, request: &PlanRequest) -> Result<PlanDraft>;
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Planner) {}
};

/// Build a flat draft (one branch root, one leaf per unit) from parsed
/// work units.
pub fn draft_from_units(plan: Plan, units: Vec<WorkUnit>) -> PlanDraft {
    let mut root = PlanNode::new(&plan.id, NodeType::Branch);
    root.scope = plan.objective.clone();

    let children = units
        .into_iter()
        .map(|mut unit| {
            let mut leaf = PlanNode::new(&plan.id, NodeType::Leaf);
            leaf.parent_id = Some(root.id.clone());
            leaf.depth = 1;
            leaf.scope = unit.title.clone();
            leaf.work_unit_id = Some(unit.id.clone());
            unit.plan_node_id = Some(leaf.id.clone());
            PlanNodeDraft {
                node: leaf,
                children: Vec::new(),
                unit: Some(unit),
            }
        })
        .collect();

    PlanDraft {
        plan,
        root: PlanNodeDraft {
            node: root,
            children,
            unit: None,
        },
    }
}

/// Persist a plan draft: the plan row, every node, and every unit.
///
/// Fills `children_ids` from the ordered children and counts the leaves
/// into `plan.total_units`. Back-pointers are never persisted.
pub async fn persist_plan_draft(store: &Store, draft: &mut PlanDraft) -> Result<()> {
    fn count_units(node: &PlanNodeDraft) -> i64 {
        node.unit.iter().count() as i64
            + node.children.iter().map(count_units).sum::<i64>()
    }

    draft.plan.total_units = count_units(&draft.root);
    draft.plan.status = PlanStatus::Active;
    plans::insert_plan(store, &draft.plan).await?;

    // Iterative pre-order walk; children are linked before insertion.
    fn link(node: &mut PlanNodeDraft, plan_id: &str) {
        node.node.plan_id = plan_id.to_owned();
        node.node.children_ids = node
            .children
            .iter()
            .map(|c| c.node.id.clone())
            .collect::<Vec<_>>()
            .join(",");
        for child in &mut node.children {
            child.node.parent_id = Some(node.node.id.clone());
            child.node.depth = node.node.depth + 1;
            link(child, plan_id);
        }
    }
    let plan_id = draft.plan.id.clone();
    link(&mut draft.root, &plan_id);

    let mut stack: Vec<&PlanNodeDraft> = vec![&draft.root];
    while let Some(node) = stack.pop() {
        plans::insert_plan_node(store, &node.node).await?;
        if let Some(ref unit) = node.unit {
            debug_assert_eq!(node.node.node_type, NodeType::Leaf);
            let mut unit = unit.clone();
            unit.plan_id = plan_id.clone();
            work_units::insert_work_unit(store, &unit).await?;
        }
        for child in node.children.iter().rev() {
            stack.push(child);
        }
    }

    Ok(())
}

/// Parse planner JSON output into work units.
///
/// Accepts a JSON array (optionally inside markdown fences); resolves
/// `depends_on_indices` into the generated ids, dropping self-references
/// and out-of-range indices. Malformed output yields an empty plan rather
/// than an error.
pub fn parse_plan_output(output: &str, plan_id: &str) -> Vec<WorkUnit> {
    if output.trim().is_empty() {
        return Vec::new();
    }

    let raw_units = match extract_json_array(output) {
        Some(Value::Array(items)) => items,
        _ => return Vec::new(),
    };

    // Ids are allocated upfront so dependency indices can resolve.
    let unit_ids: Vec<String> = raw_units.iter().map(|_| new_id()).collect();

    let mut units = Vec::new();
    for (i, raw) in raw_units.iter().enumerate() {
        let Some(obj) = raw.as_object() else { continue };

        let string_of = |key: &str| -> String {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned()
        };

        let mut dep_ids: Vec<String> = Vec::new();
        if let Some(Value::Array(indices)) = obj.get("depends_on_indices") {
            for idx in indices {
                if let Some(idx) = idx.as_u64() {
                    let idx = idx as usize;
                    if idx < unit_ids.len() && idx != i {
                        dep_ids.push(unit_ids[idx].clone());
                    }
                }
            }
        }

        let mut unit = WorkUnit::new(plan_id, string_of("title"));
        unit.id = unit_ids[i].clone();
        unit.description = string_of("description");
        unit.files_hint = string_of("files_hint");
        unit.verification_hint = string_of("verification_hint");
        unit.acceptance_criteria = string_of("acceptance_criteria");
        unit.priority = obj.get("priority").and_then(Value::as_i64).unwrap_or(1);
        unit.depends_on = dep_ids.join(",");
        units.push(unit);
    }

    units
}

fn extract_json_array(text: &str) -> Option<Value> {
    // Fenced or bare object handling first, then a bare-array scan.
    if let Some(value @ Value::Array(_)) = extract_json(text) {
        return Some(value);
    }
    let start = text.find('[')?;
    let candidate = &text[start..];
    let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value @ Value::Array(_))) => Some(value),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Subprocess planner
// ---------------------------------------------------------------------------

/// Planner backed by the configured LLM CLI.
pub struct SubprocessPlanner {
    config: Arc<MissionConfig>,
}

impl SubprocessPlanner {
    pub fn new(config: Arc<MissionConfig>) -> Self {
        Self { config }
    }

    fn render_prompt(&self, request: &PlanRequest) -> String {
        let discoveries = if request.prior_discoveries.is_empty() {
            "None".to_owned()
        } else {
            request
                .prior_discoveries
                .iter()
                .map(|d| format!("- {d}"))
                .collect::<Vec<_>>()
                .join("\n")
        };
        let feedback = if request.feedback_context.is_empty() {
            "None".to_owned()
        } else {
            request.feedback_context.clone()
        };

        format!(
            "You are a task planner for an autonomous development system.\n\
             \n\
             ## Objective\n{objective}\n\
             \n\
             ## Round\n{round} (integration head {hash})\n\
             \n\
             ## Prior Discoveries\n{discoveries}\n\
             \n\
             ## Feedback\n{feedback}\n\
             \n\
             ## Instructions\n\
             Decompose the objective into independent work units that can be \
             executed in parallel by separate agents. Each work unit should be \
             self-contained and modify a small set of files.\n\
             \n\
             Output a JSON array of work units:\n\
             ```json\n\
             [\n  {{\n    \"title\": \"Short descriptive title\",\n    \
             \"description\": \"Detailed task description with acceptance criteria\",\n    \
             \"files_hint\": \"comma,separated,file,paths\",\n    \
             \"verification_hint\": \"What to verify after this unit\",\n    \
             \"priority\": 1,\n    \"depends_on_indices\": []\n  }}\n]\n\
             ```\n\
             \n\
             Rules:\n\
             - Each unit should touch as few files as possible\n\
             - Use depends_on_indices to reference other units by their array index (0-based)\n\
             - Priority 1 = most important, higher = less important\n\
             - Be specific about which files to modify\n\
             - Include verification criteria for each unit\n",
            objective = request.objective,
            round = request.round_number,
            hash = &request.snapshot_hash[..request.snapshot_hash.len().min(12)],
        )
    }

    async fn run_planner_command(&self, prompt: &str, cwd: &Path) -> Result<String> {
        let scheduler = &self.config.scheduler;
        let mut command = Command::new(&scheduler.worker_program);
        command
            .args(&scheduler.planner_args)
            .arg(prompt)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().context("failed to spawn planner")?;
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let read = async {
            let mut buf = Vec::new();
            if let Some(ref mut pipe) = stdout {
                pipe.read_to_end(&mut buf).await.ok();
            }
            // Drain stderr so a chatty planner cannot block on the pipe.
            let mut sink = Vec::new();
            if let Some(ref mut pipe) = stderr {
                pipe.read_to_end(&mut sink).await.ok();
            }
            buf
        };

        let timeout = Duration::from_secs(scheduler.llm_timeout.max(1));
        match tokio::time::timeout(timeout, async { tokio::join!(child.wait(), read) }).await {
            Ok((status, buf)) => {
                let status = status.context("failed to wait on planner")?;
                if !status.success() {
                    warn!(status = %status, "planner exited non-zero");
                }
                Ok(String::from_utf8_lossy(&buf).into_owned())
            }
            Err(_) => {
                let _ = child.kill().await;
                anyhow::bail!("planner timed out after {}s", timeout.as_secs())
            }
        }
    }
}

#[async_trait]
impl Planner for SubprocessPlanner {
    async fn plan_round(&self, request: &PlanRequest) -> Result<PlanDraft> {
        let prompt = self.render_prompt(request);
        let output = self
            .run_planner_command(&prompt, &self.config.target.path)
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "planner invocation failed, producing empty plan");
                String::new()
            });

        let mut plan = Plan::new(&request.objective);
        plan.raw_planner_output = output.clone();

        let units = parse_plan_output(&output, &plan.id);
        Ok(draft_from_units(plan, units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_array_with_dependencies() {
        let output = r#"Here is the plan:
```json
[
  {"title": "A", "description": "first", "files_hint": "src/a.rs", "priority": 1},
  {"title": "B", "description": "second", "depends_on_indices": [0], "priority": 2},
  {"title": "C", "depends_on_indices": [1, 5, 2]}
]
```
"#;
        let units = parse_plan_output(output, "p1");
        assert_eq!(units.len(), 3);
        assert!(units[0].depends_on.is_empty());
        assert_eq!(units[1].dependency_ids(), vec![units[0].id.clone()]);
        // Out-of-range (5) and self (2) indices are dropped.
        assert_eq!(units[2].dependency_ids(), vec![units[1].id.clone()]);
        assert_eq!(units[1].priority, 2);
    }

    #[test]
    fn parses_bare_array_in_prose() {
        let output = "Sure!\n[{\"title\": \"only\"}]\nDone.";
        let units = parse_plan_output(output, "p1");
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].title, "only");
    }

    #[test]
    fn malformed_output_yields_empty_plan() {
        assert!(parse_plan_output("", "p1").is_empty());
        assert!(parse_plan_output("no json here", "p1").is_empty());
        assert!(parse_plan_output("[{ broken", "p1").is_empty());
    }

    #[test]
    fn non_object_entries_are_skipped() {
        let units = parse_plan_output(r#"[{"title": "ok"}, 42, "nope"]"#, "p1");
        assert_eq!(units.len(), 1);
    }

    #[test]
    fn draft_leaves_carry_exactly_one_unit() {
        let plan = Plan::new("obj");
        let units = vec![WorkUnit::new(&plan.id, "a"), WorkUnit::new(&plan.id, "b")];
        let draft = draft_from_units(plan, units);

        assert_eq!(draft.root.node.node_type, NodeType::Branch);
        assert!(draft.root.unit.is_none());
        assert_eq!(draft.root.children.len(), 2);
        for leaf in &draft.root.children {
            assert_eq!(leaf.node.node_type, NodeType::Leaf);
            assert!(leaf.unit.is_some());
            assert_eq!(
                leaf.node.work_unit_id.as_deref(),
                leaf.unit.as_ref().map(|u| u.id.as_str())
            );
        }
    }
}
