//! `mc discover` / `mc history` / `mc intel` -- read-only reports.

use std::path::Path;

use anyhow::Result;

use mc_core::verify::{VerificationRunner, snapshot_from_report};
use mc_db::queries::{handoffs, missions, rounds, snapshots};

use crate::setup;

/// Run verification against the target and record a health snapshot.
pub async fn discover(config_path: &Path, db_path: &Path) -> Result<bool> {
    let config = setup::load_config(config_path)?;
    let store = setup::open_store(db_path).await?;

    let runner = VerificationRunner::new(config.target.verification.clone());
    let report = runner.run(&config.target.path).await?;
    let snapshot = snapshot_from_report(&report);
    snapshots::insert_snapshot(&store, &snapshot).await?;

    println!(
        "tests: {}/{} passing ({} failed)",
        snapshot.test_passed, snapshot.test_total, snapshot.test_failed
    );
    println!("lint errors: {}", snapshot.lint_errors);
    println!("type errors: {}", snapshot.type_errors);
    println!("security findings: {}", snapshot.security_findings);

    Ok(report.overall_passed())
}

/// Show recent missions and their rounds.
pub async fn history(db_path: &Path) -> Result<bool> {
    let store = setup::open_store(db_path).await?;

    let recent = missions::recent_missions(&store, 10).await?;
    if recent.is_empty() {
        println!("no missions recorded");
        return Ok(true);
    }

    for mission in recent {
        println!(
            "{} [{}] {} (score {:.3}, {} rounds{})",
            mission.id,
            mission.status,
            mission.objective,
            mission.final_score,
            mission.total_rounds,
            if mission.stopped_reason.is_empty() {
                String::new()
            } else {
                format!(", {}", mission.stopped_reason)
            },
        );
        for round in rounds::rounds_for_mission(&store, &mission.id).await? {
            println!(
                "  round {} [{}] score {:.3} units {}/{} ({} failed)",
                round.number,
                round.status,
                round.objective_score,
                round.completed_units,
                round.total_units,
                round.failed_units,
            );
        }
    }

    Ok(true)
}

/// Show discoveries and concerns from recent workers.
pub async fn intel(db_path: &Path) -> Result<bool> {
    let store = setup::open_store(db_path).await?;

    let recent = missions::recent_missions(&store, 5).await?;
    let mut any = false;
    for mission in recent {
        let handoffs = handoffs::recent_handoffs(&store, &mission.id, 20).await?;
        for handoff in handoffs {
            for discovery in &handoff.discoveries {
                println!("[discovery] {discovery}");
                any = true;
            }
            for concern in &handoff.concerns {
                println!("[concern] {concern}");
                any = true;
            }
        }
    }
    if !any {
        println!("no worker intel recorded");
    }

    Ok(true)
}
