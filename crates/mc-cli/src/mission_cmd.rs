//! `mc start` / `mc mission` -- run missions to completion.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::setup;

pub async fn run(
    config_path: &Path,
    db_path: &Path,
    chain: bool,
    max_chain_depth: u32,
) -> Result<bool> {
    let config = setup::load_config(config_path)?;
    let store = setup::open_store(db_path).await?;
    let components = setup::build_components(config, store, db_path).await?;

    let depth = if chain { max_chain_depth.max(1) } else { 1 };
    let mut objective_met = false;

    for attempt in 1..=depth {
        let controller = Arc::new(setup::build_controller(&components));

        // Ctrl-C requests a stop; the dispatcher notices on its next poll.
        let stopper = Arc::clone(&controller);
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping mission");
                stopper.stop();
            }
        });

        let result = controller.run().await;
        ctrl_c.abort();

        println!(
            "mission {} finished: reason={} score={:.3} rounds={} cost=${:.2}",
            result.mission_id,
            result.stopped_reason,
            result.final_score,
            result.total_rounds,
            result.total_cost_usd,
        );

        if result.objective_met {
            objective_met = true;
            break;
        }
        if result.stopped_reason != "max_rounds" && result.stopped_reason != "stalled" {
            // Only exhausted or stalled missions are worth chaining.
            break;
        }
        if attempt < depth {
            info!(attempt = attempt + 1, "chaining follow-up mission");
        }
    }

    Ok(objective_met)
}
