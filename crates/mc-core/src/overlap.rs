//! Plan-time file-overlap resolution.
//!
//! Two units whose file hints overlap cannot safely run concurrently, so a
//! synthetic dependency edge forces the later one to wait for the earlier.

use tracing::info;

use crate::lockreg::paths_overlap;
use mc_db::models::WorkUnit;

fn hints_overlap(a: &WorkUnit, b: &WorkUnit) -> bool {
    let a_files = a.hinted_files();
    let b_files = b.hinted_files();
    a_files
        .iter()
        .any(|fa| b_files.iter().any(|fb| paths_overlap(fa, fb)))
}

/// Inject dependency edges between units with overlapping file hints.
///
/// Order is deterministic: within the given slice order, the later unit
/// gains a dependency on the earlier one. Pairs already ordered by an
/// existing edge (either direction) are left alone.
pub fn resolve_file_overlaps(units: &mut [WorkUnit]) {
    for i in 0..units.len() {
        for j in (i + 1)..units.len() {
            if !hints_overlap(&units[i], &units[j]) {
                continue;
            }

            let earlier_id = units[i].id.clone();
            let later = &units[j];
            if later.dependency_ids().contains(&earlier_id)
                || units[i].dependency_ids().contains(&later.id)
            {
                continue;
            }

            info!(
                earlier = %earlier_id,
                later = %units[j].id,
                "file overlap detected, serializing units"
            );
            let later = &mut units[j];
            if later.depends_on.trim().is_empty() {
                later.depends_on = earlier_id;
            } else {
                later.depends_on = format!("{},{}", later.depends_on, earlier_id);
            }
        }
    }
}
