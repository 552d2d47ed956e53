//! Deterministic objective evaluation at round end.

use mc_db::models::{Snapshot, compare_snapshots};

/// Scoring weights: test health, lint/type health, unit completion rate,
/// regression-free.
pub const EVALUATOR_WEIGHTS: (f64, f64, f64, f64) = (0.4, 0.2, 0.2, 0.2);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub score: f64,
    pub met: bool,
}

/// Score a round from its before/after snapshots, unit counts, fixup
/// outcome, and the previous round's score.
///
/// The objective is met iff the round's work was promoted to green, the
/// after-snapshot is fully healthy (no failing tests, no lint or type
/// errors), and every planned unit completed. A round that promoted
/// nothing cannot score above the previous round.
pub fn evaluate_objective(
    before: Option<&Snapshot>,
    after: Option<&Snapshot>,
    completed_units: i64,
    total_units: i64,
    fixup_promoted: bool,
    prev_score: f64,
) -> Evaluation {
    let (w_test, w_lint, w_completion, w_regress) = EVALUATOR_WEIGHTS;

    let completion = if total_units == 0 {
        1.0
    } else {
        completed_units as f64 / total_units as f64
    };

    let test_score = after
        .map(|a| {
            if a.test_total > 0 {
                a.test_passed as f64 / a.test_total as f64
            } else if a.test_failed == 0 {
                1.0
            } else {
                0.0
            }
        })
        .unwrap_or(0.0);

    let lint_score = after
        .map(|a| {
            if a.lint_errors == 0 && a.type_errors == 0 {
                1.0
            } else {
                match before {
                    Some(b) if a.lint_errors + a.type_errors < b.lint_errors + b.type_errors => {
                        0.5
                    }
                    _ => 0.0,
                }
            }
        })
        .unwrap_or(0.0);

    let regression_free = match (before, after) {
        (Some(b), Some(a)) => !compare_snapshots(b, a).regressed(),
        (None, Some(_)) => true,
        _ => false,
    };

    let mut score = w_test * test_score
        + w_lint * lint_score
        + w_completion * completion
        + w_regress * if regression_free { 1.0 } else { 0.0 };
    score = score.clamp(0.0, 1.0);

    if !fixup_promoted {
        score = score.min(prev_score);
    }

    let met = fixup_promoted
        && total_units > 0
        && completed_units == total_units
        && after
            .map(|a| a.test_failed == 0 && a.lint_errors == 0 && a.type_errors == 0)
            .unwrap_or(false);

    Evaluation { score, met }
}

/// Keep discoveries in insertion order until the character budget is hit.
pub fn curate_discoveries(discoveries: &[String], max_chars: usize) -> Vec<String> {
    let mut result = Vec::new();
    let mut total = 0;
    for discovery in discoveries {
        if total + discovery.len() > max_chars {
            break;
        }
        total += discovery.len();
        result.push(discovery.clone());
    }
    result
}
