//! Mission configuration types.
//!
//! Loading is the CLI's concern; the core only defines the deserializable
//! shape and its defaults.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for one mission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionConfig {
    pub target: TargetConfig,
    pub scheduler: SchedulerConfig,
    pub rounds: RoundsConfig,
    pub green_branch: GreenBranchConfig,
    pub env: EnvConfig,
}

/// The repository being worked on and how to verify it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
    pub objective: String,
    pub verification: VerificationConfig,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: PathBuf::from("."),
            branch: "main".to_owned(),
            objective: String::new(),
            verification: VerificationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Combined fallback command, used when no nodes are configured.
    pub command: String,
    /// Timeout in seconds for the fallback command.
    pub timeout: u64,
    /// Optional one-time workspace setup command (e.g. dependency install).
    pub setup_command: String,
    pub setup_timeout: u64,
    pub nodes: Vec<VerificationNodeConfig>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            timeout: 300,
            setup_command: String::new(),
            setup_timeout: 600,
            nodes: Vec::new(),
        }
    }
}

/// One node in the verification DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationNodeConfig {
    /// Parser kind: test, lint, type, security, or custom.
    pub kind: String,
    pub command: String,
    pub timeout: u64,
    /// Required nodes run sequentially and gate the report; optional nodes
    /// run concurrently afterwards.
    pub required: bool,
    pub weight: f64,
}

impl Default for VerificationNodeConfig {
    fn default() -> Self {
        Self {
            kind: "custom".to_owned(),
            command: String::new(),
            timeout: 300,
            required: true,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Worker subprocess program, invoked in argv form.
    pub worker_program: String,
    /// Arguments placed before the rendered prompt.
    pub worker_args: Vec<String>,
    /// Arguments for planning invocations of the same program.
    pub planner_args: Vec<String>,
    pub model: String,
    /// Wall-time budget per worker session, in seconds.
    pub session_timeout: u64,
    /// Poll interval while a worker runs, in seconds.
    pub monitor_interval: u64,
    /// Timeout for fixup LLM sessions, in seconds.
    pub llm_timeout: u64,
    /// Tail length kept as a unit's output summary when no result marker
    /// is present.
    pub output_summary_max_chars: usize,
    /// Cap on retained child stdout, in bytes (tail kept).
    pub max_output_bytes: usize,
    pub parallel: ParallelConfig,
    pub pricing: PricingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_program: "claude".to_owned(),
            worker_args: vec![
                "-p".to_owned(),
                "--output-format".to_owned(),
                "text".to_owned(),
                "--permission-mode".to_owned(),
                "bypassPermissions".to_owned(),
            ],
            planner_args: vec![
                "-p".to_owned(),
                "--output-format".to_owned(),
                "text".to_owned(),
            ],
            model: String::new(),
            session_timeout: 2700,
            monitor_interval: 5,
            llm_timeout: 300,
            output_summary_max_chars: 500,
            max_output_bytes: 50 * 1024 * 1024,
            parallel: ParallelConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub num_workers: usize,
    /// Clones created eagerly at pool initialization.
    pub warm_clones: usize,
    pub pool_dir: Option<PathBuf>,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            warm_clones: 0,
            pool_dir: None,
        }
    }
}

/// Per-million token rates for cost accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_per_million: 3.0,
            output_per_million: 15.0,
            cache_write_per_million: 3.75,
            cache_read_per_million: 0.30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundsConfig {
    pub max_rounds: i64,
    /// Seconds to sleep between rounds.
    pub cooldown_between_rounds: u64,
    /// Number of recent round scores examined for stall detection.
    pub stall_threshold: usize,
    /// Score band below which the recent rounds count as stalled.
    pub stall_score_epsilon: f64,
    /// Character budget for discoveries forwarded to the next planner call.
    pub max_discovery_chars: usize,
    pub max_discoveries_per_round: usize,
    /// Polling slack multiplier applied to the per-unit timeout.
    pub timeout_multiplier: f64,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            max_rounds: 20,
            cooldown_between_rounds: 0,
            stall_threshold: 3,
            stall_score_epsilon: 0.01,
            max_discovery_chars: 4000,
            max_discoveries_per_round: 20,
            timeout_multiplier: 1.2,
        }
    }
}

/// Which integration path completed units take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// Light path: merge unit branches into the working branch; the round
    /// controller promotes working to green at round end.
    Working,
    /// Serialized path: every unit branch goes through the full verified
    /// merge onto the green branch.
    Green,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GreenBranchConfig {
    pub working_branch: String,
    pub green_branch: String,
    /// Branch mc/green is merged into when pushing upstream.
    pub push_branch: String,
    pub auto_push: bool,
    /// Merges accumulated before an upstream push.
    pub push_batch_size: usize,
    /// Reset both branches to the base branch HEAD at initialization.
    pub reset_on_init: bool,
    /// Number of parallel fixup candidates.
    pub fixup_candidates: usize,
    pub verify_before_merge: bool,
    pub merge_policy: MergePolicy,
}

impl Default for GreenBranchConfig {
    fn default() -> Self {
        Self {
            working_branch: "mc/working".to_owned(),
            green_branch: "mc/green".to_owned(),
            push_branch: "main".to_owned(),
            auto_push: false,
            push_batch_size: 5,
            reset_on_init: true,
            fixup_candidates: 3,
            verify_before_merge: true,
            merge_policy: MergePolicy::Working,
        }
    }
}

/// Environment forwarding policy for worker subprocesses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    /// Extra environment variable names forwarded to workers. Names that
    /// look secret-bearing are always blocked regardless of this list.
    pub extra_env: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = MissionConfig::default();
        assert_eq!(config.rounds.max_rounds, 20);
        assert_eq!(config.green_branch.green_branch, "mc/green");
        assert_eq!(config.green_branch.merge_policy, MergePolicy::Working);
        assert_eq!(config.scheduler.session_timeout, 2700);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: MissionConfig = toml::from_str(
            r#"
            [target]
            name = "demo"
            objective = "make tests pass"

            [rounds]
            max_rounds = 5
            "#,
        )
        .expect("should deserialize");

        assert_eq!(config.target.name, "demo");
        assert_eq!(config.rounds.max_rounds, 5);
        assert_eq!(config.rounds.stall_threshold, 3);
        assert_eq!(config.scheduler.parallel.num_workers, 3);
    }
}
