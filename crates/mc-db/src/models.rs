use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Generate a short hex id (12 chars of a v4 UUID).
pub fn new_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    hex[..12].to_owned()
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Running,
    Completed,
    Stopped,
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for MissionStatus {
    type Err = MissionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "stopped" => Ok(Self::Stopped),
            other => Err(MissionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MissionStatus`] string.
#[derive(Debug, Clone)]
pub struct MissionStatusParseError(pub String);

impl fmt::Display for MissionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid mission status: {:?}", self.0)
    }
}

impl std::error::Error for MissionStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a round within a mission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Planning,
    Executing,
    Evaluating,
    Completed,
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for RoundStatus {
    type Err = RoundStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "planning" => Ok(Self::Planning),
            "executing" => Ok(Self::Executing),
            "evaluating" => Ok(Self::Evaluating),
            "completed" => Ok(Self::Completed),
            other => Err(RoundStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`RoundStatus`] string.
#[derive(Debug, Clone)]
pub struct RoundStatusParseError(pub String);

impl fmt::Display for RoundStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid round status: {:?}", self.0)
    }
}

impl std::error::Error for RoundStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PlanStatus {
    type Err = PlanStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(PlanStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`PlanStatus`] string.
#[derive(Debug, Clone)]
pub struct PlanStatusParseError(pub String);

impl fmt::Display for PlanStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid plan status: {:?}", self.0)
    }
}

impl std::error::Error for PlanStatusParseError {}

// ---------------------------------------------------------------------------

/// Kind of node in the plan decomposition tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Branch,
    Leaf,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Branch => "branch",
            Self::Leaf => "leaf",
        })
    }
}

impl FromStr for NodeType {
    type Err = NodeTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "branch" => Ok(Self::Branch),
            "leaf" => Ok(Self::Leaf),
            other => Err(NodeTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeType`] string.
#[derive(Debug, Clone)]
pub struct NodeTypeParseError(pub String);

impl fmt::Display for NodeTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node type: {:?}", self.0)
    }
}

impl std::error::Error for NodeTypeParseError {}

/// Decomposition strategy chosen for a plan node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NodeStrategy {
    Leaves,
    Subdivide,
}

impl fmt::Display for NodeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Leaves => "leaves",
            Self::Subdivide => "subdivide",
        })
    }
}

impl FromStr for NodeStrategy {
    type Err = NodeStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "leaves" => Ok(Self::Leaves),
            "subdivide" => Ok(Self::Subdivide),
            other => Err(NodeStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`NodeStrategy`] string.
#[derive(Debug, Clone)]
pub struct NodeStrategyParseError(pub String);

impl fmt::Display for NodeStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid node strategy: {:?}", self.0)
    }
}

impl std::error::Error for NodeStrategyParseError {}

// ---------------------------------------------------------------------------

/// Status of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    Claimed,
    Running,
    Completed,
    Failed,
    Blocked,
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        };
        f.write_str(s)
    }
}

impl FromStr for UnitStatus {
    type Err = UnitStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            other => Err(UnitStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`UnitStatus`] string.
#[derive(Debug, Clone)]
pub struct UnitStatusParseError(pub String);

impl fmt::Display for UnitStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid unit status: {:?}", self.0)
    }
}

impl std::error::Error for UnitStatusParseError {}

// ---------------------------------------------------------------------------

/// Type of an append-only unit event.
///
/// `DegradationTransition` and `ExperimentCompleted` have no emitters in the
/// core; they exist so external extensions share the same closed vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitEventType {
    Dispatched,
    Claimed,
    Running,
    Completed,
    Failed,
    Merged,
    MergeFailed,
    Rejected,
    RetryQueued,
    ResearchCompleted,
    ExperimentCompleted,
    DegradationTransition,
}

impl UnitEventType {
    /// The unit status implied by this event, per the derivation table.
    ///
    /// `DegradationTransition` carries no status and returns `None`.
    pub fn implied_status(self) -> Option<UnitStatus> {
        match self {
            Self::Dispatched | Self::RetryQueued => Some(UnitStatus::Pending),
            Self::Claimed => Some(UnitStatus::Claimed),
            Self::Running => Some(UnitStatus::Running),
            Self::Completed
            | Self::Merged
            | Self::ResearchCompleted
            | Self::ExperimentCompleted => Some(UnitStatus::Completed),
            Self::Failed | Self::MergeFailed | Self::Rejected => Some(UnitStatus::Failed),
            Self::DegradationTransition => None,
        }
    }
}

impl fmt::Display for UnitEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dispatched => "dispatched",
            Self::Claimed => "claimed",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Merged => "merged",
            Self::MergeFailed => "merge_failed",
            Self::Rejected => "rejected",
            Self::RetryQueued => "retry_queued",
            Self::ResearchCompleted => "research_completed",
            Self::ExperimentCompleted => "experiment_completed",
            Self::DegradationTransition => "degradation_transition",
        };
        f.write_str(s)
    }
}

impl FromStr for UnitEventType {
    type Err = UnitEventTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dispatched" => Ok(Self::Dispatched),
            "claimed" => Ok(Self::Claimed),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "merged" => Ok(Self::Merged),
            "merge_failed" => Ok(Self::MergeFailed),
            "rejected" => Ok(Self::Rejected),
            "retry_queued" => Ok(Self::RetryQueued),
            "research_completed" => Ok(Self::ResearchCompleted),
            "experiment_completed" => Ok(Self::ExperimentCompleted),
            "degradation_transition" => Ok(Self::DegradationTransition),
            other => Err(UnitEventTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`UnitEventType`] string.
#[derive(Debug, Clone)]
pub struct UnitEventTypeParseError(pub String);

impl fmt::Display for UnitEventTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid unit event type: {:?}", self.0)
    }
}

impl std::error::Error for UnitEventTypeParseError {}

// ---------------------------------------------------------------------------

/// Type of an out-of-band control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SignalType {
    Stop,
    RetryUnit,
    Adjust,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stop => "stop",
            Self::RetryUnit => "retry_unit",
            Self::Adjust => "adjust",
        })
    }
}

impl FromStr for SignalType {
    type Err = SignalTypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stop" => Ok(Self::Stop),
            "retry_unit" => Ok(Self::RetryUnit),
            "adjust" => Ok(Self::Adjust),
            other => Err(SignalTypeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SignalType`] string.
#[derive(Debug, Clone)]
pub struct SignalTypeParseError(pub String);

impl fmt::Display for SignalTypeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid signal type: {:?}", self.0)
    }
}

impl std::error::Error for SignalTypeParseError {}

/// Lifecycle status of a signal row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SignalStatus {
    Pending,
    Acknowledged,
    Expired,
}

impl fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Acknowledged => "acknowledged",
            Self::Expired => "expired",
        })
    }
}

impl FromStr for SignalStatus {
    type Err = SignalStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "acknowledged" => Ok(Self::Acknowledged),
            "expired" => Ok(Self::Expired),
            other => Err(SignalStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`SignalStatus`] string.
#[derive(Debug, Clone)]
pub struct SignalStatusParseError(pub String);

impl fmt::Display for SignalStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid signal status: {:?}", self.0)
    }
}

impl std::error::Error for SignalStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a merge request on the serialized merge queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Verifying,
    Merged,
    Rejected,
    Conflict,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Merged => "merged",
            Self::Rejected => "rejected",
            Self::Conflict => "conflict",
        };
        f.write_str(s)
    }
}

impl FromStr for MergeStatus {
    type Err = MergeStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "verifying" => Ok(Self::Verifying),
            "merged" => Ok(Self::Merged),
            "rejected" => Ok(Self::Rejected),
            "conflict" => Ok(Self::Conflict),
            other => Err(MergeStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`MergeStatus`] string.
#[derive(Debug, Clone)]
pub struct MergeStatusParseError(pub String);

impl fmt::Display for MergeStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid merge status: {:?}", self.0)
    }
}

impl std::error::Error for MergeStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a worker row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Dead,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Dead => "dead",
        })
    }
}

impl FromStr for WorkerStatus {
    type Err = WorkerStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "dead" => Ok(Self::Dead),
            other => Err(WorkerStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`WorkerStatus`] string.
#[derive(Debug, Clone)]
pub struct WorkerStatusParseError(pub String);

impl fmt::Display for WorkerStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid worker status: {:?}", self.0)
    }
}

impl std::error::Error for WorkerStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A mission -- one process-wide job driving rounds until a stop condition.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Mission {
    pub id: String,
    pub objective: String,
    pub status: MissionStatus,
    pub total_rounds: i64,
    pub final_score: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stopped_reason: String,
}

impl Mission {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            objective: objective.into(),
            status: MissionStatus::Running,
            total_rounds: 0,
            final_score: 0.0,
            started_at: Utc::now(),
            finished_at: None,
            stopped_reason: String::new(),
        }
    }
}

/// One plan-execute-evaluate iteration of a mission.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Round {
    pub id: String,
    pub mission_id: String,
    pub number: i64,
    pub status: RoundStatus,
    pub plan_id: Option<String>,
    pub snapshot_hash: String,
    pub objective_score: f64,
    pub objective_met: bool,
    pub total_units: i64,
    pub completed_units: i64,
    pub failed_units: i64,
    pub discoveries: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Round {
    pub fn new(mission_id: impl Into<String>, number: i64) -> Self {
        Self {
            id: new_id(),
            mission_id: mission_id.into(),
            number,
            status: RoundStatus::Planning,
            plan_id: None,
            snapshot_hash: String::new(),
            objective_score: 0.0,
            objective_met: false,
            total_units: 0,
            completed_units: 0,
            failed_units: 0,
            discoveries: "[]".to_owned(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// A decomposed objective: the flat-unit view of one planning pass.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: String,
    pub round_id: Option<String>,
    pub objective: String,
    pub status: PlanStatus,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub raw_planner_output: String,
    pub total_units: i64,
    pub completed_units: i64,
    pub failed_units: i64,
}

impl Plan {
    pub fn new(objective: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            round_id: None,
            objective: objective.into(),
            status: PlanStatus::Pending,
            created_at: Utc::now(),
            finished_at: None,
            raw_planner_output: String::new(),
            total_units: 0,
            completed_units: 0,
            failed_units: 0,
        }
    }
}

/// A node in the plan decomposition tree. Leaves carry exactly one work
/// unit; branches carry none.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PlanNode {
    pub id: String,
    pub plan_id: String,
    pub parent_id: Option<String>,
    pub depth: i64,
    pub scope: String,
    pub node_type: NodeType,
    pub strategy: NodeStrategy,
    pub status: String,
    pub children_ids: String,
    pub work_unit_id: Option<String>,
}

impl PlanNode {
    pub fn new(plan_id: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            id: new_id(),
            plan_id: plan_id.into(),
            parent_id: None,
            depth: 0,
            scope: String::new(),
            node_type,
            strategy: NodeStrategy::Leaves,
            status: "pending".to_owned(),
            children_ids: String::new(),
            work_unit_id: None,
        }
    }
}

/// An atomic task for one worker: one branch, zero or more commits, one
/// handoff.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkUnit {
    pub id: String,
    pub plan_id: String,
    pub plan_node_id: Option<String>,
    /// Epoch binding: the round this unit executes under. Events for a
    /// unit with no round binding are silently skipped.
    pub round_id: Option<String>,
    pub title: String,
    pub description: String,
    pub files_hint: String,
    pub verification_hint: String,
    pub acceptance_criteria: String,
    pub priority: i64,
    pub status: UnitStatus,
    pub worker_id: Option<String>,
    pub depends_on: String,
    pub branch_name: String,
    pub claimed_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i64>,
    pub commit_hash: Option<String>,
    pub output_summary: String,
    pub attempt: i64,
    pub max_attempts: i64,
    /// Per-unit timeout override in seconds; falls back to the global
    /// session timeout when unset.
    pub timeout: Option<i64>,
    pub cost_usd: f64,
    pub handoff_id: Option<String>,
}

impl WorkUnit {
    pub fn new(plan_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            plan_id: plan_id.into(),
            plan_node_id: None,
            round_id: None,
            title: title.into(),
            description: String::new(),
            files_hint: String::new(),
            verification_hint: String::new(),
            acceptance_criteria: String::new(),
            priority: 1,
            status: UnitStatus::Pending,
            worker_id: None,
            depends_on: String::new(),
            branch_name: String::new(),
            claimed_at: None,
            heartbeat_at: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            commit_hash: None,
            output_summary: String::new(),
            attempt: 0,
            max_attempts: 3,
            timeout: None,
            cost_usd: 0.0,
            handoff_id: None,
        }
    }

    /// Parse the CSV `depends_on` column into trimmed, non-empty ids.
    pub fn dependency_ids(&self) -> Vec<String> {
        self.depends_on
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Parse the CSV `files_hint` column into trimmed, non-empty paths.
    pub fn hinted_files(&self) -> Vec<String> {
        self.files_hint
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

/// A worker's structured terminal report.
///
/// List fields are stored as JSON text and round-trip exactly through
/// persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub work_unit_id: String,
    pub round_id: Option<String>,
    pub status: String,
    pub summary: String,
    pub commits: Vec<String>,
    pub discoveries: Vec<String>,
    pub concerns: Vec<String>,
    pub files_changed: Vec<String>,
}

impl Handoff {
    pub fn new(work_unit_id: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            work_unit_id: work_unit_id.into(),
            round_id: None,
            status: String::new(),
            summary: String::new(),
            commits: Vec::new(),
            discoveries: Vec::new(),
            concerns: Vec::new(),
            files_changed: Vec::new(),
        }
    }
}

/// One append-only event in a work unit's history.
///
/// `event_type` stays a raw string on the row so that unknown types written
/// by newer versions are skipped during replay instead of failing decode.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UnitEvent {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub mission_id: String,
    pub round_id: Option<String>,
    pub work_unit_id: String,
    pub event_type: String,
    pub details: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

impl UnitEvent {
    /// The typed event, or `None` for unknown strings.
    pub fn kind(&self) -> Option<UnitEventType> {
        self.event_type.parse().ok()
    }
}

/// An out-of-band control-plane command, scoped to one mission.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Signal {
    pub id: String,
    pub mission_id: String,
    pub signal_type: SignalType,
    pub payload: String,
    pub status: SignalStatus,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    pub fn new(
        mission_id: impl Into<String>,
        signal_type: SignalType,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            mission_id: mission_id.into(),
            signal_type,
            payload: payload.into(),
            status: SignalStatus::Pending,
            created_at: Utc::now(),
        }
    }
}

/// A parallel worker agent and its workspace.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Worker {
    pub id: String,
    pub workspace_path: String,
    pub status: WorkerStatus,
    pub current_unit_id: Option<String>,
    pub pid: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub units_completed: i64,
    pub units_failed: i64,
    pub total_cost_usd: f64,
}

impl Worker {
    pub fn new(workspace_path: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            workspace_path: workspace_path.into(),
            status: WorkerStatus::Idle,
            current_unit_id: None,
            pid: None,
            started_at: Utc::now(),
            last_heartbeat: Utc::now(),
            units_completed: 0,
            units_failed: 0,
            total_cost_usd: 0.0,
        }
    }
}

/// A request to merge a completed unit branch; `position` is the total
/// merge order assigned by the green-branch lock.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MergeRequest {
    pub id: String,
    pub work_unit_id: String,
    pub worker_id: String,
    pub branch_name: String,
    pub commit_hash: String,
    pub status: MergeStatus,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
    pub merged_at: Option<DateTime<Utc>>,
    pub rejection_reason: String,
    pub rebase_attempts: i64,
}

impl MergeRequest {
    pub fn new(work_unit_id: impl Into<String>, branch_name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            work_unit_id: work_unit_id.into(),
            worker_id: String::new(),
            branch_name: branch_name.into(),
            commit_hash: String::new(),
            status: MergeStatus::Pending,
            position: 0,
            created_at: Utc::now(),
            verified_at: None,
            merged_at: None,
            rejection_reason: String::new(),
            rebase_attempts: 0,
        }
    }
}

/// Project health snapshot at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Snapshot {
    pub id: String,
    pub round_id: Option<String>,
    pub taken_at: DateTime<Utc>,
    pub test_total: i64,
    pub test_passed: i64,
    pub test_failed: i64,
    pub lint_errors: i64,
    pub type_errors: i64,
    pub security_findings: i64,
    pub raw_output: String,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            id: new_id(),
            round_id: None,
            taken_at: Utc::now(),
            test_total: 0,
            test_passed: 0,
            test_failed: 0,
            lint_errors: 0,
            type_errors: 0,
            security_findings: 0,
            raw_output: String::new(),
        }
    }
}

/// Difference between two snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SnapshotDelta {
    pub tests_added: i64,
    pub tests_fixed: i64,
    pub tests_broken: i64,
    pub lint_delta: i64,
    pub type_delta: i64,
    pub security_delta: i64,
}

impl SnapshotDelta {
    pub fn improved(&self) -> bool {
        (self.tests_fixed > 0
            || self.lint_delta < 0
            || self.type_delta < 0
            || self.security_delta < 0)
            && self.tests_broken == 0
            && self.security_delta <= 0
    }

    pub fn regressed(&self) -> bool {
        self.tests_broken > 0 || self.security_delta > 0
    }
}

/// Compare two snapshots to determine what changed.
pub fn compare_snapshots(before: &Snapshot, after: &Snapshot) -> SnapshotDelta {
    SnapshotDelta {
        tests_added: after.test_total - before.test_total,
        tests_fixed: (after.test_passed - before.test_passed).max(0),
        tests_broken: (after.test_failed - before.test_failed).max(0),
        lint_delta: after.lint_errors - before.lint_errors,
        type_delta: after.type_errors - before.type_errors,
        security_delta: after.security_findings - before.security_findings,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
