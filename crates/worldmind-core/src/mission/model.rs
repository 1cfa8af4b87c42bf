use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a mission, monotone along the planning-to-execution pipeline.
///
/// `Failed` absorbs from any state; no transition leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissionStatus {
    Created,
    Classifying,
    Uploading,
    Clarifying,
    Specifying,
    Planning,
    AwaitingApproval,
    Executing,
    Completed,
    Failed,
}

impl MissionStatus {
    /// Position of this status along the monotone pipeline.
    ///
    /// `Failed` has no rank; it is absorbing and checked separately.
    pub fn rank(self) -> Option<u8> {
        match self {
            Self::Created => Some(0),
            Self::Classifying => Some(1),
            Self::Uploading => Some(2),
            Self::Clarifying => Some(3),
            Self::Specifying => Some(4),
            Self::Planning => Some(5),
            Self::AwaitingApproval => Some(6),
            Self::Executing => Some(7),
            Self::Completed => Some(8),
            Self::Failed => None,
        }
    }

    /// Whether a transition from `self` to `to` respects the status DAG.
    ///
    /// Forward moves along the pipeline are allowed (skipping intermediate
    /// states is legal: `clarify` jumps straight to `Specifying` when the
    /// answers are already present), `Failed` absorbs from anywhere, and a
    /// self-transition is a no-op.
    pub fn can_transition_to(self, to: MissionStatus) -> bool {
        if self == to || to == Self::Failed {
            return true;
        }
        match (self.rank(), to.rank()) {
            (Some(from), Some(to)) => from < to,
            // Nothing leaves Failed.
            (None, _) => false,
            (_, None) => unreachable!("Failed handled above"),
        }
    }

    /// Whether the mission has reached a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Classifying => "CLASSIFYING",
            Self::Uploading => "UPLOADING",
            Self::Clarifying => "CLARIFYING",
            Self::Specifying => "SPECIFYING",
            Self::Planning => "PLANNING",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Executing => "EXECUTING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for MissionStatus {
    type Err = MissionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATED" => Ok(Self::Created),
            "CLASSIFYING" => Ok(Self::Classifying),
            "UPLOADING" => Ok(Self::Uploading),
            "CLARIFYING" => Ok(Self::Clarifying),
            "SPECIFYING" => Ok(Self::Specifying),
            "PLANNING" => Ok(Self::Planning),
            "AWAITING_APPROVAL" => Ok(Self::AwaitingApproval),
            "EXECUTING" => Ok(Self::Executing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
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

/// Status of a single task attempt.
///
/// Monotone within one attempt: `Pending -> Executing -> {Passed, Failed,
/// Verifying}`. Resettable across attempts (a retried task goes back to
/// `Pending`). `Verifying` is only reached by coder and refactorer tasks
/// that still owe a quality-gate pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Executing,
    Passed,
    Failed,
    Verifying,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Executing => "EXECUTING",
            Self::Passed => "PASSED",
            Self::Failed => "FAILED",
            Self::Verifying => "VERIFYING",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "EXECUTING" => Ok(Self::Executing),
            "PASSED" => Ok(Self::Passed),
            "FAILED" => Ok(Self::Failed),
            "VERIFYING" => Ok(Self::Verifying),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// The agent role executed inside a sandbox for one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentKind {
    Coder,
    Tester,
    Reviewer,
    Refactorer,
    Researcher,
    Deployer,
}

impl AgentKind {
    /// Whether results from this agent must pass the quality gate before the
    /// task is counted complete.
    pub fn requires_quality_gate(self) -> bool {
        matches!(self, Self::Coder | Self::Refactorer)
    }

    /// Whether an empty file-change set from this agent means the attempt
    /// did no real work and must be treated as failed.
    pub fn requires_file_changes(self) -> bool {
        matches!(self, Self::Coder | Self::Refactorer)
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Coder => "CODER",
            Self::Tester => "TESTER",
            Self::Reviewer => "REVIEWER",
            Self::Refactorer => "REFACTORER",
            Self::Researcher => "RESEARCHER",
            Self::Deployer => "DEPLOYER",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentKind {
    type Err = AgentKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CODER" => Ok(Self::Coder),
            "TESTER" => Ok(Self::Tester),
            "REVIEWER" => Ok(Self::Reviewer),
            "REFACTORER" => Ok(Self::Refactorer),
            "RESEARCHER" => Ok(Self::Researcher),
            "DEPLOYER" => Ok(Self::Deployer),
            other => Err(AgentKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AgentKind`] string.
#[derive(Debug, Clone)]
pub struct AgentKindParseError(pub String);

impl fmt::Display for AgentKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid agent kind: {:?}", self.0)
    }
}

impl std::error::Error for AgentKindParseError {}

// ---------------------------------------------------------------------------

/// What to do when a task fails its attempt or its quality gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    Retry,
    Skip,
    Escalate,
    Replan,
}

impl fmt::Display for FailureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Retry => "RETRY",
            Self::Skip => "SKIP",
            Self::Escalate => "ESCALATE",
            Self::Replan => "REPLAN",
        };
        f.write_str(s)
    }
}

impl FromStr for FailureStrategy {
    type Err = FailureStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RETRY" => Ok(Self::Retry),
            "SKIP" => Ok(Self::Skip),
            "ESCALATE" => Ok(Self::Escalate),
            "REPLAN" => Ok(Self::Replan),
            other => Err(FailureStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FailureStrategy`] string.
#[derive(Debug, Clone)]
pub struct FailureStrategyParseError(pub String);

impl fmt::Display for FailureStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid failure strategy: {:?}", self.0)
    }
}

impl std::error::Error for FailureStrategyParseError {}

// ---------------------------------------------------------------------------

/// How the scheduler picks waves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStrategy {
    Sequential,
    Parallel,
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Sequential => "SEQUENTIAL",
            Self::Parallel => "PARALLEL",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStrategy {
    type Err = ExecutionStrategyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SEQUENTIAL" => Ok(Self::Sequential),
            "PARALLEL" => Ok(Self::Parallel),
            other => Err(ExecutionStrategyParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStrategy`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStrategyParseError(pub String);

impl fmt::Display for ExecutionStrategyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution strategy: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStrategyParseError {}

// ---------------------------------------------------------------------------

/// Whether the mission pauses for plan approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InteractionMode {
    FullAuto,
    ApprovePlan,
}

impl fmt::Display for InteractionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FullAuto => "FULL_AUTO",
            Self::ApprovePlan => "APPROVE_PLAN",
        };
        f.write_str(s)
    }
}

impl FromStr for InteractionMode {
    type Err = InteractionModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "FULL_AUTO" => Ok(Self::FullAuto),
            "APPROVE_PLAN" => Ok(Self::ApprovePlan),
            other => Err(InteractionModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InteractionMode`] string.
#[derive(Debug, Clone)]
pub struct InteractionModeParseError(pub String);

impl fmt::Display for InteractionModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid interaction mode: {:?}", self.0)
    }
}

impl std::error::Error for InteractionModeParseError {}

// ---------------------------------------------------------------------------

/// Reasoning effort hint forwarded into agent instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningLevel {
    Low,
    #[default]
    Medium,
    High,
    Max,
}

impl fmt::Display for ReasoningLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Max => "max",
        };
        f.write_str(s)
    }
}

impl FromStr for ReasoningLevel {
    type Err = ReasoningLevelParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "max" => Ok(Self::Max),
            other => Err(ReasoningLevelParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ReasoningLevel`] string.
#[derive(Debug, Clone)]
pub struct ReasoningLevelParseError(pub String);

impl fmt::Display for ReasoningLevelParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid reasoning level: {:?}", self.0)
    }
}

impl std::error::Error for ReasoningLevelParseError {}

// ---------------------------------------------------------------------------

/// Lifecycle phase of a sandbox, retained in state for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxLifecycle {
    Opened,
    Completed,
    Failed,
    TornDown,
}

impl fmt::Display for SandboxLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Opened => "opened",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TornDown => "torn_down",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------

/// Kind of change a task made to a project file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Created,
    Modified,
    Deleted,
}

impl fmt::Display for FileChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A file the agent created, modified, or deleted during one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
}

impl FileChange {
    pub fn created(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileChangeKind::Created,
        }
    }

    pub fn modified(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: FileChangeKind::Modified,
        }
    }
}

/// A unit of work produced by the plan node and executed by one agent per
/// attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Stable id of the form `TASK-NNN`, unique within the mission.
    pub id: String,
    pub agent: AgentKind,
    pub description: String,
    pub input_context: String,
    pub success_criteria: String,
    /// Ids of tasks that must be completed before this one is ready.
    pub dependencies: Vec<String>,
    pub status: TaskStatus,
    /// Attempt counter; written only by the quality-gate evaluator.
    pub iteration: u32,
    pub max_iterations: u32,
    pub on_failure: FailureStrategy,
    /// Files this task owns exclusively (strict ownership when non-empty).
    pub target_files: Vec<String>,
    pub file_changes: Vec<FileChange>,
    pub elapsed_ms: u64,
}

impl Task {
    /// Build a new pending task with the default retry budget.
    pub fn new(id: impl Into<String>, agent: AgentKind, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent,
            description: description.into(),
            input_context: String::new(),
            success_criteria: String::new(),
            dependencies: Vec::new(),
            status: TaskStatus::Pending,
            iteration: 0,
            max_iterations: 3,
            on_failure: FailureStrategy::Retry,
            target_files: Vec::new(),
            file_changes: Vec::new(),
            elapsed_ms: 0,
        }
    }

    /// Whether this task can still be retried.
    pub fn retries_remaining(&self) -> bool {
        self.iteration < self.max_iterations
    }

    /// Whether the task has failed with no retries left.
    pub fn is_terminal_failure(&self) -> bool {
        self.status == TaskStatus::Failed && !self.retries_remaining()
    }
}

/// Outcome of dispatching one task within a wave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveDispatchResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub file_changes: Vec<FileChange>,
    /// Captured (truncated) sandbox output; absent when the provider
    /// produced none.
    pub output: Option<String>,
    pub elapsed_ms: u64,
}

/// A sandbox that ran (or attempted to run) one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub agent: AgentKind,
    pub task_id: String,
    pub lifecycle_status: SandboxLifecycle,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parsed outcome of a tester sub-dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub task_id: String,
    pub passed: bool,
    pub total: u32,
    pub failed: u32,
    pub duration_ms: u64,
    pub output: String,
}

/// Parsed outcome of a reviewer sub-dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewFeedback {
    pub task_id: String,
    pub approved: bool,
    /// Review score in 0..=10.
    pub score: u8,
    pub summary: String,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
}

/// The quality gate's verdict for one coder/refactorer attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityGateDecision {
    pub granted: bool,
    pub strategy: Option<FailureStrategy>,
    pub reason: String,
}

/// Output of the classify node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    /// Complexity on a 1..=5 scale.
    pub complexity: u8,
    pub affected_components: Vec<String>,
    pub planning_strategy: String,
    /// Toolchain image tag used when opening sandboxes (e.g. "python3.12").
    pub runtime_tag: String,
}

/// Output of the upload node: a scan of the target project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub language: String,
    pub framework: String,
    pub file_tree: Vec<String>,
    pub dependencies: Vec<String>,
    pub summary: String,
}

impl ProjectContext {
    /// Fallback context used when the project scan fails. The upload node
    /// never fails the mission over a scan error.
    pub fn unknown() -> Self {
        Self {
            language: "unknown".to_owned(),
            framework: String::new(),
            file_tree: Vec::new(),
            dependencies: Vec::new(),
            summary: "project scan failed; no files indexed".to_owned(),
        }
    }
}

/// Questions the clarify node wants answered before specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClarifyingQuestions {
    pub questions: Vec<String>,
}

/// Output of the spec node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSpec {
    pub title: String,
    pub summary: String,
    pub requirements: Vec<String>,
    pub acceptance_criteria: Vec<String>,
}

/// Aggregate counters computed by the converge node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissionMetrics {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub total_iterations: u32,
    pub files_created: u32,
    pub files_modified: u32,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub waves_executed: u32,
    /// Sum of sandbox spans (completed - started), skipping sandboxes with
    /// missing timestamps.
    pub aggregate_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// The mission-submission input handed to the classify node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionSubmission {
    pub request: String,
    #[serde(default = "default_interaction_mode")]
    pub interaction_mode: InteractionMode,
    #[serde(default)]
    pub create_cf_deployment: bool,
    #[serde(default)]
    pub prd_document: Option<String>,
    #[serde(default)]
    pub reasoning_level: Option<ReasoningLevel>,
}

fn default_interaction_mode() -> InteractionMode {
    InteractionMode::FullAuto
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
