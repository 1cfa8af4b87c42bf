//! The mission state record.
//!
//! The state is owned exclusively by the graph engine; nodes receive an
//! immutable view and return a [`super::MissionPatch`] that the channel
//! reducer applies.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::model::{
    Classification, ClarifyingQuestions, ExecutionStrategy, InteractionMode, MissionMetrics,
    MissionStatus, MissionSubmission, ProductSpec, ProjectContext, ReasoningLevel, ReviewFeedback,
    SandboxInfo, Task, TestResult, WaveDispatchResult,
};

/// Complete state of one mission, snapshotted at every graph node boundary.
///
/// Serialization must round-trip exactly; checkpoints are serde_json blobs
/// of this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionState {
    pub mission_id: String,
    /// Checkpoint partition key.
    pub thread_id: String,
    pub request: String,
    pub interaction_mode: InteractionMode,
    pub create_cf_deployment: bool,
    pub prd_document: Option<String>,
    pub reasoning_level: ReasoningLevel,

    pub classification: Option<Classification>,
    pub project_context: Option<ProjectContext>,
    pub clarifying_questions: Option<ClarifyingQuestions>,
    pub clarifying_answers: Option<String>,
    pub product_spec: Option<ProductSpec>,

    pub tasks: Vec<Task>,
    pub execution_strategy: ExecutionStrategy,
    pub wave_task_ids: Vec<String>,
    pub wave_count: u32,
    pub wave_dispatch_results: Vec<WaveDispatchResult>,
    /// Order-preserving set; grows monotonically.
    pub completed_task_ids: Vec<String>,
    pub sandboxes: Vec<SandboxInfo>,
    pub test_results: Vec<TestResult>,
    pub review_feedback: Vec<ReviewFeedback>,
    pub retry_context: Option<String>,
    pub errors: Vec<String>,
    pub status: MissionStatus,
    pub metrics: Option<MissionMetrics>,
    pub deployment_url: Option<String>,
    pub manifest_created_by_task: bool,
}

impl MissionState {
    /// Initialize state for a fresh mission from a submission.
    ///
    /// Generates a mission id of the form `wmnd-<uuid-prefix>` and uses it
    /// as the thread id unless one is supplied.
    pub fn from_submission(submission: &MissionSubmission, thread_id: Option<String>) -> Self {
        let mission_id = format!("wmnd-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let thread_id = thread_id.unwrap_or_else(|| mission_id.clone());

        Self {
            mission_id,
            thread_id,
            request: submission.request.clone(),
            interaction_mode: submission.interaction_mode,
            create_cf_deployment: submission.create_cf_deployment,
            prd_document: submission.prd_document.clone(),
            reasoning_level: submission.reasoning_level.unwrap_or_default(),
            classification: None,
            project_context: None,
            clarifying_questions: None,
            clarifying_answers: None,
            product_spec: None,
            tasks: Vec::new(),
            execution_strategy: ExecutionStrategy::Sequential,
            wave_task_ids: Vec::new(),
            wave_count: 0,
            wave_dispatch_results: Vec::new(),
            completed_task_ids: Vec::new(),
            sandboxes: Vec::new(),
            test_results: Vec::new(),
            review_feedback: Vec::new(),
            retry_context: None,
            errors: Vec::new(),
            status: MissionStatus::Created,
            metrics: None,
            deployment_url: None,
            manifest_created_by_task: false,
        }
    }

    /// Look up a task by id.
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Whether a task id is in the completed set.
    pub fn is_completed(&self, task_id: &str) -> bool {
        self.completed_task_ids.iter().any(|id| id == task_id)
    }

    /// Ids of tasks that are neither completed nor terminally failed.
    pub fn remaining_task_ids(&self) -> Vec<&str> {
        self.tasks
            .iter()
            .filter(|t| !self.is_completed(&t.id) && !t.is_terminal_failure())
            .map(|t| t.id.as_str())
            .collect()
    }

    /// Whether any task has failed with no retries left.
    pub fn has_terminal_failure(&self) -> bool {
        self.tasks.iter().any(Task::is_terminal_failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::model::AgentKind;

    fn submission(request: &str) -> MissionSubmission {
        MissionSubmission {
            request: request.to_owned(),
            interaction_mode: InteractionMode::FullAuto,
            create_cf_deployment: false,
            prd_document: None,
            reasoning_level: None,
        }
    }

    #[test]
    fn from_submission_initializes_defaults() {
        let state = MissionState::from_submission(&submission("add a login page"), None);

        assert!(state.mission_id.starts_with("wmnd-"));
        assert_eq!(state.thread_id, state.mission_id);
        assert_eq!(state.status, MissionStatus::Created);
        assert_eq!(state.wave_count, 0);
        assert!(state.tasks.is_empty());
        assert!(state.errors.is_empty());
    }

    #[test]
    fn explicit_thread_id_wins() {
        let state =
            MissionState::from_submission(&submission("x"), Some("thread-abc".to_owned()));
        assert_eq!(state.thread_id, "thread-abc");
        assert_ne!(state.mission_id, state.thread_id);
    }

    #[test]
    fn snapshot_roundtrip_is_exact() {
        let mut state = MissionState::from_submission(&submission("roundtrip"), None);
        state.tasks.push(Task::new("TASK-001", AgentKind::Coder, "write code"));
        state.completed_task_ids.push("TASK-001".to_owned());
        state.errors.push("TASK-001: something odd".to_owned());

        let blob = serde_json::to_vec(&state).unwrap();
        let restored: MissionState = serde_json::from_slice(&blob).unwrap();
        assert_eq!(state, restored);
    }

    #[test]
    fn remaining_excludes_completed_and_terminal() {
        let mut state = MissionState::from_submission(&submission("x"), None);
        state.tasks.push(Task::new("TASK-001", AgentKind::Coder, "a"));
        state.tasks.push(Task::new("TASK-002", AgentKind::Coder, "b"));
        let mut failed = Task::new("TASK-003", AgentKind::Coder, "c");
        failed.status = crate::mission::model::TaskStatus::Failed;
        failed.iteration = failed.max_iterations;
        state.tasks.push(failed);
        state.completed_task_ids.push("TASK-001".to_owned());

        assert_eq!(state.remaining_task_ids(), vec!["TASK-002"]);
        assert!(state.has_terminal_failure());
    }
}
