//! Channel reducers: per-field merge rules for node patches.
//!
//! Every graph node returns a [`MissionPatch`]; [`apply_patch`] merges it
//! into the current state under one of five reducer classes:
//!
//! - **last-write**: patch value replaces the previous one.
//! - **replace**: last-write for whole collections (`tasks`,
//!   `wave_dispatch_results`).
//! - **append**: patch sequence is appended to the existing one.
//! - **union-append**: appended with deduplication, preserving first-seen
//!   order (`completed_task_ids`).
//! - **monotonic**: numeric `max(old, new)` (`wave_count`).
//!
//! The reducer is associative, and idempotent for patches touching only
//! last-write, union-append, and monotonic channels, so re-execution from a
//! checkpoint converges to identical state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::model::{
    Classification, ClarifyingQuestions, ExecutionStrategy, MissionMetrics, MissionStatus,
    ProductSpec, ProjectContext, ReviewFeedback, SandboxInfo, Task, TestResult,
    WaveDispatchResult,
};
use super::state::MissionState;

/// Errors raised by the channel reducer.
///
/// These are invariant violations: a node produced an illegal update. They
/// are programming errors in node code, not runtime conditions, and fail the
/// mission.
#[derive(Debug, Error)]
pub enum ReducerError {
    /// A status patch moved backwards along the monotone status DAG.
    #[error("illegal status transition: {from} -> {to}")]
    StatusRegression {
        from: MissionStatus,
        to: MissionStatus,
    },

    /// A task replace introduced a duplicate or malformed task id.
    #[error("task collection invalid: {0}")]
    InvalidTasks(String),
}

/// A partial update to mission state, produced by exactly one node run.
///
/// `None` / empty means "no change" for that channel. `retry_context` is
/// doubly optional: the outer `None` leaves the channel untouched, while
/// `Some(None)` clears it (the dispatcher clears on consumption).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MissionPatch {
    // last-write channels
    pub classification: Option<Classification>,
    pub project_context: Option<ProjectContext>,
    pub clarifying_questions: Option<ClarifyingQuestions>,
    pub clarifying_answers: Option<String>,
    pub product_spec: Option<ProductSpec>,
    pub execution_strategy: Option<ExecutionStrategy>,
    pub wave_task_ids: Option<Vec<String>>,
    pub retry_context: Option<Option<String>>,
    pub status: Option<MissionStatus>,
    pub metrics: Option<MissionMetrics>,
    pub deployment_url: Option<String>,
    pub manifest_created_by_task: Option<bool>,

    // replace channels
    pub tasks: Option<Vec<Task>>,
    pub wave_dispatch_results: Option<Vec<WaveDispatchResult>>,

    // monotonic channels
    pub wave_count: Option<u32>,

    // union-append channels
    pub completed_task_ids: Vec<String>,

    // append channels
    pub sandboxes: Vec<SandboxInfo>,
    pub test_results: Vec<TestResult>,
    pub review_feedback: Vec<ReviewFeedback>,
    pub errors: Vec<String>,
}

impl MissionPatch {
    /// A patch that only advances the mission status.
    pub fn status(status: MissionStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// A patch that fails the mission with one error entry.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(MissionStatus::Failed),
            errors: vec![error.into()],
            ..Self::default()
        }
    }

    /// Whether the patch carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.classification.is_none()
            && self.project_context.is_none()
            && self.clarifying_questions.is_none()
            && self.clarifying_answers.is_none()
            && self.product_spec.is_none()
            && self.execution_strategy.is_none()
            && self.wave_task_ids.is_none()
            && self.retry_context.is_none()
            && self.status.is_none()
            && self.metrics.is_none()
            && self.deployment_url.is_none()
            && self.manifest_created_by_task.is_none()
            && self.tasks.is_none()
            && self.wave_dispatch_results.is_none()
            && self.wave_count.is_none()
            && self.completed_task_ids.is_empty()
            && self.sandboxes.is_empty()
            && self.test_results.is_empty()
            && self.review_feedback.is_empty()
            && self.errors.is_empty()
    }
}

/// Merge a patch into the state, returning the new state.
pub fn apply_patch(state: &MissionState, patch: &MissionPatch) -> Result<MissionState, ReducerError> {
    let mut next = state.clone();

    // -- last-write -------------------------------------------------------
    if let Some(v) = &patch.classification {
        next.classification = Some(v.clone());
    }
    if let Some(v) = &patch.project_context {
        next.project_context = Some(v.clone());
    }
    if let Some(v) = &patch.clarifying_questions {
        next.clarifying_questions = Some(v.clone());
    }
    if let Some(v) = &patch.clarifying_answers {
        next.clarifying_answers = Some(v.clone());
    }
    if let Some(v) = &patch.product_spec {
        next.product_spec = Some(v.clone());
    }
    if let Some(v) = patch.execution_strategy {
        next.execution_strategy = v;
    }
    if let Some(v) = &patch.wave_task_ids {
        next.wave_task_ids = v.clone();
    }
    if let Some(v) = &patch.retry_context {
        next.retry_context = v.clone();
    }
    if let Some(v) = &patch.metrics {
        next.metrics = Some(v.clone());
    }
    if let Some(v) = &patch.deployment_url {
        next.deployment_url = Some(v.clone());
    }
    if let Some(v) = patch.manifest_created_by_task {
        next.manifest_created_by_task = v;
    }

    if let Some(to) = patch.status {
        if !next.status.can_transition_to(to) {
            return Err(ReducerError::StatusRegression {
                from: next.status,
                to,
            });
        }
        next.status = to;
    }

    // -- replace ----------------------------------------------------------
    if let Some(tasks) = &patch.tasks {
        validate_tasks(tasks)?;
        next.tasks = tasks.clone();
    }
    if let Some(results) = &patch.wave_dispatch_results {
        next.wave_dispatch_results = results.clone();
    }

    // -- monotonic --------------------------------------------------------
    if let Some(count) = patch.wave_count {
        next.wave_count = next.wave_count.max(count);
    }

    // -- union-append -----------------------------------------------------
    for id in &patch.completed_task_ids {
        if !next.completed_task_ids.iter().any(|existing| existing == id) {
            next.completed_task_ids.push(id.clone());
        }
    }

    // -- append -----------------------------------------------------------
    next.sandboxes.extend(patch.sandboxes.iter().cloned());
    next.test_results.extend(patch.test_results.iter().cloned());
    next.review_feedback
        .extend(patch.review_feedback.iter().cloned());
    next.errors.extend(patch.errors.iter().cloned());

    Ok(next)
}

/// Reject task collections with duplicate or malformed ids, or dependencies
/// on unknown tasks.
fn validate_tasks(tasks: &[Task]) -> Result<(), ReducerError> {
    let mut seen = std::collections::HashSet::new();
    for task in tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(ReducerError::InvalidTasks(format!(
                "duplicate task id {}",
                task.id
            )));
        }
        if !is_task_id(&task.id) {
            return Err(ReducerError::InvalidTasks(format!(
                "malformed task id {:?}, expected TASK-NNN",
                task.id
            )));
        }
    }
    for task in tasks {
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(ReducerError::InvalidTasks(format!(
                    "task {} depends on unknown task {}",
                    task.id, dep
                )));
            }
        }
    }
    Ok(())
}

/// Whether a string has the `TASK-NNN` shape.
fn is_task_id(id: &str) -> bool {
    match id.strip_prefix("TASK-") {
        Some(digits) => !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::model::{
        AgentKind, InteractionMode, MissionSubmission, TaskStatus,
    };

    fn base_state() -> MissionState {
        let submission = MissionSubmission {
            request: "build it".to_owned(),
            interaction_mode: InteractionMode::FullAuto,
            create_cf_deployment: false,
            prd_document: None,
            reasoning_level: None,
        };
        MissionState::from_submission(&submission, None)
    }

    #[test]
    fn empty_patch_is_identity() {
        let state = base_state();
        let next = apply_patch(&state, &MissionPatch::default()).unwrap();
        assert_eq!(state, next);
    }

    #[test]
    fn last_write_replaces() {
        let state = base_state();
        let patch = MissionPatch {
            clarifying_answers: Some("no services needed".to_owned()),
            ..MissionPatch::default()
        };
        let next = apply_patch(&state, &patch).unwrap();
        assert_eq!(next.clarifying_answers.as_deref(), Some("no services needed"));
    }

    #[test]
    fn retry_context_set_and_clear() {
        let state = base_state();

        let set = MissionPatch {
            retry_context: Some(Some("TASK-001: tests failed".to_owned())),
            ..MissionPatch::default()
        };
        let with_ctx = apply_patch(&state, &set).unwrap();
        assert!(with_ctx.retry_context.is_some());

        let clear = MissionPatch {
            retry_context: Some(None),
            ..MissionPatch::default()
        };
        let cleared = apply_patch(&with_ctx, &clear).unwrap();
        assert!(cleared.retry_context.is_none());
    }

    #[test]
    fn union_append_dedups_preserving_order() {
        let state = base_state();
        let first = MissionPatch {
            completed_task_ids: vec!["TASK-001".into(), "TASK-002".into()],
            ..MissionPatch::default()
        };
        let second = MissionPatch {
            completed_task_ids: vec!["TASK-002".into(), "TASK-003".into()],
            ..MissionPatch::default()
        };

        let next = apply_patch(&state, &first).unwrap();
        let next = apply_patch(&next, &second).unwrap();
        assert_eq!(
            next.completed_task_ids,
            vec!["TASK-001", "TASK-002", "TASK-003"]
        );
    }

    #[test]
    fn reducer_is_idempotent_for_safe_channels() {
        let state = base_state();
        let patch = MissionPatch {
            status: Some(MissionStatus::Classifying),
            wave_count: Some(3),
            completed_task_ids: vec!["TASK-001".into()],
            deployment_url: Some("app.example.com".into()),
            ..MissionPatch::default()
        };

        let once = apply_patch(&state, &patch).unwrap();
        let twice = apply_patch(&once, &patch).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn wave_count_is_monotonic() {
        let state = base_state();
        let up = MissionPatch {
            wave_count: Some(5),
            ..MissionPatch::default()
        };
        let next = apply_patch(&state, &up).unwrap();
        assert_eq!(next.wave_count, 5);

        let down = MissionPatch {
            wave_count: Some(2),
            ..MissionPatch::default()
        };
        let next = apply_patch(&next, &down).unwrap();
        assert_eq!(next.wave_count, 5, "monotonic channel keeps the max");
    }

    #[test]
    fn status_regression_is_rejected() {
        let state = base_state();
        let forward = apply_patch(&state, &MissionPatch::status(MissionStatus::Executing)).unwrap();

        let err = apply_patch(&forward, &MissionPatch::status(MissionStatus::Planning))
            .expect_err("backwards status must be rejected");
        assert!(matches!(err, ReducerError::StatusRegression { .. }));
    }

    #[test]
    fn failed_is_absorbing() {
        let state = base_state();
        let failed = apply_patch(&state, &MissionPatch::failed("TASK-001: escalated")).unwrap();
        assert_eq!(failed.status, MissionStatus::Failed);
        assert_eq!(failed.errors.len(), 1);

        let err = apply_patch(&failed, &MissionPatch::status(MissionStatus::Completed))
            .expect_err("nothing leaves FAILED");
        assert!(matches!(err, ReducerError::StatusRegression { .. }));
    }

    #[test]
    fn tasks_replace_validates_ids() {
        let state = base_state();

        let dup = MissionPatch {
            tasks: Some(vec![
                Task::new("TASK-001", AgentKind::Coder, "a"),
                Task::new("TASK-001", AgentKind::Tester, "b"),
            ]),
            ..MissionPatch::default()
        };
        assert!(apply_patch(&state, &dup).is_err());

        let malformed = MissionPatch {
            tasks: Some(vec![Task::new("JOB-1", AgentKind::Coder, "a")]),
            ..MissionPatch::default()
        };
        assert!(apply_patch(&state, &malformed).is_err());

        let unknown_dep = MissionPatch {
            tasks: Some(vec![{
                let mut t = Task::new("TASK-001", AgentKind::Coder, "a");
                t.dependencies.push("TASK-009".into());
                t
            }]),
            ..MissionPatch::default()
        };
        assert!(apply_patch(&state, &unknown_dep).is_err());
    }

    #[test]
    fn wave_dispatch_results_replace_whole_collection() {
        let state = base_state();
        let wave1 = MissionPatch {
            wave_dispatch_results: Some(vec![WaveDispatchResult {
                task_id: "TASK-001".into(),
                status: TaskStatus::Passed,
                file_changes: vec![],
                output: None,
                elapsed_ms: 10,
            }]),
            ..MissionPatch::default()
        };
        let wave2 = MissionPatch {
            wave_dispatch_results: Some(vec![WaveDispatchResult {
                task_id: "TASK-002".into(),
                status: TaskStatus::Failed,
                file_changes: vec![],
                output: Some("boom".into()),
                elapsed_ms: 20,
            }]),
            ..MissionPatch::default()
        };

        let next = apply_patch(&state, &wave1).unwrap();
        let next = apply_patch(&next, &wave2).unwrap();
        assert_eq!(next.wave_dispatch_results.len(), 1, "replace, not append");
        assert_eq!(next.wave_dispatch_results[0].task_id, "TASK-002");
    }

    #[test]
    fn append_channels_accumulate() {
        let state = base_state();
        let patch = MissionPatch {
            errors: vec!["TASK-001: provider unavailable".into()],
            ..MissionPatch::default()
        };
        let next = apply_patch(&state, &patch).unwrap();
        let next = apply_patch(&next, &patch).unwrap();
        assert_eq!(next.errors.len(), 2, "append channels are not idempotent");
    }

    #[test]
    fn task_id_shape() {
        assert!(is_task_id("TASK-001"));
        assert!(is_task_id("TASK-42"));
        assert!(!is_task_id("TASK-"));
        assert!(!is_task_id("task-001"));
        assert!(!is_task_id("TASK-0a1"));
    }
}
