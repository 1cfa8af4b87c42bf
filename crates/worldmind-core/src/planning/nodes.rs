//! The planning-phase graph nodes: classify, upload, clarify, spec, plan,
//! await-approval, converge, and post-mission.
//!
//! All model judgement is delegated through the [`super::caller`] seams;
//! these nodes own only control flow and the invariants on what each step
//! writes into state.

use anyhow::Result;
use async_trait::async_trait;

use crate::graph::{MissionContext, MissionNode, NodeName};
use crate::metrics::name as metric;
use crate::mission::model::{MissionMetrics, MissionStatus, ProjectContext};
use crate::mission::{MissionPatch, MissionState};
use super::caller::{ClarifyInput, PlanInput, SpecifyInput};
use super::plan::normalize_plan;

/// Clarifying question injected for missions that will deploy.
const SERVICE_BINDING_QUESTION: &str = "Which platform services should be bound to the deployed \
     application? Answer 'No services needed' if none.";

// ---------------------------------------------------------------------------
// classify
// ---------------------------------------------------------------------------

/// Classifies the request: category, complexity, affected components,
/// planning strategy, runtime tag.
pub struct ClassifyNode;

#[async_trait]
impl MissionNode for ClassifyNode {
    fn name(&self) -> NodeName {
        NodeName::Classify
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        match ctx.caller.classify(&state.request).await {
            Ok(classification) => {
                tracing::info!(
                    mission_id = %state.mission_id,
                    category = %classification.category,
                    complexity = classification.complexity,
                    "request classified"
                );
                Ok(MissionPatch {
                    classification: Some(classification),
                    status: Some(MissionStatus::Uploading),
                    ..MissionPatch::default()
                })
            }
            Err(e) => Ok(MissionPatch::failed(format!(
                "classification failed: {e}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// upload
// ---------------------------------------------------------------------------

/// Scans the project. Never fails the mission: a scan error produces the
/// fallback context plus an error entry.
pub struct UploadNode;

#[async_trait]
impl MissionNode for UploadNode {
    fn name(&self) -> NodeName {
        NodeName::Upload
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        let mut patch = MissionPatch {
            status: Some(MissionStatus::Clarifying),
            ..MissionPatch::default()
        };

        match ctx.scanner.scan(&ctx.config.project_path).await {
            Ok(context) => {
                tracing::info!(
                    mission_id = %state.mission_id,
                    language = %context.language,
                    files = context.file_tree.len(),
                    "project scanned"
                );
                patch.project_context = Some(context);
            }
            Err(e) => {
                tracing::warn!(
                    mission_id = %state.mission_id,
                    error = %e,
                    "project scan failed, using fallback context"
                );
                patch.project_context = Some(ProjectContext::unknown());
                patch.errors.push(format!("project scan failed: {e}"));
            }
        }

        Ok(patch)
    }
}

// ---------------------------------------------------------------------------
// clarify
// ---------------------------------------------------------------------------

/// Generates clarifying questions, injecting the service-binding question
/// for deploying missions. Skips itself entirely when answers are already
/// present.
pub struct ClarifyNode;

#[async_trait]
impl MissionNode for ClarifyNode {
    fn name(&self) -> NodeName {
        NodeName::Clarify
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        if state.clarifying_answers.is_some() {
            return Ok(MissionPatch::status(MissionStatus::Specifying));
        }

        let Some(classification) = &state.classification else {
            return Ok(MissionPatch::failed("clarify ran without classification"));
        };
        let Some(project_context) = &state.project_context else {
            return Ok(MissionPatch::failed("clarify ran without project context"));
        };

        let input = ClarifyInput {
            request: &state.request,
            classification,
            project_context,
            create_cf_deployment: state.create_cf_deployment,
            prd_document: state.prd_document.as_deref(),
        };

        match ctx.caller.clarify(&input).await {
            Ok(mut questions) => {
                if state.create_cf_deployment
                    && !questions
                        .questions
                        .iter()
                        .any(|q| q.to_lowercase().contains("service"))
                {
                    questions
                        .questions
                        .push(SERVICE_BINDING_QUESTION.to_owned());
                }
                Ok(MissionPatch {
                    clarifying_questions: Some(questions),
                    status: Some(MissionStatus::Specifying),
                    ..MissionPatch::default()
                })
            }
            Err(e) => Ok(MissionPatch::failed(format!("clarification failed: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// spec
// ---------------------------------------------------------------------------

/// Produces the product specification.
pub struct SpecNode;

#[async_trait]
impl MissionNode for SpecNode {
    fn name(&self) -> NodeName {
        NodeName::Spec
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        let Some(classification) = &state.classification else {
            return Ok(MissionPatch::failed("spec ran without classification"));
        };
        let Some(project_context) = &state.project_context else {
            return Ok(MissionPatch::failed("spec ran without project context"));
        };

        let input = SpecifyInput {
            request: &state.request,
            classification,
            project_context,
            clarifying_questions: state.clarifying_questions.as_ref(),
            clarifying_answers: state.clarifying_answers.as_deref(),
            prd_document: state.prd_document.as_deref(),
        };

        match ctx.caller.specify(&input).await {
            Ok(product_spec) => Ok(MissionPatch {
                product_spec: Some(product_spec),
                status: Some(MissionStatus::Planning),
                ..MissionPatch::default()
            }),
            Err(e) => Ok(MissionPatch::failed(format!("specification failed: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// plan
// ---------------------------------------------------------------------------

/// Produces the task list, deterministically normalized.
pub struct PlanNode;

#[async_trait]
impl MissionNode for PlanNode {
    fn name(&self) -> NodeName {
        NodeName::Plan
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        let Some(classification) = &state.classification else {
            return Ok(MissionPatch::failed("plan ran without classification"));
        };
        let Some(project_context) = &state.project_context else {
            return Ok(MissionPatch::failed("plan ran without project context"));
        };
        let Some(product_spec) = &state.product_spec else {
            return Ok(MissionPatch::failed("plan ran without product spec"));
        };

        let input = PlanInput {
            request: &state.request,
            classification,
            project_context,
            product_spec,
        };

        match ctx.caller.plan(&input).await {
            Ok(draft) => {
                let tasks = normalize_plan(&draft, state.create_cf_deployment);
                if tasks.is_empty() {
                    return Ok(MissionPatch::failed("planner produced an empty task list"));
                }

                tracing::info!(
                    mission_id = %state.mission_id,
                    tasks = tasks.len(),
                    strategy = %draft.execution_strategy,
                    "plan produced"
                );

                Ok(MissionPatch {
                    tasks: Some(tasks),
                    execution_strategy: Some(draft.execution_strategy),
                    manifest_created_by_task: Some(draft.manifest_created_by_task),
                    status: Some(MissionStatus::AwaitingApproval),
                    ..MissionPatch::default()
                })
            }
            Err(e) => Ok(MissionPatch::failed(format!("planning failed: {e}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// await_approval
// ---------------------------------------------------------------------------

/// Blocks on the approval gate for `APPROVE_PLAN` missions.
pub struct AwaitApprovalNode;

#[async_trait]
impl MissionNode for AwaitApprovalNode {
    fn name(&self) -> NodeName {
        NodeName::AwaitApproval
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        let approved = ctx
            .approval
            .await_approval(&state.mission_id, state.tasks.len())
            .await;

        if approved {
            tracing::info!(mission_id = %state.mission_id, "plan approved");
            Ok(MissionPatch::default())
        } else {
            Ok(MissionPatch::failed("plan approval rejected by operator"))
        }
    }
}

// ---------------------------------------------------------------------------
// converge
// ---------------------------------------------------------------------------

/// Aggregates final metrics and settles the terminal status.
pub struct ConvergeNode;

#[async_trait]
impl MissionNode for ConvergeNode {
    fn name(&self) -> NodeName {
        NodeName::Converge
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        let metrics = compute_metrics(state);

        ctx.metrics.record_timing(
            metric::MISSION_ELAPSED_MS,
            &[],
            metrics.total_duration_ms,
        );

        let mut patch = MissionPatch {
            metrics: Some(metrics.clone()),
            ..MissionPatch::default()
        };

        if state.status == MissionStatus::Failed {
            // Failed is absorbing; metrics are still recorded.
        } else if metrics.tasks_completed >= 1 && !state.has_terminal_failure() {
            patch.status = Some(MissionStatus::Completed);
        } else {
            patch.status = Some(MissionStatus::Failed);
            patch.errors.push(format!(
                "mission converged without success: {} completed, {} failed",
                metrics.tasks_completed, metrics.tasks_failed
            ));
        }

        tracing::info!(
            mission_id = %state.mission_id,
            completed = metrics.tasks_completed,
            failed = metrics.tasks_failed,
            waves = metrics.waves_executed,
            "mission converged"
        );

        Ok(patch)
    }
}

/// Aggregate counters from the final state.
fn compute_metrics(state: &MissionState) -> MissionMetrics {
    let tasks_completed = state.completed_task_ids.len() as u32;
    let tasks_failed = state
        .tasks
        .iter()
        .filter(|t| t.is_terminal_failure())
        .count() as u32;
    let total_iterations = state.tasks.iter().map(|t| t.iteration).sum();

    let mut files_created = 0u32;
    let mut files_modified = 0u32;
    for task in &state.tasks {
        for change in &task.file_changes {
            match change.kind {
                crate::mission::model::FileChangeKind::Created => files_created += 1,
                crate::mission::model::FileChangeKind::Modified => files_modified += 1,
                crate::mission::model::FileChangeKind::Deleted => {}
            }
        }
    }

    let tests_run = state.test_results.iter().map(|t| t.total).sum();
    let tests_passed = state
        .test_results
        .iter()
        .map(|t| t.total.saturating_sub(t.failed))
        .sum();

    // Sandbox spans, skipping entries with missing timestamps.
    let mut aggregate_duration_ms = 0u64;
    let mut earliest = None;
    let mut latest = None;
    for sandbox in &state.sandboxes {
        let (Some(started), Some(completed)) = (sandbox.started_at, sandbox.completed_at) else {
            continue;
        };
        let span = (completed - started).num_milliseconds().max(0) as u64;
        aggregate_duration_ms += span;
        earliest = Some(earliest.map_or(started, |e: chrono::DateTime<chrono::Utc>| e.min(started)));
        latest = Some(latest.map_or(completed, |l: chrono::DateTime<chrono::Utc>| l.max(completed)));
    }
    let total_duration_ms = match (earliest, latest) {
        (Some(e), Some(l)) => (l - e).num_milliseconds().max(0) as u64,
        _ => 0,
    };

    MissionMetrics {
        tasks_completed,
        tasks_failed,
        total_iterations,
        files_created,
        files_modified,
        tests_run,
        tests_passed,
        waves_executed: state.wave_count,
        aggregate_duration_ms,
        total_duration_ms,
    }
}

// ---------------------------------------------------------------------------
// post_mission
// ---------------------------------------------------------------------------

/// Final housekeeping after convergence: workspace cleanup.
pub struct PostMissionNode;

#[async_trait]
impl MissionNode for PostMissionNode {
    fn name(&self) -> NodeName {
        NodeName::PostMission
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        if ctx.config.git_remote.is_some() {
            ctx.workspaces.cleanup_mission(&state.mission_id);
        }
        tracing::info!(
            mission_id = %state.mission_id,
            status = %state.status,
            "mission finished"
        );
        Ok(MissionPatch::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mission::model::{
        AgentKind, FileChange, InteractionMode, MissionSubmission, SandboxInfo, SandboxLifecycle,
        Task, TaskStatus, TestResult,
    };
    use chrono::{Duration, Utc};

    fn base_state() -> MissionState {
        let submission = MissionSubmission {
            request: "x".to_owned(),
            interaction_mode: InteractionMode::FullAuto,
            create_cf_deployment: false,
            prd_document: None,
            reasoning_level: None,
        };
        MissionState::from_submission(&submission, None)
    }

    #[test]
    fn metrics_aggregate_tasks_and_tests() {
        let mut state = base_state();

        let mut done = Task::new("TASK-001", AgentKind::Coder, "a");
        done.status = TaskStatus::Passed;
        done.iteration = 1;
        done.file_changes = vec![
            FileChange::created("a.py"),
            FileChange::modified("b.py"),
        ];
        state.tasks.push(done);

        let mut failed = Task::new("TASK-002", AgentKind::Coder, "b");
        failed.status = TaskStatus::Failed;
        failed.iteration = 3;
        state.tasks.push(failed);

        state.completed_task_ids.push("TASK-001".to_owned());
        state.wave_count = 4;
        state.test_results.push(TestResult {
            task_id: "TASK-001".to_owned(),
            passed: true,
            total: 10,
            failed: 2,
            duration_ms: 100,
            output: String::new(),
        });

        let metrics = compute_metrics(&state);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 1);
        assert_eq!(metrics.total_iterations, 4);
        assert_eq!(metrics.files_created, 1);
        assert_eq!(metrics.files_modified, 1);
        assert_eq!(metrics.tests_run, 10);
        assert_eq!(metrics.tests_passed, 8);
        assert_eq!(metrics.waves_executed, 4);
    }

    #[test]
    fn metrics_skip_sandboxes_with_missing_timestamps() {
        let mut state = base_state();
        let start = Utc::now();

        state.sandboxes.push(SandboxInfo {
            sandbox_id: "sbx-1".to_owned(),
            agent: AgentKind::Coder,
            task_id: "TASK-001".to_owned(),
            lifecycle_status: SandboxLifecycle::TornDown,
            started_at: Some(start),
            completed_at: Some(start + Duration::milliseconds(500)),
        });
        state.sandboxes.push(SandboxInfo {
            sandbox_id: "sbx-2".to_owned(),
            agent: AgentKind::Tester,
            task_id: "TASK-001-tester".to_owned(),
            lifecycle_status: SandboxLifecycle::Failed,
            started_at: Some(start),
            completed_at: None,
        });

        let metrics = compute_metrics(&state);
        assert_eq!(metrics.aggregate_duration_ms, 500);
        assert_eq!(metrics.total_duration_ms, 500);
    }

    #[test]
    fn skipped_failures_do_not_block_completion_counters() {
        let mut state = base_state();

        // A skipped task: failed but with retries left, counted complete.
        let mut skipped = Task::new("TASK-001", AgentKind::Researcher, "a");
        skipped.status = TaskStatus::Failed;
        skipped.iteration = 1;
        state.tasks.push(skipped);
        state.completed_task_ids.push("TASK-001".to_owned());

        let metrics = compute_metrics(&state);
        assert_eq!(metrics.tasks_completed, 1);
        assert_eq!(metrics.tasks_failed, 0, "non-terminal failure is not counted");
    }
}
