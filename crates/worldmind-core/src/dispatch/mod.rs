//! Parallel dispatcher: bounded-concurrency fan-out of a wave.
//!
//! Each task in the wave runs in its own worker under a semaphore cap.
//! Workers never touch shared state; they return one outcome each, and the
//! node merges all outcomes into a single patch (whole-wave replace of
//! `wave_dispatch_results`, task copies with updated status, appended
//! sandboxes and errors, and the consumed retry context cleared).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::events::topic;
use crate::graph::{MissionContext, MissionNode, NodeName};
use crate::instruction;
use crate::metrics::name as metric;
use crate::mission::model::{
    AgentKind, SandboxInfo, SandboxLifecycle, Task, TaskStatus, WaveDispatchResult,
};
use crate::mission::{MissionPatch, MissionState};
use crate::sandbox::{ExecuteTaskRequest, ExecutionResult};

/// Dispatches the scheduled wave through the sandbox manager.
pub struct ParallelDispatchNode;

/// Everything one worker reports back.
struct WorkerOutcome {
    task: Task,
    result: WaveDispatchResult,
    sandbox: Option<SandboxInfo>,
    error: Option<String>,
}

#[async_trait]
impl MissionNode for ParallelDispatchNode {
    fn name(&self) -> NodeName {
        NodeName::ParallelDispatch
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        let wave_clock = Instant::now();
        let semaphore = Arc::new(Semaphore::new(ctx.config.dispatch.max_parallel.max(1)));

        let mut handles = Vec::with_capacity(state.wave_task_ids.len());
        for task_id in &state.wave_task_ids {
            let task = state
                .task(task_id)
                .with_context(|| format!("scheduled task {task_id} not found in state"))?
                .clone();

            let worker_state = WorkerInputs::from_state(state, ctx);
            let semaphore = Arc::clone(&semaphore);

            handles.push(async move {
                match semaphore.acquire().await {
                    Ok(_permit) => dispatch_one(task, worker_state).await,
                    Err(_) => infrastructure_failure(
                        task,
                        Instant::now(),
                        "dispatcher semaphore closed".to_owned(),
                    ),
                }
            });
        }

        let outcomes = futures::future::join_all(handles).await;

        let mut patch = MissionPatch {
            retry_context: Some(None),
            ..MissionPatch::default()
        };

        let mut tasks = state.tasks.clone();
        let mut results = Vec::with_capacity(outcomes.len());

        for outcome in outcomes {
            if let Some(slot) = tasks.iter_mut().find(|t| t.id == outcome.task.id) {
                *slot = outcome.task;
            }
            if let Some(sandbox) = outcome.sandbox {
                patch.sandboxes.push(sandbox);
            }
            if let Some(error) = outcome.error {
                patch.errors.push(error);
            }
            results.push(outcome.result);
        }

        ctx.metrics.record_timing(
            metric::WAVE_ELAPSED_MS,
            &[],
            wave_clock.elapsed().as_millis() as u64,
        );

        patch.tasks = Some(tasks);
        patch.wave_dispatch_results = Some(results);
        Ok(patch)
    }
}

/// Per-worker snapshot of the context a task dispatch needs.
struct WorkerInputs {
    ctx_config: Arc<crate::config::WorldmindConfig>,
    sandboxes: Arc<crate::sandbox::SandboxManager>,
    workspaces: Arc<crate::worktree::WorkspaceManager>,
    events: Arc<crate::events::EventBus>,
    metrics: Arc<dyn crate::metrics::MetricsSink>,
    mission_id: String,
    retry_context: Option<String>,
    project_context: crate::mission::model::ProjectContext,
    runtime_tag: String,
    reasoning_level: crate::mission::model::ReasoningLevel,
    manifest_created_by_task: bool,
    service_bindings: String,
}

impl WorkerInputs {
    fn from_state(state: &MissionState, ctx: &MissionContext) -> Self {
        Self {
            ctx_config: Arc::clone(&ctx.config),
            sandboxes: Arc::clone(&ctx.sandboxes),
            workspaces: Arc::clone(&ctx.workspaces),
            events: Arc::clone(&ctx.events),
            metrics: Arc::clone(&ctx.metrics),
            mission_id: state.mission_id.clone(),
            retry_context: state.retry_context.clone(),
            project_context: state
                .project_context
                .clone()
                .unwrap_or_else(crate::mission::model::ProjectContext::unknown),
            runtime_tag: state
                .classification
                .as_ref()
                .map(|c| c.runtime_tag.clone())
                .unwrap_or_else(|| "base".to_owned()),
            reasoning_level: state.reasoning_level,
            manifest_created_by_task: state.manifest_created_by_task,
            service_bindings: state
                .clarifying_answers
                .clone()
                .unwrap_or_else(|| "No services needed".to_owned()),
        }
    }
}

/// Run one task attempt end to end and capture every failure mode into the
/// returned outcome.
async fn dispatch_one(mut task: Task, inputs: WorkerInputs) -> WorkerOutcome {
    let clock = Instant::now();
    task.status = TaskStatus::Executing;

    // Retry augmentation: consume the wave's retry context into this
    // attempt's input.
    if let Some(retry) = &inputs.retry_context {
        if !retry.is_empty() {
            task.input_context = format!(
                "{}{}",
                instruction::retry_block(retry),
                task.input_context
            );
        }
    }

    let agent_label = task.agent.to_string();
    inputs.events.publish(
        topic::TASK_DISPATCHED,
        &inputs.mission_id,
        Some(&task.id),
        serde_json::json!({ "agent": agent_label, "iteration": task.iteration }),
    );
    inputs
        .metrics
        .incr_counter(metric::DISPATCH_TOTAL, &[("agent", agent_label.as_str())]);

    // Resolve the working directory: per-task worktree when the mission
    // has a git remote, else the configured project path.
    let project_path = match resolve_project_path(&task, &inputs) {
        Ok(path) => path,
        Err(e) => {
            return infrastructure_failure(task, clock, format!("worktree setup failed: {e}"));
        }
    };

    let instruction_text = build_instruction(&task, &inputs);

    let request = ExecuteTaskRequest {
        agent: task.agent,
        task_id: task.id.clone(),
        project_path,
        instruction_text,
        env_extra: BTreeMap::new(),
        git_remote: inputs.ctx_config.git_remote.clone(),
        runtime_tag: inputs.runtime_tag.clone(),
        iteration: task.iteration,
    };

    let execution = match inputs.sandboxes.execute_task(&request).await {
        Ok(execution) => execution,
        Err(e) => {
            if inputs.ctx_config.git_remote.is_some() {
                inputs
                    .workspaces
                    .release_worktree(&inputs.mission_id, &task.id);
            }
            return infrastructure_failure(task, clock, e.to_string());
        }
    };

    let status = interpret_result(task.agent, &execution);
    task.status = status;
    task.file_changes = execution.file_changes.clone();
    task.elapsed_ms = execution.elapsed_ms;

    // Commit surviving work; failed attempts release their worktree
    // immediately, passing and verifying ones keep it for the quality
    // gate.
    if inputs.ctx_config.git_remote.is_some() {
        if status == TaskStatus::Failed {
            inputs
                .workspaces
                .release_worktree(&inputs.mission_id, &task.id);
        } else if let Err(e) = inputs.workspaces.commit_and_push(&task.id) {
            tracing::warn!(task_id = %task.id, error = %e, "commit failed (non-fatal)");
        }
    }

    inputs.metrics.record_timing(
        metric::TASK_ELAPSED_MS,
        &[("agent", agent_label.as_str())],
        execution.elapsed_ms,
    );
    inputs.events.publish(
        topic::TASK_COMPLETED,
        &inputs.mission_id,
        Some(&task.id),
        serde_json::json!({ "status": status.to_string(), "exit_code": execution.exit_code }),
    );

    let sandbox = SandboxInfo {
        sandbox_id: execution.sandbox_id.clone(),
        agent: task.agent,
        task_id: task.id.clone(),
        lifecycle_status: SandboxLifecycle::TornDown,
        started_at: Some(execution.started_at),
        completed_at: Some(execution.completed_at),
    };

    let result = WaveDispatchResult {
        task_id: task.id.clone(),
        status,
        file_changes: execution.file_changes,
        output: Some(execution.output),
        elapsed_ms: execution.elapsed_ms,
    };

    WorkerOutcome {
        task,
        result,
        sandbox: Some(sandbox),
        error: None,
    }
}

/// Interpret a sandbox result into the task's post-dispatch status.
///
/// Exit 0 or a non-empty change set counts as "executed". Coder and
/// refactorer attempts that changed nothing are failed regardless of exit
/// code (the lazy-model guard), and their successes still owe a quality
/// gate.
fn interpret_result(agent: AgentKind, execution: &ExecutionResult) -> TaskStatus {
    if agent.requires_file_changes() && execution.file_changes.is_empty() {
        return TaskStatus::Failed;
    }

    let executed = execution.exit_code == 0 || !execution.file_changes.is_empty();
    if !executed {
        return TaskStatus::Failed;
    }

    if agent.requires_quality_gate() {
        TaskStatus::Verifying
    } else {
        TaskStatus::Passed
    }
}

fn resolve_project_path(task: &Task, inputs: &WorkerInputs) -> Result<PathBuf> {
    match &inputs.ctx_config.git_remote {
        Some(remote) => {
            inputs
                .workspaces
                .create_mission_workspace(&inputs.mission_id, remote)?;
            let path = inputs.workspaces.acquire_worktree(
                &inputs.mission_id,
                &task.id,
                &inputs.ctx_config.git_base_branch,
            )?;
            Ok(path)
        }
        None => Ok(inputs.ctx_config.project_path.clone()),
    }
}

fn build_instruction(task: &Task, inputs: &WorkerInputs) -> String {
    match task.agent {
        AgentKind::Researcher => instruction::build_researcher(task, &inputs.project_context),
        AgentKind::Refactorer => {
            instruction::build_refactorer(task, &inputs.project_context, None)
        }
        AgentKind::Deployer => instruction::build_deployer(&instruction::DeployerInputs {
            task,
            mission_id: &inputs.mission_id,
            manifest_created_by_task: inputs.manifest_created_by_task,
            service_bindings: &inputs.service_bindings,
            app_type: &inputs.project_context.language.to_lowercase(),
            deployer: &inputs.ctx_config.deployer,
        }),
        AgentKind::Coder | AgentKind::Tester | AgentKind::Reviewer => {
            instruction::build(task, &inputs.project_context, inputs.reasoning_level)
        }
    }
}

/// Shape an infrastructure failure into the per-task result contract.
fn infrastructure_failure(mut task: Task, clock: Instant, message: String) -> WorkerOutcome {
    task.status = TaskStatus::Failed;
    let elapsed_ms = clock.elapsed().as_millis() as u64;
    task.elapsed_ms = elapsed_ms;

    tracing::error!(task_id = %task.id, error = %message, "task dispatch failed");

    let error = format!("{}: {}", task.id, message);
    let result = WaveDispatchResult {
        task_id: task.id.clone(),
        status: TaskStatus::Failed,
        file_changes: Vec::new(),
        output: Some(message),
        elapsed_ms,
    };

    WorkerOutcome {
        task,
        result,
        sandbox: None,
        error: Some(error),
    }
}
