//! Quality-gate evaluator.
//!
//! Runs inside the `evaluate_wave` node for every task in the finished
//! wave. Coder and refactorer results are verified by tester and reviewer
//! sub-dispatches before they count as complete; deployer results go
//! through deployment diagnosis; everything else is trusted as dispatched.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::deploy::{self, DeployOutcome};
use crate::events::topic;
use crate::graph::{MissionContext, MissionNode, NodeName};
use crate::instruction;
use crate::metrics::name as metric;
use crate::mission::model::{
    AgentKind, FailureStrategy, QualityGateDecision, ReviewFeedback, SandboxInfo,
    SandboxLifecycle, Task, TaskStatus, TestResult, WaveDispatchResult,
};
use crate::mission::{MissionPatch, MissionState};
use crate::planning::caller::{ParsedReviewOutput, ParsedTestOutput};
use crate::sandbox::ExecuteTaskRequest;

/// Evaluates every result of the finished wave.
pub struct EvaluateWaveNode;

/// Accumulated side-effects of one wave evaluation.
#[derive(Debug, Default)]
struct Effects {
    completed: Vec<String>,
    errors: Vec<String>,
    /// Last-write within the wave, matching the single retry-context
    /// channel.
    retry_context: Option<String>,
    mission_failed: bool,
    deployment_url: Option<String>,
    test_results: Vec<TestResult>,
    review_feedback: Vec<ReviewFeedback>,
    sandboxes: Vec<SandboxInfo>,
}

#[async_trait]
impl MissionNode for EvaluateWaveNode {
    fn name(&self) -> NodeName {
        NodeName::EvaluateWave
    }

    async fn run(&self, state: &MissionState, ctx: &MissionContext) -> Result<MissionPatch> {
        let mut tasks = state.tasks.clone();
        let mut effects = Effects::default();

        for result in &state.wave_dispatch_results {
            let Some(index) = tasks.iter().position(|t| t.id == result.task_id) else {
                effects.errors.push(format!(
                    "{}: dispatch result for unknown task",
                    result.task_id
                ));
                continue;
            };

            let task = &mut tasks[index];
            match task.agent {
                AgentKind::Deployer => {
                    evaluate_deployer(task, result, &mut effects, ctx, &state.mission_id);
                }
                agent if agent.requires_quality_gate() => {
                    evaluate_gated(task, result, state, ctx, &mut effects).await;
                }
                _ => {
                    evaluate_trusted(task, result, &mut effects, ctx, &state.mission_id);
                }
            }
        }

        let mut patch = MissionPatch {
            tasks: Some(tasks),
            completed_task_ids: effects.completed,
            errors: effects.errors,
            test_results: effects.test_results,
            review_feedback: effects.review_feedback,
            sandboxes: effects.sandboxes,
            ..MissionPatch::default()
        };
        if let Some(retry) = effects.retry_context {
            patch.retry_context = Some(Some(retry));
        }
        if effects.mission_failed {
            patch.status = Some(crate::mission::model::MissionStatus::Failed);
        }
        if let Some(url) = effects.deployment_url {
            patch.deployment_url = Some(url);
        }
        Ok(patch)
    }
}

// ---------------------------------------------------------------------------
// Decision rule
// ---------------------------------------------------------------------------

/// The deterministic gate decision.
///
/// Access is granted iff the tests passed, the review approved, and the
/// review score is at least 5. On denial the failure strategy comes from
/// the task while retries remain, escalating otherwise; a review that
/// scores 2 or lower and reads critical/broken/truncated escalates
/// immediately.
pub fn decide(task: &Task, test: &TestResult, review: &ReviewFeedback) -> QualityGateDecision {
    if test.passed && review.approved && review.score >= 5 {
        return QualityGateDecision {
            granted: true,
            strategy: None,
            reason: format!(
                "tests passed and review approved with score {}/10",
                review.score
            ),
        };
    }

    let mut reasons = Vec::new();
    if !test.passed {
        reasons.push(format!("{} of {} tests failed", test.failed, test.total));
    }
    if !review.approved {
        reasons.push("review not approved".to_owned());
    }
    if review.score < 5 {
        reasons.push(format!("review score {}/10 below threshold", review.score));
    }
    let reason = reasons.join("; ");

    let review_text = format!("{} {}", review.summary, review.issues.join(" ")).to_lowercase();
    let critical = review.score <= 2
        && ["critical", "broken", "truncated"]
            .iter()
            .any(|marker| review_text.contains(marker));

    let strategy = if critical {
        FailureStrategy::Escalate
    } else if task.retries_remaining() {
        task.on_failure
    } else {
        FailureStrategy::Escalate
    };

    QualityGateDecision {
        granted: false,
        strategy: Some(strategy),
        reason,
    }
}

// ---------------------------------------------------------------------------
// Strategy application
// ---------------------------------------------------------------------------

/// Apply a failure strategy's effects to the task and the wave effects.
fn apply_strategy(
    strategy: FailureStrategy,
    task: &mut Task,
    reason: &str,
    effects: &mut Effects,
) {
    match strategy {
        FailureStrategy::Retry => {
            task.iteration += 1;
            task.status = TaskStatus::Pending;
            effects.retry_context = Some(format!(
                "{} failed on attempt {}.\nReason: {}\nAddress the issues above before \
                 re-attempting the task.",
                task.id, task.iteration, reason
            ));
        }
        FailureStrategy::Skip => {
            task.status = TaskStatus::Failed;
            effects.completed.push(task.id.clone());
            effects.errors.push(format!(
                "warning: {} skipped after failure: {}",
                task.id, reason
            ));
        }
        FailureStrategy::Escalate => {
            task.status = TaskStatus::Failed;
            task.iteration = task.iteration.max(task.max_iterations);
            effects.mission_failed = true;
            effects.errors.push(format!(
                "{} escalated: {} (manual intervention required)",
                task.id, reason
            ));
        }
        FailureStrategy::Replan => {
            task.status = TaskStatus::Failed;
            task.iteration = task.iteration.max(task.max_iterations);
            effects.mission_failed = true;
            effects.errors.push(format!(
                "replanning: {} invalidated the current plan: {}",
                task.id, reason
            ));
        }
    }
}

/// Pick and apply the failure strategy for a failed attempt: the task's
/// own policy while retries remain, escalation otherwise.
fn apply_failure(task: &mut Task, reason: &str, effects: &mut Effects) -> FailureStrategy {
    let strategy = if task.retries_remaining() {
        task.on_failure
    } else {
        FailureStrategy::Escalate
    };
    apply_strategy(strategy, task, reason, effects);
    strategy
}

// ---------------------------------------------------------------------------
// Per-agent evaluation
// ---------------------------------------------------------------------------

/// Agents outside the gate (researcher, standalone tester/reviewer) are
/// trusted as dispatched.
fn evaluate_trusted(
    task: &mut Task,
    result: &WaveDispatchResult,
    effects: &mut Effects,
    ctx: &MissionContext,
    mission_id: &str,
) {
    if result.status == TaskStatus::Passed {
        task.status = TaskStatus::Passed;
        effects.completed.push(task.id.clone());
        return;
    }

    let reason = result
        .output
        .clone()
        .unwrap_or_else(|| "dispatch failed with no output".to_owned());
    let strategy = apply_failure(task, &reason, effects);
    note_retry(task, strategy, ctx, mission_id);
}

/// Deployer results bypass the quality gate; deployment diagnosis governs.
fn evaluate_deployer(
    task: &mut Task,
    result: &WaveDispatchResult,
    effects: &mut Effects,
    ctx: &MissionContext,
    mission_id: &str,
) {
    match deploy::analyze(result.output.as_deref()) {
        DeployOutcome::Success { deployment_url } => {
            task.status = TaskStatus::Passed;
            effects.completed.push(task.id.clone());
            if let Some(url) = deployment_url {
                effects.deployment_url = Some(url);
            }
            tracing::info!(task_id = %task.id, url = ?effects.deployment_url, "deployment succeeded");
        }
        DeployOutcome::Failure(diagnosis) => {
            ctx.events.publish(
                topic::DEPLOYMENT_DIAGNOSED,
                mission_id,
                Some(&task.id),
                serde_json::json!({
                    "category": diagnosis.category.to_string(),
                    "hint": diagnosis.hint,
                }),
            );

            if task.retries_remaining() {
                task.iteration += 1;
                task.status = TaskStatus::Pending;
                task.input_context = format!(
                    "## Deployment Diagnosis: {}\nHint: {}\n{}\n\n{}",
                    diagnosis.category, diagnosis.hint, diagnosis.enriched_context,
                    task.input_context
                );
                effects.retry_context = Some(diagnosis.retry_context(&task.id));
                note_retry(task, FailureStrategy::Retry, ctx, mission_id);
            } else {
                task.status = TaskStatus::Failed;
                effects.mission_failed = true;
                effects.errors.push(diagnosis.terminal_message(&task.id));
            }
        }
    }
}

/// Coder and refactorer results: tester and reviewer sub-dispatch, then
/// the decision rule.
async fn evaluate_gated(
    task: &mut Task,
    result: &WaveDispatchResult,
    state: &MissionState,
    ctx: &MissionContext,
    effects: &mut Effects,
) {
    if result.status == TaskStatus::Failed {
        let reason = result
            .output
            .clone()
            .unwrap_or_else(|| "dispatch failed with no output".to_owned());
        let strategy = apply_failure(task, &reason, effects);
        note_retry(task, strategy, ctx, &state.mission_id);
        return;
    }

    // Lazy-model guard: a "passing" attempt that changed nothing retries
    // without burning tester or reviewer sandboxes.
    if result.file_changes.is_empty() {
        let strategy = apply_failure(task, "no file changes produced", effects);
        note_retry(task, strategy, ctx, &state.mission_id);
        return;
    }

    let project_context = state
        .project_context
        .clone()
        .unwrap_or_else(crate::mission::model::ProjectContext::unknown);
    let project_path = gate_project_path(task, ctx);
    let runtime_tag = state
        .classification
        .as_ref()
        .map(|c| c.runtime_tag.clone())
        .unwrap_or_else(|| "base".to_owned());

    // Tester sub-dispatch.
    let tester_instruction =
        instruction::build_tester(task, &project_context, &result.file_changes);
    let test_result = run_sub_dispatch(
        ctx,
        effects,
        AgentKind::Tester,
        task,
        &project_path,
        &runtime_tag,
        tester_instruction,
    )
    .await;

    let test_result = match test_result {
        Ok(raw) => match ctx.caller.parse_test_output(&raw).await {
            Ok(parsed) => test_result_from(task, parsed, raw),
            Err(e) => tester_infra_error(task, &format!("output parsing failed: {e}")),
        },
        Err(message) => tester_infra_error(task, &message),
    };

    // Reviewer sub-dispatch.
    let reviewer_instruction = instruction::build_reviewer(
        task,
        &project_context,
        &result.file_changes,
        &test_result,
    );
    let review_feedback = run_sub_dispatch(
        ctx,
        effects,
        AgentKind::Reviewer,
        task,
        &project_path,
        &runtime_tag,
        reviewer_instruction,
    )
    .await;

    let review_feedback = match review_feedback {
        Ok(raw) => match ctx.caller.parse_review_output(&raw).await {
            Ok(parsed) => review_feedback_from(task, parsed),
            Err(e) => reviewer_infra_error(task, &format!("output parsing failed: {e}")),
        },
        Err(message) => reviewer_infra_error(task, &message),
    };

    let decision = decide(task, &test_result, &review_feedback);

    ctx.metrics.incr_counter(
        metric::QUALITY_GATE_DECISIONS_TOTAL,
        &[("granted", if decision.granted { "true" } else { "false" })],
    );
    ctx.events.publish(
        topic::QUALITY_GATE_DECIDED,
        &state.mission_id,
        Some(&task.id),
        serde_json::json!({
            "granted": decision.granted,
            "reason": decision.reason,
            "strategy": decision.strategy.map(|s| s.to_string()),
        }),
    );

    effects.test_results.push(test_result);
    effects.review_feedback.push(review_feedback);

    if decision.granted {
        task.status = TaskStatus::Passed;
        effects.completed.push(task.id.clone());
    } else {
        let strategy = decision.strategy.unwrap_or(FailureStrategy::Escalate);
        apply_strategy(strategy, task, &decision.reason, effects);
        note_retry(task, strategy, ctx, &state.mission_id);
    }

    // The gate is done with this attempt's worktree either way.
    if ctx.config.git_remote.is_some() {
        ctx.workspaces.release_worktree(&state.mission_id, &task.id);
    }
}

/// Run one tester or reviewer sandbox and return its raw output, mapping
/// every infrastructure failure to an error message.
async fn run_sub_dispatch(
    ctx: &MissionContext,
    effects: &mut Effects,
    agent: AgentKind,
    task: &Task,
    project_path: &PathBuf,
    runtime_tag: &str,
    instruction_text: String,
) -> Result<String, String> {
    let sub_task_id = format!("{}-{}", task.id, agent.to_string().to_lowercase());

    let request = ExecuteTaskRequest {
        agent,
        task_id: sub_task_id.clone(),
        project_path: project_path.clone(),
        instruction_text,
        env_extra: BTreeMap::new(),
        git_remote: ctx.config.git_remote.clone(),
        runtime_tag: runtime_tag.to_owned(),
        iteration: task.iteration,
    };

    let agent_label = agent.to_string();
    ctx.metrics
        .incr_counter(metric::DISPATCH_TOTAL, &[("agent", agent_label.as_str())]);

    match ctx.sandboxes.execute_task(&request).await {
        Ok(execution) => {
            effects.sandboxes.push(SandboxInfo {
                sandbox_id: execution.sandbox_id.clone(),
                agent,
                task_id: sub_task_id,
                lifecycle_status: SandboxLifecycle::TornDown,
                started_at: Some(execution.started_at),
                completed_at: Some(execution.completed_at),
            });
            ctx.metrics.record_timing(
                metric::TASK_ELAPSED_MS,
                &[("agent", agent_label.as_str())],
                execution.elapsed_ms,
            );
            Ok(execution.output)
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Working directory the gate sub-dispatches run against.
fn gate_project_path(task: &Task, ctx: &MissionContext) -> PathBuf {
    if ctx.config.git_remote.is_some() {
        if let Some(path) = ctx.workspaces.worktree_path(&task.id) {
            return path;
        }
    }
    ctx.config.project_path.clone()
}

fn test_result_from(task: &Task, parsed: ParsedTestOutput, raw: String) -> TestResult {
    TestResult {
        task_id: task.id.clone(),
        passed: parsed.passed,
        total: parsed.total,
        failed: parsed.failed,
        duration_ms: parsed.duration_ms,
        output: raw,
    }
}

fn review_feedback_from(task: &Task, parsed: ParsedReviewOutput) -> ReviewFeedback {
    ReviewFeedback {
        task_id: task.id.clone(),
        approved: parsed.approved,
        score: parsed.score.min(10),
        summary: parsed.summary,
        issues: parsed.issues,
        suggestions: parsed.suggestions,
    }
}

fn tester_infra_error(task: &Task, message: &str) -> TestResult {
    TestResult {
        task_id: task.id.clone(),
        passed: false,
        total: 0,
        failed: 0,
        duration_ms: 0,
        output: format!("TESTER infrastructure error: {message}"),
    }
}

fn reviewer_infra_error(task: &Task, message: &str) -> ReviewFeedback {
    ReviewFeedback {
        task_id: task.id.clone(),
        approved: false,
        score: 0,
        summary: format!("REVIEWER infrastructure error: {message}"),
        issues: Vec::new(),
        suggestions: Vec::new(),
    }
}

fn note_retry(task: &Task, strategy: FailureStrategy, ctx: &MissionContext, mission_id: &str) {
    if strategy == FailureStrategy::Retry {
        let agent_label = task.agent.to_string();
        ctx.metrics
            .incr_counter(metric::RETRY_TOTAL, &[("agent", agent_label.as_str())]);
        ctx.events.publish(
            topic::TASK_RETRYING,
            mission_id,
            Some(&task.id),
            serde_json::json!({
                "iteration": task.iteration,
                "max_iterations": task.max_iterations,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coder_task() -> Task {
        Task::new("TASK-001", AgentKind::Coder, "implement feature")
    }

    fn test_result(passed: bool, total: u32, failed: u32) -> TestResult {
        TestResult {
            task_id: "TASK-001".to_owned(),
            passed,
            total,
            failed,
            duration_ms: 100,
            output: String::new(),
        }
    }

    fn review(approved: bool, score: u8) -> ReviewFeedback {
        ReviewFeedback {
            task_id: "TASK-001".to_owned(),
            approved,
            score,
            summary: String::new(),
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    #[test]
    fn granted_requires_all_three() {
        let task = coder_task();

        let decision = decide(&task, &test_result(true, 10, 0), &review(true, 9));
        assert!(decision.granted);
        assert!(decision.strategy.is_none());

        // Tests failing denies.
        let decision = decide(&task, &test_result(false, 10, 2), &review(true, 9));
        assert!(!decision.granted);
        assert!(decision.reason.contains("2 of 10 tests failed"));

        // Review disapproval denies.
        let decision = decide(&task, &test_result(true, 10, 0), &review(false, 9));
        assert!(!decision.granted);

        // Score below 5 denies even when approved.
        let decision = decide(&task, &test_result(true, 10, 0), &review(true, 4));
        assert!(!decision.granted);
        assert!(decision.reason.contains("below threshold"));
    }

    #[test]
    fn boundary_score_of_five_passes() {
        let task = coder_task();
        let decision = decide(&task, &test_result(true, 1, 0), &review(true, 5));
        assert!(decision.granted);
    }

    #[test]
    fn denial_uses_task_policy_while_retries_remain() {
        let task = coder_task();
        let decision = decide(&task, &test_result(false, 5, 5), &review(true, 8));
        assert_eq!(decision.strategy, Some(FailureStrategy::Retry));
    }

    #[test]
    fn denial_escalates_when_retries_exhausted() {
        let mut task = coder_task();
        task.iteration = task.max_iterations;
        let decision = decide(&task, &test_result(false, 5, 5), &review(true, 8));
        assert_eq!(decision.strategy, Some(FailureStrategy::Escalate));
    }

    #[test]
    fn critical_low_score_overrides_to_escalate() {
        let task = coder_task();
        let mut bad_review = review(false, 1);
        bad_review.summary = "The implementation is fundamentally broken".to_owned();

        let decision = decide(&task, &test_result(true, 5, 0), &bad_review);
        assert_eq!(decision.strategy, Some(FailureStrategy::Escalate));

        // Same score without the critical wording follows task policy.
        let mild = review(false, 1);
        let decision = decide(&task, &test_result(true, 5, 0), &mild);
        assert_eq!(decision.strategy, Some(FailureStrategy::Retry));
    }

    #[test]
    fn retry_strategy_bumps_iteration_and_writes_context() {
        let mut task = coder_task();
        let mut effects = Effects::default();

        apply_strategy(FailureStrategy::Retry, &mut task, "2 tests failed", &mut effects);

        assert_eq!(task.iteration, 1);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(effects.completed.is_empty());
        let retry = effects.retry_context.expect("retry context written");
        assert!(retry.contains("TASK-001"));
        assert!(retry.contains("2 tests failed"));
    }

    #[test]
    fn skip_completes_with_warning() {
        let mut task = coder_task();
        let mut effects = Effects::default();

        apply_strategy(FailureStrategy::Skip, &mut task, "flaky", &mut effects);

        assert_eq!(effects.completed, vec!["TASK-001"]);
        assert!(effects.errors[0].starts_with("warning:"));
        assert!(!effects.mission_failed);
    }

    #[test]
    fn escalate_fails_mission_with_actionable_error() {
        let mut task = coder_task();
        let mut effects = Effects::default();

        apply_strategy(FailureStrategy::Escalate, &mut task, "review rejected", &mut effects);

        assert!(effects.mission_failed);
        assert!(effects.errors[0].contains("TASK-001"));
        assert!(effects.errors[0].contains("review rejected"));
        assert!(task.is_terminal_failure());
    }

    #[test]
    fn replan_is_terminal_with_marker() {
        let mut task = coder_task();
        let mut effects = Effects::default();

        apply_strategy(FailureStrategy::Replan, &mut task, "plan invalid", &mut effects);

        assert!(effects.mission_failed);
        assert!(effects.errors[0].starts_with("replanning:"));
    }

    #[test]
    fn apply_failure_escalates_once_exhausted() {
        let mut task = coder_task();
        task.iteration = task.max_iterations;
        let mut effects = Effects::default();

        let strategy = apply_failure(&mut task, "still failing", &mut effects);
        assert_eq!(strategy, FailureStrategy::Escalate);
        assert!(effects.mission_failed);
    }

    #[test]
    fn infra_error_synthesis_shapes() {
        let task = coder_task();

        let test = tester_infra_error(&task, "provider unavailable");
        assert!(!test.passed);
        assert!(test.output.contains("TESTER infrastructure error"));

        let review = reviewer_infra_error(&task, "provider unavailable");
        assert!(!review.approved);
        assert_eq!(review.score, 0);
        assert!(review.summary.contains("REVIEWER infrastructure error"));

        // The decision rule still runs on synthesized results.
        let decision = decide(&task, &test, &review);
        assert!(!decision.granted);
    }
}
