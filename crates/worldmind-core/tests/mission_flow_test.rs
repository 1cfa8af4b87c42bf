//! End-to-end mission scenarios over scripted providers and callers.

mod common;

use std::sync::atomic::Ordering;

use common::{
    ScriptedRun, TestHarness, approving_review, draft_task, plan_draft,
};
use worldmind_core::checkpoint::CheckpointStore;
use worldmind_core::metrics::name as metric;
use worldmind_core::mission::model::{
    AgentKind, ExecutionStrategy, MissionStatus, TaskStatus,
};
use worldmind_core::planning::caller::ParsedReviewOutput;

#[tokio::test]
async fn single_coder_happy_path_completes() {
    let draft = plan_draft(
        ExecutionStrategy::Sequential,
        vec![draft_task(AgentKind::Coder, "create hello.py")],
    );
    let harness = TestHarness::new(draft, |_| {});
    harness
        .provider
        .script("TASK-001", ScriptedRun::writing("hello.py", "print('hello')\n"));

    let state = harness.run("create hello.py").await;

    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(state.completed_task_ids, vec!["TASK-001"]);
    assert!(state.deployment_url.is_none());

    let task = state.task("TASK-001").unwrap();
    assert_eq!(task.status, TaskStatus::Passed);

    let metrics = state.metrics.expect("converge writes metrics");
    assert_eq!(metrics.tasks_completed, 1);
    assert_eq!(metrics.tasks_failed, 0);
    assert_eq!(metrics.total_iterations, 0, "no retries on the happy path");
    assert_eq!(metrics.waves_executed, 1);
    assert_eq!(metrics.files_created, 1);

    // The quality gate ran exactly one tester and one reviewer.
    assert_eq!(harness.caller.parse_test_calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.caller.parse_review_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness
            .metrics
            .counter(metric::QUALITY_GATE_DECISIONS_TOTAL, &[("granted", "true")]),
        1
    );
}

#[tokio::test]
async fn lazy_model_guard_fails_without_invoking_gate() {
    let draft = plan_draft(
        ExecutionStrategy::Sequential,
        vec![draft_task(AgentKind::Coder, "create hello.py")],
    );
    let harness = TestHarness::new(draft, |_| {});
    // Every attempt exits 0 but writes nothing.

    let state = harness.run("create hello.py").await;

    assert_eq!(state.status, MissionStatus::Failed);
    assert!(state.completed_task_ids.is_empty());

    // The gate never dispatched a tester or reviewer.
    assert_eq!(harness.caller.parse_test_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.caller.parse_review_calls.load(Ordering::SeqCst), 0);
    assert!(
        !harness
            .provider
            .dispatched()
            .iter()
            .any(|id| id.contains("tester") || id.contains("reviewer")),
        "no tester/reviewer sandboxes for empty-change attempts"
    );

    // Each failed attempt produced a retry until the budget ran out.
    assert_eq!(
        harness
            .metrics
            .counter(metric::RETRY_TOTAL, &[("agent", "CODER")]),
        3
    );
    let task = state.task("TASK-001").unwrap();
    assert_eq!(task.iteration, 3);

    // The retry context referenced the failing task while in flight.
    let checkpoints = harness.store.list(&state.thread_id).await.unwrap();
    let saw_retry_context = checkpoints.iter().any(|cp| {
        cp.state
            .retry_context
            .as_deref()
            .is_some_and(|ctx| ctx.contains("TASK-001"))
    });
    assert!(saw_retry_context, "retry context names the failed task");
}

#[tokio::test]
async fn oscillating_waves_force_failed_convergence() {
    let mut task_x = draft_task(AgentKind::Coder, "x");
    task_x.max_iterations = Some(20);
    let mut task_y = draft_task(AgentKind::Coder, "y");
    task_y.max_iterations = Some(20);

    let draft = plan_draft(ExecutionStrategy::Parallel, vec![task_x, task_y]);
    let harness = TestHarness::new(draft, |config| {
        config.dispatch.max_parallel = 2;
    });
    // Both tasks fail every attempt (exit 0, no file changes), so the wave
    // fingerprint never changes.

    let state = harness.run("two stuck tasks").await;

    assert_eq!(state.status, MissionStatus::Failed);
    assert!(
        state
            .errors
            .iter()
            .any(|e| e.contains("oscillation_detected")),
        "errors: {:?}",
        state.errors
    );
    assert_eq!(
        harness
            .metrics
            .counter(metric::OSCILLATION_DETECTED_TOTAL, &[]),
        1
    );
    // The detector fired after the threshold, not at the retry cap.
    assert!(state.wave_count <= 8, "wave_count = {}", state.wave_count);
}

#[tokio::test]
async fn gate_denial_retries_then_passes() {
    let draft = plan_draft(
        ExecutionStrategy::Sequential,
        vec![draft_task(AgentKind::Coder, "implement endpoint")],
    );
    let harness = TestHarness::new(draft, |_| {});
    harness
        .provider
        .script("TASK-001", ScriptedRun::writing("api.py", "v1"));
    harness
        .provider
        .script("TASK-001", ScriptedRun::writing("api.py", "v2 with error handling"));

    // First review rejects with a low (but not critical) score, second
    // approves.
    harness.caller.script_review(ParsedReviewOutput {
        approved: false,
        score: 3,
        summary: "missing error handling".to_owned(),
        issues: vec!["no input validation".to_owned()],
        suggestions: Vec::new(),
    });
    harness.caller.script_review(approving_review());

    let state = harness.run("implement endpoint").await;

    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(state.completed_task_ids, vec!["TASK-001"]);

    let task = state.task("TASK-001").unwrap();
    assert_eq!(task.iteration, 1, "one retry consumed");
    assert!(
        task.input_context.contains("Retry Context (from previous attempt)"),
        "second attempt carried the retry block"
    );

    assert_eq!(
        harness
            .metrics
            .counter(metric::QUALITY_GATE_DECISIONS_TOTAL, &[("granted", "false")]),
        1
    );
    assert_eq!(
        harness
            .metrics
            .counter(metric::QUALITY_GATE_DECISIONS_TOTAL, &[("granted", "true")]),
        1
    );
    assert_eq!(state.review_feedback.len(), 2);
}

#[tokio::test]
async fn provider_outage_is_captured_per_task() {
    let draft = plan_draft(
        ExecutionStrategy::Sequential,
        vec![draft_task(AgentKind::Researcher, "survey the codebase")],
    );
    let harness = TestHarness::new(draft, |_| {});
    for _ in 0..4 {
        harness.provider.script("TASK-001", ScriptedRun::failing_open());
    }

    let state = harness.run("survey the codebase").await;

    assert_eq!(state.status, MissionStatus::Failed);
    assert!(
        state
            .errors
            .iter()
            .any(|e| e.starts_with("TASK-001:") && e.contains("provider unavailable")),
        "errors: {:?}",
        state.errors
    );
}

#[tokio::test]
async fn dependent_tasks_run_in_dependency_order() {
    let draft = plan_draft(
        ExecutionStrategy::Parallel,
        vec![
            draft_task(AgentKind::Researcher, "find the auth module"),
            draft_task(AgentKind::Coder, "add logout endpoint"),
        ],
    );
    let harness = TestHarness::new(draft, |_| {});
    harness
        .provider
        .script("TASK-002", ScriptedRun::writing("logout.py", "ok"));

    let state = harness.run("add logout").await;

    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(state.completed_task_ids, vec!["TASK-001", "TASK-002"]);

    // The coder depends on the researcher, so its sandbox opened later.
    let dispatched = harness.provider.dispatched();
    let researcher = dispatched.iter().position(|id| id == "TASK-001").unwrap();
    let coder = dispatched.iter().position(|id| id == "TASK-002").unwrap();
    assert!(researcher < coder);

    let metrics = state.metrics.unwrap();
    assert_eq!(metrics.waves_executed, 2, "one wave per dependency level");
}

#[tokio::test]
async fn rejected_plan_fails_before_any_dispatch() {
    use async_trait::async_trait;
    use std::sync::Arc;
    use worldmind_core::graph::MissionContext;
    use worldmind_core::mission::MissionState;
    use worldmind_core::mission::model::InteractionMode;
    use worldmind_core::planning::caller::ApprovalGate;

    struct RejectAll;

    #[async_trait]
    impl ApprovalGate for RejectAll {
        async fn await_approval(&self, _mission_id: &str, _task_count: usize) -> bool {
            false
        }
    }

    let harness = TestHarness::new(
        plan_draft(
            ExecutionStrategy::Sequential,
            vec![draft_task(AgentKind::Coder, "never runs")],
        ),
        |_| {},
    );

    // Same collaborators, but a gate that rejects every plan.
    let ctx = MissionContext {
        config: Arc::clone(&harness.ctx.config),
        caller: Arc::clone(&harness.ctx.caller),
        scanner: Arc::clone(&harness.ctx.scanner),
        approval: Arc::new(RejectAll),
        sandboxes: Arc::clone(&harness.ctx.sandboxes),
        workspaces: Arc::clone(&harness.ctx.workspaces),
        events: Arc::clone(&harness.ctx.events),
        metrics: Arc::clone(&harness.ctx.metrics),
        cancel: harness.ctx.cancel.clone(),
    };

    let mut submission = common::submission("needs approval");
    submission.interaction_mode = InteractionMode::ApprovePlan;
    let state = MissionState::from_submission(&submission, None);

    let state = harness
        .graph
        .run(state, &ctx, harness.store.as_ref())
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Failed);
    assert!(state.errors.iter().any(|e| e.contains("plan approval rejected")));
    assert!(
        harness.provider.dispatched().is_empty(),
        "no sandbox opens for a rejected plan"
    );
}

#[tokio::test]
async fn skip_strategy_counts_task_complete_with_warning() {
    let mut flaky = draft_task(AgentKind::Researcher, "optional survey");
    flaky.on_failure = Some(worldmind_core::mission::model::FailureStrategy::Skip);

    let draft = plan_draft(ExecutionStrategy::Sequential, vec![flaky]);
    let harness = TestHarness::new(draft, |_| {});
    harness.provider.script(
        "TASK-001",
        ScriptedRun {
            exit_code: 1,
            output: "no luck".to_owned(),
            ..ScriptedRun::default()
        },
    );

    let state = harness.run("optional survey").await;

    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(state.completed_task_ids, vec!["TASK-001"]);
    assert!(state.errors.iter().any(|e| e.starts_with("warning:")));
}
