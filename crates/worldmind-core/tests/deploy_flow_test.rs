//! Deployer mission scenarios: diagnosis, retry, and route capture.

mod common;

use common::{ScriptedRun, TestHarness, draft_task, plan_draft};
use worldmind_core::checkpoint::CheckpointStore;
use worldmind_core::mission::model::{AgentKind, ExecutionStrategy, MissionStatus};

#[tokio::test]
async fn build_failure_with_exhausted_retries_fails_mission() {
    let mut deployer = draft_task(AgentKind::Deployer, "deploy the service");
    deployer.max_iterations = Some(0);

    let draft = plan_draft(ExecutionStrategy::Sequential, vec![deployer]);
    let harness = TestHarness::new(draft, |_| {});
    harness.provider.script(
        "TASK-001",
        ScriptedRun::with_output(
            "[INFO] Building...\n[ERROR] BUILD FAILURE\n[ERROR] Failed to execute goal\n",
        ),
    );

    let state = harness.run("deploy the service").await;

    assert_eq!(state.status, MissionStatus::Failed);
    assert!(state.deployment_url.is_none());
    assert!(
        state
            .errors
            .iter()
            .any(|e| e.contains("Deployment failed") && e.contains("pom.xml")),
        "errors: {:?}",
        state.errors
    );
}

#[tokio::test]
async fn health_check_timeout_retries_then_succeeds() {
    let draft = plan_draft(
        ExecutionStrategy::Sequential,
        vec![draft_task(AgentKind::Deployer, "deploy the service")],
    );
    let harness = TestHarness::new(draft, |_| {});
    harness.provider.script(
        "TASK-001",
        ScriptedRun::with_output("Timed out waiting for health check\n"),
    );
    harness.provider.script(
        "TASK-001",
        ScriptedRun::with_output(
            "status: running\nroutes: wmnd-2026-0001.apps.example.com\n",
        ),
    );

    let state = harness.run("deploy the service").await;

    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(
        state.deployment_url.as_deref(),
        Some("wmnd-2026-0001.apps.example.com")
    );
    assert_eq!(state.completed_task_ids, vec!["TASK-001"]);

    let task = state.task("TASK-001").unwrap();
    assert_eq!(task.iteration, 1, "one diagnosis-driven retry");
    assert!(
        task.input_context.contains("HEALTH_CHECK_TIMEOUT"),
        "retry carried the diagnosis category: {:?}",
        task.input_context
    );

    // The first wave recorded a retry context naming the diagnosis.
    let checkpoints = harness.store.list(&state.thread_id).await.unwrap();
    assert!(
        checkpoints.iter().any(|cp| {
            cp.state
                .retry_context
                .as_deref()
                .is_some_and(|ctx| ctx.contains("HEALTH_CHECK_TIMEOUT"))
        }),
        "retry context recorded the diagnosis"
    );
}

#[tokio::test]
async fn service_binding_failure_names_the_service() {
    let mut deployer = draft_task(AgentKind::Deployer, "deploy");
    deployer.max_iterations = Some(0);

    let draft = plan_draft(ExecutionStrategy::Sequential, vec![deployer]);
    let harness = TestHarness::new(draft, |_| {});
    harness.provider.script(
        "TASK-001",
        ScriptedRun::with_output("Binding service 'postgres-db' to app wmnd ... FAILED\n"),
    );

    let state = harness.run("deploy").await;

    assert_eq!(state.status, MissionStatus::Failed);
    assert!(
        state
            .errors
            .iter()
            .any(|e| e.contains("postgres-db") && e.contains("SERVICE_BINDING_FAILURE")),
        "errors: {:?}",
        state.errors
    );
}

#[tokio::test]
async fn deployment_task_appended_for_cf_missions() {
    // A coder-only draft plus the cf-deploy flag produces an appended
    // deployer wired after the coder.
    let draft = plan_draft(
        ExecutionStrategy::Sequential,
        vec![draft_task(AgentKind::Coder, "build the api")],
    );
    let harness = TestHarness::new(draft, |_| {});
    harness
        .provider
        .script("TASK-001", ScriptedRun::writing("api.py", "ok"));
    harness
        .provider
        .script("TASK-002", ScriptedRun::with_output("status: running\napp-x.apps.example.com\n"));

    let mut submission = common::submission("build and deploy");
    submission.create_cf_deployment = true;
    let state = worldmind_core::mission::MissionState::from_submission(&submission, None);
    let state = harness
        .graph
        .run(state, &harness.ctx, harness.store.as_ref())
        .await
        .unwrap();

    assert_eq!(state.status, MissionStatus::Completed);
    assert_eq!(state.tasks.len(), 2);
    let deployer = state.task("TASK-002").unwrap();
    assert_eq!(deployer.agent, AgentKind::Deployer);
    assert_eq!(deployer.dependencies, vec!["TASK-001"]);
    assert_eq!(deployer.target_files, vec!["manifest.yml"]);
    assert_eq!(state.deployment_url.as_deref(), Some("app-x.apps.example.com"));
}
