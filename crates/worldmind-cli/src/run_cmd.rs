//! The `run` and `resume` commands: build the mission context, drive the
//! graph, and translate the terminal state into an exit code.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use worldmind_core::checkpoint::{CheckpointStore, MemoryCheckpointStore, SqlCheckpointStore};
use worldmind_core::config::WorldmindConfig;
use worldmind_core::events::{EventBus, topic};
use worldmind_core::graph::{MissionContext, MissionGraph};
use worldmind_core::metrics::TracingSink;
use worldmind_core::mission::MissionState;
use worldmind_core::mission::model::{
    InteractionMode, MissionStatus, MissionSubmission, ReasoningLevel,
};
use worldmind_core::planning::caller::AutoApprove;
use worldmind_core::planning::scanner::FsProjectScanner;
use worldmind_core::sandbox::container::{ContainerProvider, ContainerProviderConfig};
use worldmind_core::sandbox::instruction_store::InstructionStore;
use worldmind_core::sandbox::SandboxManager;
use worldmind_core::worktree::WorkspaceManager;
use worldmind_db::config::DbConfig;
use worldmind_db::pool;

use crate::caller::ExternalProcessCaller;
use crate::config as cli_config;

/// Exit codes per the mission-runner contract.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const PLANNING_FAILURE: i32 = 2;
    pub const DISPATCH_INFRA_ERROR: i32 = 3;
    pub const QUALITY_GATE_ESCALATION: i32 = 4;
    pub const DEPLOYMENT_ESCALATION: i32 = 5;
    pub const INTERNAL_ERROR: i32 = 70;
}

/// Options shared by `run` and `resume`.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub project: PathBuf,
    pub database_url: Option<String>,
    pub caller_command: Option<String>,
    pub memory_checkpoints: bool,
    pub max_parallel: Option<usize>,
    pub git_remote: Option<String>,
}

/// Run a fresh mission.
pub async fn run_mission(
    request: String,
    interaction_mode: InteractionMode,
    create_cf_deployment: bool,
    reasoning_level: Option<ReasoningLevel>,
    thread_id: Option<String>,
    options: RuntimeOptions,
) -> Result<i32> {
    let submission = MissionSubmission {
        request,
        interaction_mode,
        create_cf_deployment,
        prd_document: None,
        reasoning_level,
    };
    let state = MissionState::from_submission(&submission, thread_id);

    let (ctx, store) = build_runtime(&options).await?;
    let graph = MissionGraph::standard();

    println!("mission {} (thread {})", state.mission_id, state.thread_id);

    let printer = spawn_event_printer(&ctx.events);
    let final_state = graph.run(state, &ctx, store.as_ref()).await?;
    printer.abort();
    print_summary(&final_state);
    Ok(exit_code_for(&final_state))
}

/// Resume a mission from its latest checkpoint.
pub async fn resume_mission(thread_id: String, options: RuntimeOptions) -> Result<i32> {
    let (ctx, store) = build_runtime(&options).await?;
    let graph = MissionGraph::standard();

    let printer = spawn_event_printer(&ctx.events);
    let final_state = graph.resume(&thread_id, &ctx, store.as_ref()).await?;
    printer.abort();
    print_summary(&final_state);
    Ok(exit_code_for(&final_state))
}

/// Print progress events as they arrive; noisy topics are filtered out.
fn spawn_event_printer(events: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let interesting = matches!(
                        event.topic.as_str(),
                        topic::WAVE_SCHEDULED
                            | topic::TASK_DISPATCHED
                            | topic::TASK_COMPLETED
                            | topic::TASK_RETRYING
                            | topic::QUALITY_GATE_DECIDED
                            | topic::DEPLOYMENT_DIAGNOSED
                            | topic::OSCILLATION_DETECTED
                    );
                    if interesting {
                        println!(
                            "[{}] {} {}",
                            event.topic,
                            event.task_id.as_deref().unwrap_or("-"),
                            event.payload
                        );
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    println!("(event stream lagged, {skipped} events skipped)");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Assemble the mission context and checkpoint store from CLI options.
async fn build_runtime(
    options: &RuntimeOptions,
) -> Result<(MissionContext, Arc<dyn CheckpointStore>)> {
    let file = cli_config::load_config()?;

    let Some(caller_command) =
        cli_config::resolve_caller_command(options.caller_command.as_deref(), &file)
    else {
        bail!(
            "no structured caller configured; set caller.command in {} or pass --caller-cmd",
            cli_config::config_path().display()
        );
    };

    let mut config = WorldmindConfig::for_project(&options.project);
    config.git_remote = options.git_remote.clone();
    if let Some(max_parallel) = options.max_parallel {
        config.dispatch.max_parallel = max_parallel;
    }
    if let Some(domain) = &file.deployer.apps_domain {
        config.deployer.apps_domain = domain.clone();
    }
    config.validate()?;
    let config = Arc::new(config);

    let store: Arc<dyn CheckpointStore> = if options.memory_checkpoints {
        Arc::new(MemoryCheckpointStore::new())
    } else {
        let db_config = DbConfig::new(cli_config::resolve_database_url(
            options.database_url.as_deref(),
            &file,
        ));
        pool::ensure_database_exists(&db_config)
            .await
            .context("failed to ensure checkpoint database exists")?;
        let pg = pool::create_pool(&db_config)
            .await
            .context("failed to connect to checkpoint database")?;
        Arc::new(SqlCheckpointStore::new(pg))
    };

    let instruction_store = Arc::new(InstructionStore::with_random_secret());
    let provider = Arc::new(ContainerProvider::new(ContainerProviderConfig {
        image_repository: config.sandbox.image_repository.clone(),
        ..ContainerProviderConfig::default()
    }));
    let sandboxes = Arc::new(SandboxManager::new(
        Arc::clone(&config),
        provider,
        Arc::clone(&instruction_store),
    ));

    let workspace_base = options.project.join(".worldmind-workspaces");
    let workspaces = Arc::new(WorkspaceManager::new(workspace_base));

    let ctx = MissionContext {
        config,
        caller: Arc::new(ExternalProcessCaller::new(caller_command)),
        scanner: Arc::new(FsProjectScanner),
        approval: Arc::new(AutoApprove),
        sandboxes,
        workspaces,
        events: Arc::new(EventBus::default()),
        metrics: Arc::new(TracingSink),
        cancel: CancellationToken::new(),
    };

    Ok((ctx, store))
}

fn print_summary(state: &MissionState) {
    println!("status: {}", state.status);
    if let Some(metrics) = &state.metrics {
        println!(
            "tasks: {} completed, {} failed over {} waves",
            metrics.tasks_completed, metrics.tasks_failed, metrics.waves_executed
        );
        println!(
            "tests: {}/{} passed",
            metrics.tests_passed, metrics.tests_run
        );
    }
    if let Some(url) = &state.deployment_url {
        println!("deployed at: {url}");
    }
    for error in &state.errors {
        println!("error: {error}");
    }
}

/// Map a terminal mission state onto the runner exit codes.
pub fn exit_code_for(state: &MissionState) -> i32 {
    match state.status {
        MissionStatus::Completed => exit_code::SUCCESS,
        MissionStatus::Failed => {
            let errors = state.errors.join("\n");
            if errors.contains("classification failed")
                || errors.contains("clarification failed")
                || errors.contains("specification failed")
                || errors.contains("planning failed")
                || errors.contains("empty task list")
                || errors.contains("plan approval rejected")
            {
                exit_code::PLANNING_FAILURE
            } else if errors.contains("Deployment failed") {
                exit_code::DEPLOYMENT_ESCALATION
            } else if errors.contains("escalated") {
                exit_code::QUALITY_GATE_ESCALATION
            } else if errors.contains("provider unavailable")
                || errors.contains("failed to materialize instruction")
                || errors.contains("worktree setup failed")
            {
                exit_code::DISPATCH_INFRA_ERROR
            } else {
                exit_code::INTERNAL_ERROR
            }
        }
        // A mission that stopped anywhere short of a terminal state is an
        // internal error at the runner level.
        _ => exit_code::INTERNAL_ERROR,
    }
}
