//! Deterministic plan normalization.
//!
//! The planner proposes tasks; this module makes the result lawful:
//! sequential `TASK-NNN` ids, agent-typed dependency rewriting that
//! overrides whatever the planner proposed, degenerate-plan repair (a plan
//! with review or refactor work but no coder gets one injected), and the
//! deployment task appended when the mission asked for it.

use crate::mission::model::{AgentKind, FailureStrategy, Task};
use super::caller::{DraftTask, PlanDraft};

/// Default retry budget for planned tasks.
const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Normalize a plan draft into the mission's task list.
pub fn normalize_plan(draft: &PlanDraft, create_cf_deployment: bool) -> Vec<Task> {
    let mut drafts: Vec<DraftTask> = draft.tasks.clone();

    repair_degenerate(&mut drafts);

    if create_cf_deployment && !drafts.iter().any(|d| d.agent == AgentKind::Deployer) {
        drafts.push(DraftTask {
            agent: AgentKind::Deployer,
            description: "Deploy the application to the configured platform".to_owned(),
            input_context: String::new(),
            success_criteria: "The platform reports the application instance running".to_owned(),
            dependencies: Vec::new(),
            target_files: vec!["manifest.yml".to_owned()],
            max_iterations: None,
            on_failure: None,
        });
    }

    let mut tasks: Vec<Task> = drafts
        .iter()
        .enumerate()
        .map(|(index, d)| {
            let mut task = Task::new(
                format!("TASK-{:03}", index + 1),
                d.agent,
                d.description.clone(),
            );
            task.input_context = d.input_context.clone();
            task.success_criteria = d.success_criteria.clone();
            task.target_files = d.target_files.clone();
            task.max_iterations = d.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
            task.on_failure = d.on_failure.unwrap_or(FailureStrategy::Retry);
            task
        })
        .collect();

    rewrite_dependencies(&mut tasks);
    tasks
}

/// Inject a coder when the plan has review or refactor work but nobody to
/// produce the code under review.
fn repair_degenerate(drafts: &mut Vec<DraftTask>) {
    let has_coder = drafts.iter().any(|d| d.agent == AgentKind::Coder);
    let needs_coder = drafts
        .iter()
        .any(|d| matches!(d.agent, AgentKind::Refactorer | AgentKind::Reviewer));

    if has_coder || !needs_coder {
        return;
    }

    // Insert after the last researcher so the injected coder can depend on
    // their findings.
    let insert_at = drafts
        .iter()
        .rposition(|d| d.agent == AgentKind::Researcher)
        .map(|pos| pos + 1)
        .unwrap_or(0);

    drafts.insert(
        insert_at,
        DraftTask {
            agent: AgentKind::Coder,
            description: "Implement the changes required by the mission request".to_owned(),
            input_context: String::new(),
            success_criteria: "The requested functionality is implemented and compiles".to_owned(),
            dependencies: Vec::new(),
            target_files: Vec::new(),
            max_iterations: None,
            on_failure: None,
        },
    );
}

/// Agent-typed dependency rewriting. Deterministic; overrides any
/// planner-proposed dependencies.
///
/// - researcher: no dependencies
/// - coder: all preceding researchers
/// - refactorer: all preceding coders
/// - tester / reviewer: the nearest preceding coder (the first coder in the
///   plan when none precedes)
/// - deployer: every coder and refactorer in the plan
fn rewrite_dependencies(tasks: &mut [Task]) {
    let agents: Vec<(String, AgentKind)> =
        tasks.iter().map(|t| (t.id.clone(), t.agent)).collect();

    for (index, task) in tasks.iter_mut().enumerate() {
        task.dependencies = match task.agent {
            AgentKind::Researcher => Vec::new(),
            AgentKind::Coder => agents[..index]
                .iter()
                .filter(|(_, agent)| *agent == AgentKind::Researcher)
                .map(|(id, _)| id.clone())
                .collect(),
            AgentKind::Refactorer => agents[..index]
                .iter()
                .filter(|(_, agent)| *agent == AgentKind::Coder)
                .map(|(id, _)| id.clone())
                .collect(),
            AgentKind::Tester | AgentKind::Reviewer => agents[..index]
                .iter()
                .rev()
                .find(|(_, agent)| *agent == AgentKind::Coder)
                .or_else(|| agents.iter().find(|(_, agent)| *agent == AgentKind::Coder))
                .map(|(id, _)| vec![id.clone()])
                .unwrap_or_default(),
            AgentKind::Deployer => agents
                .iter()
                .filter(|(id, agent)| {
                    *id != task.id
                        && matches!(agent, AgentKind::Coder | AgentKind::Refactorer)
                })
                .map(|(id, _)| id.clone())
                .collect(),
        };
    }
}
