//! Instruction builder: pure functions producing the markdown directives
//! handed to each agent role.
//!
//! The section layout is fixed; every heading is a contract point consumed
//! by the agent runtime. Builders never perform I/O.

use crate::config::DeployerConfig;
use crate::mission::model::{
    AgentKind, FileChange, ProjectContext, ReasoningLevel, Task, TestResult,
};

/// Maximum dependency entries rendered into the project-context section.
const MAX_DEPENDENCIES: usize = 50;
/// Maximum file-tree entries rendered into the project-context section.
const MAX_FILE_TREE: usize = 200;

// ---------------------------------------------------------------------------
// Primary builder
// ---------------------------------------------------------------------------

/// Build the instruction document for a task's primary agent.
pub fn build(task: &Task, context: &ProjectContext, reasoning: ReasoningLevel) -> String {
    let mut out = String::new();

    push_reasoning_section(&mut out, reasoning);

    out.push_str("## Objective\n\n");
    out.push_str(task.description.trim());
    out.push_str("\n\n");

    if !task.input_context.trim().is_empty() {
        out.push_str("## Additional Context\n\n");
        out.push_str(task.input_context.trim());
        out.push_str("\n\n");
        if task.input_context.to_lowercase().contains("do not create") {
            out.push_str(
                "**Strictness notice:** the context above forbids creating certain \
                 artifacts. Treat every \"do not create\" directive as a hard \
                 constraint, not a suggestion.\n\n",
            );
        }
    }

    push_project_context(&mut out, context);

    if !task.success_criteria.trim().is_empty() {
        out.push_str("## Success Criteria\n\n");
        out.push_str(task.success_criteria.trim());
        out.push_str("\n\n");
    }

    push_workspace_layout(&mut out);
    push_file_ownership(&mut out, &task.target_files);
    push_constraints(&mut out, task);
    push_available_tools(&mut out);
    push_cloud_notes(&mut out, task);

    out
}

fn push_reasoning_section(out: &mut String, reasoning: ReasoningLevel) {
    out.push_str("## Reasoning Approach\n\n");
    let text = match reasoning {
        ReasoningLevel::Low => {
            "Work directly. Make the smallest change that satisfies the objective \
             and avoid exploratory detours."
        }
        ReasoningLevel::Medium => {
            "Read the relevant files before editing. Sketch a short plan, then \
             implement it. Verify your work compiles or parses before finishing."
        }
        ReasoningLevel::High => {
            "Study the surrounding code first and enumerate the cases your change \
             must handle. Plan before editing, implement incrementally, and run \
             every verification available to you before finishing."
        }
        ReasoningLevel::Max => {
            "Treat this as a hard problem. Map the affected subsystem, list the \
             invariants your change must preserve, and consider at least two \
             approaches before committing to one. Implement carefully, verify \
             exhaustively, and document anything surprising you find."
        }
    };
    out.push_str(text);
    out.push_str("\n\n");
}

fn push_project_context(out: &mut String, context: &ProjectContext) {
    out.push_str("## Project Context\n\n");
    out.push_str(&format!("- **Language:** {}\n", context.language));
    if !context.framework.is_empty() {
        out.push_str(&format!("- **Framework:** {}\n", context.framework));
    }
    if !context.summary.is_empty() {
        out.push_str(&format!("- **Summary:** {}\n", context.summary));
    }
    out.push('\n');

    if !context.dependencies.is_empty() {
        out.push_str("### Dependencies\n\n");
        let mut deps: Vec<&String> = context.dependencies.iter().collect();
        deps.sort();
        for dep in deps.iter().take(MAX_DEPENDENCIES) {
            out.push_str(&format!("- {dep}\n"));
        }
        out.push('\n');
    }

    if !context.file_tree.is_empty() {
        out.push_str("### File Tree\n\n```\n");
        for path in context.file_tree.iter().take(MAX_FILE_TREE) {
            out.push_str(path);
            out.push('\n');
        }
        if context.file_tree.len() > MAX_FILE_TREE {
            out.push_str(&format!(
                "... and {} more files\n",
                context.file_tree.len() - MAX_FILE_TREE
            ));
        }
        out.push_str("```\n\n");
    }
}

fn push_workspace_layout(out: &mut String) {
    out.push_str("## Workspace Layout\n\n");
    out.push_str(
        "Your working directory is `/workspace`, the project root. Never write \
         under any `.worldmind-*` path; those directories belong to the \
         orchestrator.\n\n",
    );
}

fn push_file_ownership(out: &mut String, target_files: &[String]) {
    if target_files.is_empty() {
        return;
    }
    out.push_str("## File Ownership (STRICT)\n\n");
    out.push_str(
        "This task owns exactly the files listed below. Do not create, modify, \
         or delete any file outside this list.\n\n",
    );
    for file in target_files {
        out.push_str(&format!("- `{file}`\n"));
    }
    out.push('\n');
}

fn push_constraints(out: &mut String, task: &Task) {
    out.push_str("## Constraints\n\n");
    out.push_str("- Follow the project's existing naming and module conventions.\n");
    if !task.target_files.is_empty() {
        out.push_str("- Every file listed under File Ownership must exist when you finish.\n");
    }
    out.push_str(
        "- Produce functionally complete code: no stubs, placeholders, or \
         `TODO` markers standing in for required behavior.\n",
    );
    out.push_str("- Do not modify existing test files unless the objective says so.\n");
    out.push_str("- Commit your work with a concise message before finishing.\n");
    out.push('\n');
}

fn push_available_tools(out: &mut String) {
    out.push_str("## Available Tools\n\n");
    out.push_str(
        "Standard shell, file editing, and the project's own build and test \
         commands are available inside the sandbox.\n\n",
    );
}

fn push_cloud_notes(out: &mut String, task: &Task) {
    if !task.target_files.iter().any(|f| f == "manifest.yml") {
        return;
    }
    out.push_str("## Cloud Deployment Notes\n\n");
    out.push_str(
        "This task produces a deployment manifest. Keep the route, memory, \
         and buildpack entries consistent with the platform the mission \
         deploys to; a later deployer task pushes with this manifest \
         unchanged.\n\n",
    );
}

// ---------------------------------------------------------------------------
// Role variants
// ---------------------------------------------------------------------------

/// Build the instruction for a tester verifying a coder's changes.
pub fn build_tester(
    coder_task: &Task,
    context: &ProjectContext,
    file_changes: &[FileChange],
) -> String {
    let mut out = String::new();

    out.push_str("## Objective\n\n");
    out.push_str(&format!(
        "Verify the work done for task {}: {}\n\n",
        coder_task.id,
        coder_task.description.trim()
    ));

    out.push_str("## Changed Files\n\n");
    if file_changes.is_empty() {
        out.push_str("(no file changes reported)\n");
    } else {
        for change in file_changes {
            out.push_str(&format!("- `{}` ({})\n", change.path, change.kind));
        }
    }
    out.push('\n');

    push_project_context(&mut out, context);

    out.push_str("## Instructions\n\n");
    out.push_str(
        "Run the project's test suite, exercising the changed files in \
         particular. Write new tests only where the changes are untested. \
         Report results in the form:\n\n\
         ```\nTests run: <total>\nFailures: <failed>\n```\n\n\
         followed by failure details if any.\n\n",
    );

    push_workspace_layout(&mut out);
    out
}

/// Build the instruction for a reviewer assessing a coder's changes.
pub fn build_reviewer(
    coder_task: &Task,
    context: &ProjectContext,
    file_changes: &[FileChange],
    test_result: &TestResult,
) -> String {
    let mut out = String::new();

    out.push_str("## Objective\n\n");
    out.push_str(&format!(
        "Review the implementation of task {}: {}\n\n",
        coder_task.id,
        coder_task.description.trim()
    ));

    out.push_str("## Changed Files\n\n");
    for change in file_changes {
        out.push_str(&format!("- `{}` ({})\n", change.path, change.kind));
    }
    out.push('\n');

    out.push_str("## Test Outcome\n\n");
    out.push_str(&format!(
        "- Tests run: {}\n- Failures: {}\n- Passed: {}\n\n",
        test_result.total,
        test_result.failed,
        if test_result.passed { "yes" } else { "no" }
    ));

    if !coder_task.success_criteria.trim().is_empty() {
        out.push_str("## Success Criteria\n\n");
        out.push_str(coder_task.success_criteria.trim());
        out.push_str("\n\n");
    }

    push_project_context(&mut out, context);

    out.push_str("## Instructions\n\n");
    out.push_str(
        "Assess correctness, completeness against the success criteria, and \
         code quality. Conclude with:\n\n\
         ```\nScore: <0-10>/10\nApproved: <yes|no>\n```\n\n\
         listing concrete issues and suggestions above the verdict.\n\n",
    );

    out
}

/// Build the instruction for a read-only researcher task.
pub fn build_researcher(task: &Task, context: &ProjectContext) -> String {
    let mut out = String::new();

    out.push_str("## Objective\n\n");
    out.push_str(task.description.trim());
    out.push_str("\n\n");

    if !task.input_context.trim().is_empty() {
        out.push_str("## Additional Context\n\n");
        out.push_str(task.input_context.trim());
        out.push_str("\n\n");
    }

    push_project_context(&mut out, context);

    out.push_str("## Instructions\n\n");
    out.push_str(
        "This is a **read-only** investigation. Do not modify any project \
         file. Produce a written summary of your findings, citing file paths \
         and line references where relevant.\n\n",
    );

    out
}

/// Build the instruction for a refactorer bound to behavioral equivalence.
pub fn build_refactorer(
    task: &Task,
    context: &ProjectContext,
    baseline_tests: Option<&TestResult>,
) -> String {
    let mut out = String::new();

    out.push_str("## Objective\n\n");
    out.push_str(task.description.trim());
    out.push_str("\n\n");

    out.push_str("## Behavioral Equivalence\n\n");
    out.push_str(
        "This is a refactoring task. Observable behavior must not change: \
         every test that passed before your change must pass after it, and no \
         public interface may change shape.\n\n",
    );

    if let Some(baseline) = baseline_tests {
        out.push_str("## Baseline Test Results\n\n");
        out.push_str(&format!(
            "- Tests run: {}\n- Failures: {}\n\n",
            baseline.total, baseline.failed
        ));
    }

    if !task.input_context.trim().is_empty() {
        out.push_str("## Additional Context\n\n");
        out.push_str(task.input_context.trim());
        out.push_str("\n\n");
    }

    push_project_context(&mut out, context);
    push_workspace_layout(&mut out);
    push_file_ownership(&mut out, &task.target_files);
    push_constraints(&mut out, task);

    out
}

/// Inputs for [`build_deployer`].
#[derive(Debug, Clone)]
pub struct DeployerInputs<'a> {
    pub task: &'a Task,
    pub mission_id: &'a str,
    pub manifest_created_by_task: bool,
    /// The clarifying answer naming services to bind, or "No services needed".
    pub service_bindings: &'a str,
    /// Application type hint (e.g. "java", "python").
    pub app_type: &'a str,
    pub deployer: &'a DeployerConfig,
}

/// Build the instruction for a deployer task, including the generated
/// manifest when the plan did not task another agent with writing one.
pub fn build_deployer(inputs: &DeployerInputs<'_>) -> String {
    let mut out = String::new();

    out.push_str("## Objective\n\n");
    out.push_str(inputs.task.description.trim());
    out.push_str("\n\n");

    out.push_str("## Deployment Target\n\n");
    out.push_str(&format!(
        "- **Application name:** {}\n- **Route:** {}.apps.{}\n- **Type:** {}\n\n",
        inputs.mission_id, inputs.mission_id, inputs.deployer.apps_domain, inputs.app_type
    ));

    if inputs.manifest_created_by_task {
        out.push_str("## Manifest\n\n");
        out.push_str(
            "A `manifest.yml` was produced by an earlier task. Deploy with that \
             manifest; do not regenerate it.\n\n",
        );
    } else {
        out.push_str("## Manifest\n\n");
        out.push_str("Write the following `manifest.yml` before deploying:\n\n```yaml\n");
        out.push_str(&render_manifest(
            inputs.mission_id,
            inputs.service_bindings,
            inputs.deployer,
        ));
        out.push_str("```\n\n");
    }

    out.push_str("## Instructions\n\n");
    out.push_str(
        "Build the application, push it with the manifest, and wait for the \
         platform to report the instance running. Echo the full push output, \
         including the assigned route, so the orchestrator can verify the \
         deployment.\n\n",
    );

    push_workspace_layout(&mut out);
    out
}

/// Render the generated Cloud Foundry manifest.
///
/// The services block is omitted iff the binding answer is exactly
/// "No services needed".
fn render_manifest(mission_id: &str, service_bindings: &str, deployer: &DeployerConfig) -> String {
    let mut out = String::new();
    out.push_str("applications:\n");
    out.push_str(&format!("- name: {mission_id}\n"));
    out.push_str(&format!("  memory: {}\n", deployer.default_memory));
    out.push_str("  instances: 1\n");
    out.push_str("  path: target/*.jar\n");
    out.push_str("  buildpacks: [java_buildpack_offline]\n");
    out.push_str(&format!(
        "  routes: [{{ route: {mission_id}.apps.{} }}]\n",
        deployer.apps_domain
    ));
    out.push_str("  env: { JBP_CONFIG_OPEN_JDK_JRE: '{ jre: { version: 21.+ } }' }\n");

    if service_bindings.trim() != "No services needed" {
        let services: Vec<&str> = service_bindings
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !services.is_empty() {
            out.push_str(&format!("  services: [ {} ]\n", services.join(", ")));
        }
    }

    out
}

// ---------------------------------------------------------------------------
// Augmentations
// ---------------------------------------------------------------------------

/// Prepend the self-install preamble iff the sandbox fell back to the
/// `base` image (no toolchain-tagged image was available).
pub fn with_runtime_preamble(instruction: &str, runtime_tag: &str) -> String {
    if runtime_tag != "base" {
        return instruction.to_owned();
    }
    let mut out = String::new();
    out.push_str("## Runtime Preamble\n\n");
    out.push_str(
        "This sandbox runs the base image without a preinstalled toolchain. \
         Before starting the objective, install the language toolchain and \
         package manager the project requires.\n\n",
    );
    out.push_str(instruction);
    out
}

/// Append the MCP tools appendix when any servers are configured.
pub fn with_mcp_tools(instruction: &str, agent: AgentKind, server_names: &[String]) -> String {
    if server_names.is_empty() {
        return instruction.to_owned();
    }
    let mut out = instruction.to_owned();
    out.push_str("## MCP Tools\n\n");
    out.push_str(&format!(
        "The following MCP servers are available to the {agent} agent. \
         Connection details are provided via `MCP_SERVER_<NAME>_URL` and \
         `MCP_SERVER_<NAME>_TOKEN` environment variables.\n\n",
    ));
    for name in server_names {
        out.push_str(&format!("- {name}\n"));
    }
    out.push('\n');
    out
}

/// Format the retry block the dispatcher prepends to `input_context`.
pub fn retry_block(retry_context: &str) -> String {
    format!("## Retry Context (from previous attempt)\n{retry_context}\n\n")
}
