//! Seams to the external LLM runtime and project scanner.
//!
//! The mission core never invokes a model directly: classification,
//! clarification, specification, planning, and output parsing are all
//! delegated through [`StructuredCaller`]. Implementations live outside
//! this crate (CLI process bridge, HTTP service, test mocks).

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mission::model::{
    AgentKind, Classification, ClarifyingQuestions, ExecutionStrategy, FailureStrategy,
    ProductSpec, ProjectContext,
};

/// Errors surfaced by a structured caller.
#[derive(Debug, Error)]
pub enum CallerError {
    /// The caller's backing runtime could not be reached.
    #[error("caller unavailable: {0}")]
    Unavailable(String),

    /// The runtime responded with output that does not satisfy the schema.
    #[error("malformed caller response: {0}")]
    Malformed(String),
}

/// Inputs for the clarify call.
#[derive(Debug, Clone, Serialize)]
pub struct ClarifyInput<'a> {
    pub request: &'a str,
    pub classification: &'a Classification,
    pub project_context: &'a ProjectContext,
    pub create_cf_deployment: bool,
    pub prd_document: Option<&'a str>,
}

/// Inputs for the specify call.
#[derive(Debug, Clone, Serialize)]
pub struct SpecifyInput<'a> {
    pub request: &'a str,
    pub classification: &'a Classification,
    pub project_context: &'a ProjectContext,
    pub clarifying_questions: Option<&'a ClarifyingQuestions>,
    pub clarifying_answers: Option<&'a str>,
    pub prd_document: Option<&'a str>,
}

/// Inputs for the plan call.
#[derive(Debug, Clone, Serialize)]
pub struct PlanInput<'a> {
    pub request: &'a str,
    pub classification: &'a Classification,
    pub project_context: &'a ProjectContext,
    pub product_spec: &'a ProductSpec,
}

/// One task as proposed by the planner, before deterministic
/// normalization assigns ids and rewrites dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftTask {
    pub agent: AgentKind,
    pub description: String,
    #[serde(default)]
    pub input_context: String,
    #[serde(default)]
    pub success_criteria: String,
    /// Proposed dependencies; overridden by agent-typed rewriting.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub target_files: Vec<String>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub on_failure: Option<FailureStrategy>,
}

/// The planner's full proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDraft {
    pub tasks: Vec<DraftTask>,
    pub execution_strategy: ExecutionStrategy,
    /// Whether some planned task writes the deployment manifest itself.
    #[serde(default)]
    pub manifest_created_by_task: bool,
}

/// Parsed tester output, before the evaluator attaches the task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedTestOutput {
    pub passed: bool,
    pub total: u32,
    pub failed: u32,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Parsed reviewer output, before the evaluator attaches the task id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedReviewOutput {
    pub approved: bool,
    pub score: u8,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// Structured LLM invocation seam.
#[async_trait]
pub trait StructuredCaller: Send + Sync {
    async fn classify(&self, request: &str) -> Result<Classification, CallerError>;

    async fn clarify(&self, input: &ClarifyInput<'_>)
    -> Result<ClarifyingQuestions, CallerError>;

    async fn specify(&self, input: &SpecifyInput<'_>) -> Result<ProductSpec, CallerError>;

    async fn plan(&self, input: &PlanInput<'_>) -> Result<PlanDraft, CallerError>;

    async fn parse_test_output(&self, raw: &str) -> Result<ParsedTestOutput, CallerError>;

    async fn parse_review_output(&self, raw: &str) -> Result<ParsedReviewOutput, CallerError>;
}

/// Project filesystem scanning seam.
#[async_trait]
pub trait ProjectScanner: Send + Sync {
    async fn scan(&self, project_path: &Path) -> anyhow::Result<ProjectContext>;
}

/// Plan-approval seam for `APPROVE_PLAN` missions.
///
/// Phase 1 ships an auto-approving gate; interactive surfaces supply their
/// own implementation.
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    /// Return whether the operator approved the plan.
    async fn await_approval(&self, mission_id: &str, task_count: usize) -> bool;
}

/// Gate that approves every plan.
#[derive(Debug, Default)]
pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn await_approval(&self, _mission_id: &str, _task_count: usize) -> bool {
        true
    }
}
