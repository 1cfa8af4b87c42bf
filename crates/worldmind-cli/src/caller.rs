//! External-process structured caller.
//!
//! Bridges the [`StructuredCaller`] seam to a configurable command. The
//! command receives the call name as its first argument and the JSON input
//! on stdin, and must print a single JSON document matching the call's
//! schema on stdout. The LLM runtime behind the command is its own
//! concern.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use worldmind_core::mission::model::{Classification, ClarifyingQuestions, ProductSpec};
use worldmind_core::planning::caller::{
    CallerError, ClarifyInput, ParsedReviewOutput, ParsedTestOutput, PlanDraft, PlanInput,
    SpecifyInput, StructuredCaller,
};

/// Caller that shells out to an external command per structured call.
#[derive(Debug, Clone)]
pub struct ExternalProcessCaller {
    command: String,
}

impl ExternalProcessCaller {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    async fn call<I: Serialize, O: DeserializeOwned>(
        &self,
        name: &str,
        input: &I,
    ) -> Result<O, CallerError> {
        let payload = serde_json::to_vec(input)
            .map_err(|e| CallerError::Malformed(format!("input serialization failed: {e}")))?;

        let mut child = Command::new(&self.command)
            .arg(name)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                CallerError::Unavailable(format!("failed to spawn {}: {e}", self.command))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| CallerError::Unavailable(format!("failed to write input: {e}")))?;
            // Close stdin so the command starts processing.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CallerError::Unavailable(format!("failed to wait for caller: {e}")))?;

        if !output.status.success() {
            return Err(CallerError::Unavailable(format!(
                "caller {name} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            CallerError::Malformed(format!("caller {name} returned invalid JSON: {e}"))
        })
    }
}

#[async_trait]
impl StructuredCaller for ExternalProcessCaller {
    async fn classify(&self, request: &str) -> Result<Classification, CallerError> {
        self.call("classify", &serde_json::json!({ "request": request }))
            .await
    }

    async fn clarify(
        &self,
        input: &ClarifyInput<'_>,
    ) -> Result<ClarifyingQuestions, CallerError> {
        self.call("clarify", input).await
    }

    async fn specify(&self, input: &SpecifyInput<'_>) -> Result<ProductSpec, CallerError> {
        self.call("specify", input).await
    }

    async fn plan(&self, input: &PlanInput<'_>) -> Result<PlanDraft, CallerError> {
        self.call("plan", input).await
    }

    async fn parse_test_output(&self, raw: &str) -> Result<ParsedTestOutput, CallerError> {
        self.call("parse-test", &serde_json::json!({ "output": raw }))
            .await
    }

    async fn parse_review_output(&self, raw: &str) -> Result<ParsedReviewOutput, CallerError> {
        self.call("parse-review", &serde_json::json!({ "output": raw }))
            .await
    }
}
