//! The `SandboxProvider` trait -- the adapter interface for sandbox
//! runtimes.
//!
//! Each concrete provider (container runtime, managed platform tasks)
//! implements this trait. It is object-safe so the manager can hold
//! `Arc<dyn SandboxProvider>`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::mission::model::{AgentKind, FileChange};
use crate::sandbox::changes::FileSnapshot;

/// Errors a provider can raise while opening a sandbox.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The underlying runtime refused or failed to create the sandbox.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

/// Everything a provider needs to launch one task attempt.
#[derive(Debug, Clone)]
pub struct OpenSandboxRequest {
    pub agent: AgentKind,
    pub task_id: String,
    /// Host-side project directory (worktree or plain project path).
    pub project_path: PathBuf,
    /// Host-side path of the materialized instruction file; handed to the
    /// sandboxed process as argv[1].
    pub instruction_path: PathBuf,
    /// Signed key under which the instruction is retrievable through the
    /// internal fetch API (side channel for providers without a shared
    /// filesystem).
    pub instruction_key: String,
    /// Fully assembled environment for the sandboxed process.
    pub env: BTreeMap<String, String>,
    /// Toolchain image tag requested by classification.
    pub runtime_tag: String,
    pub iteration: u32,
}

/// Lifecycle interface for one sandbox runtime.
///
/// The three change-detection methods are optional: returning `None`
/// signals "use the manager's default" (local snapshot diff).
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Human-readable provider name (e.g. "container", "platform-task").
    fn name(&self) -> &str;

    /// Create and start a sandbox for the request. Returns the sandbox id.
    async fn open_sandbox(&self, request: &OpenSandboxRequest) -> Result<String, ProviderError>;

    /// Block until the sandboxed process exits or the timeout elapses.
    /// Returns the exit code, or `-1` on timeout or wait error.
    async fn wait_for_completion(&self, sandbox_id: &str, timeout_seconds: u64) -> i32;

    /// Capture combined stdout and stderr. The raw output stays with the
    /// provider; callers truncate for state storage.
    async fn capture_output(&self, sandbox_id: &str) -> String;

    /// Destroy the sandbox. Idempotent; must not fail on an
    /// already-stopped sandbox.
    async fn teardown_sandbox(&self, sandbox_id: &str);

    /// Provider-specific change detection (e.g. `git diff` on a platform
    /// task's branch). `None` means "no provider support".
    async fn detect_changes(
        &self,
        _task_id: &str,
        _project_path: &Path,
    ) -> Option<Vec<FileChange>> {
        None
    }

    /// Provider-specific project snapshot (e.g. via a helper sidecar when
    /// the manager itself is containerized). `None` means "no provider
    /// support".
    async fn snapshot_project_files(&self, _project_path: &Path) -> Option<FileSnapshot> {
        None
    }

    /// Provider-specific snapshot diff. `None` means "no provider support".
    async fn detect_changes_by_snapshot(
        &self,
        _before: &FileSnapshot,
        _project_path: &Path,
    ) -> Option<Vec<FileChange>> {
        None
    }
}

// Compile-time assertion: the trait must stay object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn SandboxProvider) {}
};
