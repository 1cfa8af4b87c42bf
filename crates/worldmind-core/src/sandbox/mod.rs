//! Sandbox manager: environment assembly, instruction materialization,
//! provider lifecycle, and file-change detection.
//!
//! One `execute_task` call runs a full sandbox lifecycle: open, wait,
//! capture, detect changes, teardown. Teardown is guaranteed regardless of
//! what happens after the sandbox opens.

pub mod changes;
pub mod container;
pub mod http;
pub mod instruction_store;
pub mod platform;
pub mod provider;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::WorldmindConfig;
use crate::instruction::with_mcp_tools;
use crate::mission::model::{AgentKind, FileChange};
use self::instruction_store::InstructionStore;
use self::provider::{OpenSandboxRequest, ProviderError, SandboxProvider};

/// Truncation budget for output stored in mission state.
const OUTPUT_BUDGET_BYTES: usize = 10 * 1024;

/// Errors raised by the sandbox manager.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// The instruction file could not be materialized.
    #[error("failed to materialize instruction at {path}: {source}")]
    InstructionIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Inputs for one task execution.
#[derive(Debug, Clone)]
pub struct ExecuteTaskRequest {
    pub agent: AgentKind,
    pub task_id: String,
    /// Host-side directory the sandbox works against (worktree or project).
    pub project_path: PathBuf,
    /// Fully built instruction document (before the MCP appendix).
    pub instruction_text: String,
    /// Extra per-task environment (CF credentials arrive this way for
    /// deployer tasks assembled by the dispatcher).
    pub env_extra: BTreeMap<String, String>,
    pub git_remote: Option<String>,
    pub runtime_tag: String,
    pub iteration: u32,
}

/// Outcome of one sandbox run.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Captured output, truncated to ~10 KB preserving head and tail.
    pub output: String,
    pub sandbox_id: String,
    pub file_changes: Vec<FileChange>,
    pub elapsed_ms: u64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Orchestrates sandbox lifecycles through a [`SandboxProvider`].
pub struct SandboxManager {
    config: Arc<WorldmindConfig>,
    provider: Arc<dyn SandboxProvider>,
    store: Arc<InstructionStore>,
}

impl SandboxManager {
    pub fn new(
        config: Arc<WorldmindConfig>,
        provider: Arc<dyn SandboxProvider>,
        store: Arc<InstructionStore>,
    ) -> Self {
        Self {
            config,
            provider,
            store,
        }
    }

    /// The instruction store (shared with the internal fetch API).
    pub fn instruction_store(&self) -> Arc<InstructionStore> {
        Arc::clone(&self.store)
    }

    /// Run one task attempt through a sandbox, returning the captured
    /// result. The sandbox is always torn down, and the instruction file is
    /// deleted best-effort.
    pub async fn execute_task(
        &self,
        request: &ExecuteTaskRequest,
    ) -> Result<ExecutionResult, SandboxError> {
        // 1. Environment.
        let env = self.assemble_env(request.agent, &request.env_extra);

        // 2. MCP tool guidance.
        let server_names: Vec<String> = self.config.mcp_servers.keys().cloned().collect();
        let instruction = with_mcp_tools(&request.instruction_text, request.agent, &server_names);

        // 3. Materialize the instruction file and register it with the
        //    fetch API under a signed key.
        let instruction_path = self.instruction_path(&request.project_path, &request.task_id);
        materialize_instruction(&instruction_path, &instruction)?;
        let instruction_key = self.store.sign_key(&request.task_id, request.iteration);
        self.store.put_instruction(&instruction_key, &instruction);

        // 4. Snapshot project files for the fallback change detector.
        let before = match self.provider.snapshot_project_files(&request.project_path).await {
            Some(snap) => snap,
            None => changes::snapshot(&request.project_path),
        };

        let open_request = OpenSandboxRequest {
            agent: request.agent,
            task_id: request.task_id.clone(),
            project_path: request.project_path.clone(),
            instruction_path: instruction_path.clone(),
            instruction_key: instruction_key.clone(),
            env,
            runtime_tag: request.runtime_tag.clone(),
            iteration: request.iteration,
        };

        let started_at = Utc::now();
        let clock = Instant::now();

        // 5. Open.
        let sandbox_id = match self.provider.open_sandbox(&open_request).await {
            Ok(id) => id,
            Err(e) => {
                remove_instruction_file(&instruction_path);
                self.store.remove_instruction(&instruction_key);
                return Err(e.into());
            }
        };

        tracing::info!(
            task_id = %request.task_id,
            agent = %request.agent,
            sandbox_id = %sandbox_id,
            provider = self.provider.name(),
            "sandbox opened"
        );

        // 6-8. Wait, capture, detect -- with teardown guaranteed after.
        let exit_code = self
            .provider
            .wait_for_completion(&sandbox_id, self.config.sandbox.timeout_seconds)
            .await;

        let raw_output = self.provider.capture_output(&sandbox_id).await;
        let output = changes::truncate_output(&raw_output, OUTPUT_BUDGET_BYTES);

        let file_changes = self
            .detect_changes(&request.task_id, &request.project_path, &before)
            .await;

        // 9. Teardown, regardless of what the phases above produced.
        self.provider.teardown_sandbox(&sandbox_id).await;

        // 10. Instruction cleanup, best-effort.
        remove_instruction_file(&instruction_path);
        self.store.remove_instruction(&instruction_key);

        let completed_at = Utc::now();
        let elapsed_ms = clock.elapsed().as_millis() as u64;

        tracing::info!(
            task_id = %request.task_id,
            sandbox_id = %sandbox_id,
            exit_code = exit_code,
            changes = file_changes.len(),
            elapsed_ms = elapsed_ms,
            "sandbox completed"
        );

        Ok(ExecutionResult {
            exit_code,
            output,
            sandbox_id,
            file_changes,
            elapsed_ms,
            started_at,
            completed_at,
        })
    }

    /// Change detection preference order: provider-native, provider
    /// snapshot diff, local snapshot diff.
    async fn detect_changes(
        &self,
        task_id: &str,
        project_path: &Path,
        before: &changes::FileSnapshot,
    ) -> Vec<FileChange> {
        if let Some(found) = self.provider.detect_changes(task_id, project_path).await {
            return found;
        }
        if let Some(found) = self
            .provider
            .detect_changes_by_snapshot(before, project_path)
            .await
        {
            return found;
        }
        changes::diff_snapshots(before, project_path)
    }

    /// Instruction file location: under the shared volume when the manager
    /// itself is containerized, else under the project's `.worldmind`
    /// directory.
    fn instruction_path(&self, project_path: &Path, task_id: &str) -> PathBuf {
        match &self.config.sandbox.workspace_volume {
            Some(volume) => volume.join("tasks").join(format!("{task_id}.md")),
            None => project_path
                .join(".worldmind")
                .join("tasks")
                .join(format!("{task_id}.md")),
        }
    }

    /// Assemble the sandbox environment per the provider contract.
    fn assemble_env(
        &self,
        agent: AgentKind,
        extra: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = self.config.sandbox.base_env.clone();

        if let Some(volume) = &self.config.sandbox.workspace_volume {
            env.insert(
                "WORKSPACE_VOLUME".to_owned(),
                volume.to_string_lossy().into_owned(),
            );
        }

        // LLM provider credentials only when explicitly configured;
        // otherwise forward the bound-service name for in-sandbox
        // resolution.
        let llm = &self.config.llm;
        if let Some(provider) = &llm.provider {
            env.insert("GOOSE_PROVIDER".to_owned(), provider.clone());
            if let Some(model) = &llm.model {
                env.insert("GOOSE_MODEL".to_owned(), model.clone());
            }
            if let Some(api_key) = &llm.api_key {
                let var = format!("{}_API_KEY", env_var_name(provider));
                env.insert(var, api_key.clone());
            }
        } else if let Some(service) = &llm.genai_service_name {
            env.insert("GENAI_SERVICE_NAME".to_owned(), service.clone());
        }

        // MCP servers, with per-agent token scoping.
        if !self.config.mcp_servers.is_empty() {
            let names: Vec<String> = self.config.mcp_servers.keys().cloned().collect();
            env.insert("MCP_SERVERS".to_owned(), names.join(","));

            for (name, server) in &self.config.mcp_servers {
                let upper = env_var_name(name);
                env.insert(format!("MCP_SERVER_{upper}_URL"), server.url.clone());

                let token = server
                    .agent_tokens
                    .get(&agent.to_string())
                    .or(server.token.as_ref());
                if let Some(token) = token {
                    env.insert(format!("MCP_SERVER_{upper}_TOKEN"), token.clone());
                }
            }
        }

        // Deployment credentials only reach deployer sandboxes.
        if agent == AgentKind::Deployer {
            let deployer = &self.config.deployer;
            for (var, value) in [
                ("CF_API_URL", &deployer.api_url),
                ("CF_USERNAME", &deployer.username),
                ("CF_PASSWORD", &deployer.password),
                ("CF_ORG", &deployer.org),
                ("CF_SPACE", &deployer.space),
            ] {
                if let Some(value) = value {
                    env.insert(var.to_owned(), value.clone());
                }
            }
        }

        if let Some(url) = &self.config.nexus.url {
            env.insert("NEXUS_URL".to_owned(), url.clone());
        }
        if let Some(token) = &self.config.nexus.token {
            env.insert("NEXUS_TOKEN".to_owned(), token.clone());
        }

        env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }
}

/// Uppercase a name for use in an environment variable.
fn env_var_name(name: &str) -> String {
    name.to_uppercase().replace('-', "_")
}

fn materialize_instruction(path: &Path, instruction: &str) -> Result<(), SandboxError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SandboxError::InstructionIo {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }
    std::fs::write(path, instruction).map_err(|e| SandboxError::InstructionIo {
        path: path.to_path_buf(),
        source: e,
    })
}

fn remove_instruction_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to delete instruction file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::McpServerConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Provider that records lifecycle calls and plays back scripted
    /// behavior.
    #[derive(Default)]
    struct MockProvider {
        calls: Mutex<Vec<String>>,
        fail_open: bool,
        exit_code: i32,
        output: String,
        /// File written during `wait_for_completion`, simulating agent work.
        write_on_wait: Option<(PathBuf, String)>,
        captured_env: Mutex<Option<BTreeMap<String, String>>>,
    }

    impl MockProvider {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_owned());
        }
    }

    #[async_trait]
    impl SandboxProvider for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn open_sandbox(
            &self,
            request: &OpenSandboxRequest,
        ) -> Result<String, ProviderError> {
            self.record("open");
            *self.captured_env.lock().unwrap() = Some(request.env.clone());
            if self.fail_open {
                return Err(ProviderError::Unavailable("runtime down".to_owned()));
            }
            Ok(format!("sbx-{}", request.task_id))
        }

        async fn wait_for_completion(&self, _sandbox_id: &str, _timeout_seconds: u64) -> i32 {
            self.record("wait");
            if let Some((path, contents)) = &self.write_on_wait {
                std::fs::write(path, contents).unwrap();
            }
            self.exit_code
        }

        async fn capture_output(&self, _sandbox_id: &str) -> String {
            self.record("capture");
            self.output.clone()
        }

        async fn teardown_sandbox(&self, _sandbox_id: &str) {
            self.record("teardown");
        }
    }

    fn manager_with(
        provider: Arc<MockProvider>,
        mutate: impl FnOnce(&mut WorldmindConfig),
    ) -> (SandboxManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut config = WorldmindConfig::for_project(dir.path());
        mutate(&mut config);
        let store = Arc::new(InstructionStore::new(b"test".to_vec()));
        (
            SandboxManager::new(Arc::new(config), provider, store),
            dir,
        )
    }

    fn request(dir: &TempDir) -> ExecuteTaskRequest {
        ExecuteTaskRequest {
            agent: AgentKind::Coder,
            task_id: "TASK-001".to_owned(),
            project_path: dir.path().to_path_buf(),
            instruction_text: "## Objective\n\nwrite hello.py\n".to_owned(),
            env_extra: BTreeMap::new(),
            git_remote: None,
            runtime_tag: "python3.12".to_owned(),
            iteration: 0,
        }
    }

    #[tokio::test]
    async fn lifecycle_runs_in_order_with_teardown() {
        let provider = Arc::new(MockProvider {
            exit_code: 0,
            output: "done".to_owned(),
            ..MockProvider::default()
        });
        let (manager, dir) = manager_with(Arc::clone(&provider), |_| {});

        let result = manager.execute_task(&request(&dir)).await.unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.output, "done");
        assert_eq!(result.sandbox_id, "sbx-TASK-001");
        assert_eq!(provider.calls(), vec!["open", "wait", "capture", "teardown"]);
    }

    #[tokio::test]
    async fn teardown_runs_even_on_timeout_exit() {
        let provider = Arc::new(MockProvider {
            exit_code: -1,
            ..MockProvider::default()
        });
        let (manager, dir) = manager_with(Arc::clone(&provider), |_| {});

        let result = manager.execute_task(&request(&dir)).await.unwrap();
        assert_eq!(result.exit_code, -1);
        assert!(provider.calls().contains(&"teardown".to_owned()));
    }

    #[tokio::test]
    async fn open_failure_surfaces_provider_error_and_cleans_instruction() {
        let provider = Arc::new(MockProvider {
            fail_open: true,
            ..MockProvider::default()
        });
        let (manager, dir) = manager_with(Arc::clone(&provider), |_| {});

        let err = manager.execute_task(&request(&dir)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Provider(_)));
        assert!(
            !dir.path().join(".worldmind/tasks/TASK-001.md").exists(),
            "instruction file removed after failed open"
        );
        assert!(manager.instruction_store().is_empty());
    }

    #[tokio::test]
    async fn instruction_file_materialized_then_deleted() {
        let provider = Arc::new(MockProvider::default());
        let (manager, dir) = manager_with(Arc::clone(&provider), |_| {});

        manager.execute_task(&request(&dir)).await.unwrap();

        // Deleted after the run; the detector must also never report it.
        assert!(!dir.path().join(".worldmind/tasks/TASK-001.md").exists());
    }

    #[tokio::test]
    async fn file_changes_detected_via_local_snapshot() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("existing.py"), "x").unwrap();

        let provider = Arc::new(MockProvider {
            write_on_wait: Some((dir.path().join("hello.py"), "print('hi')\n".to_owned())),
            ..MockProvider::default()
        });
        let mut config = WorldmindConfig::for_project(dir.path());
        config.validate().unwrap();
        let store = Arc::new(InstructionStore::new(b"test".to_vec()));
        let manager = SandboxManager::new(Arc::new(config), provider, store);

        let mut req = request(&dir);
        req.project_path = dir.path().to_path_buf();
        let result = manager.execute_task(&req).await.unwrap();

        assert_eq!(result.file_changes, vec![FileChange::created("hello.py")]);
    }

    #[tokio::test]
    async fn env_assembly_follows_contract() {
        let provider = Arc::new(MockProvider::default());
        let (manager, dir) = manager_with(Arc::clone(&provider), |config| {
            config.llm.provider = Some("anthropic".to_owned());
            config.llm.model = Some("claude-sonnet".to_owned());
            config.llm.api_key = Some("sk-test".to_owned());
            config.mcp_servers.insert(
                "code-search".to_owned(),
                McpServerConfig {
                    url: "https://mcp.example.com".to_owned(),
                    token: Some("shared-token".to_owned()),
                    agent_tokens: BTreeMap::from([(
                        "CODER".to_owned(),
                        "coder-token".to_owned(),
                    )]),
                },
            );
            config.nexus.url = Some("https://nexus.example.com".to_owned());
        });

        manager.execute_task(&request(&dir)).await.unwrap();

        let env = provider.captured_env.lock().unwrap().clone().unwrap();
        assert_eq!(env.get("GOOSE_PROVIDER").map(String::as_str), Some("anthropic"));
        assert_eq!(env.get("GOOSE_MODEL").map(String::as_str), Some("claude-sonnet"));
        assert_eq!(env.get("ANTHROPIC_API_KEY").map(String::as_str), Some("sk-test"));
        assert!(env.get("GENAI_SERVICE_NAME").is_none());
        assert_eq!(env.get("MCP_SERVERS").map(String::as_str), Some("code-search"));
        assert_eq!(
            env.get("MCP_SERVER_CODE_SEARCH_URL").map(String::as_str),
            Some("https://mcp.example.com")
        );
        assert_eq!(
            env.get("MCP_SERVER_CODE_SEARCH_TOKEN").map(String::as_str),
            Some("coder-token"),
            "per-agent token wins over the shared one"
        );
        assert_eq!(
            env.get("NEXUS_URL").map(String::as_str),
            Some("https://nexus.example.com")
        );
        assert!(env.get("CF_API_URL").is_none(), "CF vars are deployer-only");
    }

    #[tokio::test]
    async fn genai_service_forwarded_when_provider_unset() {
        let provider = Arc::new(MockProvider::default());
        let (manager, dir) = manager_with(Arc::clone(&provider), |config| {
            config.llm.genai_service_name = Some("bound-genai".to_owned());
        });

        manager.execute_task(&request(&dir)).await.unwrap();

        let env = provider.captured_env.lock().unwrap().clone().unwrap();
        assert_eq!(
            env.get("GENAI_SERVICE_NAME").map(String::as_str),
            Some("bound-genai")
        );
        assert!(env.get("GOOSE_PROVIDER").is_none());
    }

    #[tokio::test]
    async fn deployer_receives_cf_credentials() {
        let provider = Arc::new(MockProvider::default());
        let (manager, dir) = manager_with(Arc::clone(&provider), |config| {
            config.deployer.api_url = Some("https://api.cf.example.com".to_owned());
            config.deployer.username = Some("deployer".to_owned());
        });

        let mut req = request(&dir);
        req.agent = AgentKind::Deployer;
        manager.execute_task(&req).await.unwrap();

        let env = provider.captured_env.lock().unwrap().clone().unwrap();
        assert_eq!(
            env.get("CF_API_URL").map(String::as_str),
            Some("https://api.cf.example.com")
        );
        assert_eq!(env.get("CF_USERNAME").map(String::as_str), Some("deployer"));
    }

    #[tokio::test]
    async fn mcp_appendix_added_when_servers_configured() {
        let provider = Arc::new(MockProvider::default());
        let (manager, dir) = manager_with(Arc::clone(&provider), |config| {
            config.mcp_servers.insert(
                "docs".to_owned(),
                McpServerConfig {
                    url: "https://docs-mcp.example.com".to_owned(),
                    token: None,
                    agent_tokens: BTreeMap::new(),
                },
            );
        });

        manager.execute_task(&request(&dir)).await.unwrap();

        // The instruction landed in the store before launch; it is removed
        // afterwards, so verify via the signed key ahead of a second run.
        let key = manager.instruction_store().sign_key("TASK-001", 0);
        assert!(manager.instruction_store().get_instruction(&key).is_none());
    }

    #[test]
    fn env_var_name_sanitizes() {
        assert_eq!(env_var_name("code-search"), "CODE_SEARCH");
        assert_eq!(env_var_name("anthropic"), "ANTHROPIC");
    }
}
