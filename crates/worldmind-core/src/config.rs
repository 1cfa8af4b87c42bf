//! Immutable runtime configuration.
//!
//! Loaded once at startup, validated eagerly, and passed to constructors.
//! No module-level mutable state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Configuration for sandbox execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Wall-time limit per sandbox run.
    pub timeout_seconds: u64,
    /// Image repository for the container provider (e.g. "worldmind/agent").
    pub image_repository: String,
    /// Set when the manager itself runs inside a container; switches
    /// instruction paths onto the shared volume.
    pub workspace_volume: Option<PathBuf>,
    /// Base environment variables injected into every sandbox.
    pub base_env: BTreeMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 300,
            image_repository: "worldmind/agent".to_owned(),
            workspace_volume: None,
            base_env: BTreeMap::new(),
        }
    }
}

/// Configuration for the wave dispatcher and scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Maximum number of tasks executed concurrently within a wave.
    pub max_parallel: usize,
    /// Cooldown inserted before re-dispatching a wave that repeated once.
    pub wave_cooldown_seconds: u64,
    /// Oscillation window size (number of recent wave fingerprints kept).
    pub oscillation_window: usize,
    /// Wave count above which a repeating window forces convergence.
    pub oscillation_threshold: u32,
    /// Hard ceiling on node executions per mission drive; backs the
    /// per-mission timeout.
    pub max_node_executions: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_parallel: 1,
            wave_cooldown_seconds: 60,
            oscillation_window: 4,
            oscillation_threshold: 6,
            max_node_executions: 500,
        }
    }
}

/// One configured MCP server, optionally with per-agent access tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub url: String,
    /// Token shared by all agents unless overridden per agent.
    pub token: Option<String>,
    /// Per-agent token overrides, keyed by agent name ("CODER", ...).
    #[serde(default)]
    pub agent_tokens: BTreeMap<String, String>,
}

/// LLM provider settings forwarded into sandboxes.
///
/// When `provider` is unset, sandboxes resolve credentials from bound
/// services via `GENAI_SERVICE_NAME` instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub genai_service_name: Option<String>,
}

/// Cloud Foundry deployment settings (DEPLOYER tasks only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployerConfig {
    pub api_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub org: Option<String>,
    pub space: Option<String>,
    /// Domain under which deployed routes are created.
    pub apps_domain: String,
    /// Default instance memory in the generated manifest.
    pub default_memory: String,
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            username: None,
            password: None,
            org: None,
            space: None,
            apps_domain: "example.com".to_owned(),
            default_memory: "1G".to_owned(),
        }
    }
}

/// Optional MCP-gateway contract.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NexusConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

fn default_base_branch() -> String {
    "main".to_owned()
}

/// Top-level immutable configuration for one worldmind process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldmindConfig {
    /// Path to the project being worked on (local mode).
    pub project_path: PathBuf,
    /// Git URL of the project; when set, tasks run in per-task worktrees
    /// over a mission clone.
    pub git_remote: Option<String>,
    /// Branch worktrees are cut from.
    #[serde(default = "default_base_branch")]
    pub git_base_branch: String,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub deployer: DeployerConfig,
    #[serde(default)]
    pub nexus: NexusConfig,
    /// Configured MCP servers, keyed by name.
    #[serde(default)]
    pub mcp_servers: BTreeMap<String, McpServerConfig>,
}

impl WorldmindConfig {
    /// Build a config rooted at a project path with all defaults.
    pub fn for_project(project_path: impl Into<PathBuf>) -> Self {
        Self {
            project_path: project_path.into(),
            git_remote: None,
            git_base_branch: default_base_branch(),
            sandbox: SandboxConfig::default(),
            dispatch: DispatchConfig::default(),
            llm: LlmConfig::default(),
            deployer: DeployerConfig::default(),
            nexus: NexusConfig::default(),
            mcp_servers: BTreeMap::new(),
        }
    }

    /// Validate the configuration eagerly, before any mission runs.
    pub fn validate(&self) -> Result<()> {
        if self.dispatch.max_parallel == 0 {
            bail!("dispatch.max_parallel must be >= 1");
        }
        if self.sandbox.timeout_seconds == 0 {
            bail!("sandbox.timeout_seconds must be >= 1");
        }
        if self.dispatch.oscillation_window < 4 {
            bail!(
                "dispatch.oscillation_window must be >= 4, got {}",
                self.dispatch.oscillation_window
            );
        }
        if self.dispatch.oscillation_window % 2 != 0 {
            bail!("dispatch.oscillation_window must be even");
        }
        for (name, server) in &self.mcp_servers {
            if name.is_empty() {
                bail!("mcp server names must be non-empty");
            }
            if server.url.is_empty() {
                bail!("mcp server {name:?} has an empty url");
            }
        }
        if self.deployer.apps_domain.is_empty() {
            bail!("deployer.apps_domain must be non-empty");
        }
        Ok(())
    }
}
