//! Container-runtime sandbox provider.
//!
//! Creates one container per task attempt with the project directory
//! mounted at `/workspace`. The toolchain image is selected from the
//! mission's runtime tag; when no such tag exists the provider falls back
//! to the `:base` image and prepends the self-install preamble to the
//! already-materialized instruction file.

use async_trait::async_trait;
use tokio::process::Command;

use crate::instruction::with_runtime_preamble;
use super::provider::{OpenSandboxRequest, ProviderError, SandboxProvider};

/// Configuration for the container provider.
#[derive(Debug, Clone)]
pub struct ContainerProviderConfig {
    /// Image repository; tags are appended (e.g. "worldmind/agent").
    pub image_repository: String,
    /// Command invoked inside the container; the instruction path is
    /// appended as its final argument.
    pub agent_command: Vec<String>,
    /// Additional flags passed to `docker create`.
    pub extra_flags: Vec<String>,
}

impl Default for ContainerProviderConfig {
    fn default() -> Self {
        Self {
            image_repository: "worldmind/agent".to_owned(),
            agent_command: vec!["worldmind-agent".to_owned()],
            extra_flags: Vec::new(),
        }
    }
}

/// Sandbox provider backed by a local container runtime.
#[derive(Debug)]
pub struct ContainerProvider {
    config: ContainerProviderConfig,
}

impl ContainerProvider {
    pub fn new(config: ContainerProviderConfig) -> Self {
        Self { config }
    }

    /// Container name for a task attempt.
    fn container_name(task_id: &str, iteration: u32) -> String {
        let sanitized: String = task_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
            .collect();
        format!("wmnd-{sanitized}-{iteration}")
    }

    /// Resolve the image for a runtime tag, falling back to `:base` when
    /// the tagged image is not available locally and cannot be pulled.
    async fn resolve_image(&self, runtime_tag: &str) -> (String, bool) {
        let tagged = format!("{}:{}", self.config.image_repository, runtime_tag);

        if image_exists(&tagged).await || pull_image(&tagged).await {
            return (tagged, false);
        }

        tracing::warn!(
            image = %tagged,
            "tagged image unavailable, falling back to base"
        );
        (format!("{}:base", self.config.image_repository), true)
    }

    /// Translate the host instruction path to its in-container location
    /// under the `/workspace` mount.
    fn container_instruction_path(request: &OpenSandboxRequest) -> String {
        match request.instruction_path.strip_prefix(&request.project_path) {
            Ok(relative) => format!("/workspace/{}", relative.to_string_lossy()),
            Err(_) => format!("/workspace/tasks/{}.md", request.task_id),
        }
    }
}

#[async_trait]
impl SandboxProvider for ContainerProvider {
    fn name(&self) -> &str {
        "container"
    }

    async fn open_sandbox(&self, request: &OpenSandboxRequest) -> Result<String, ProviderError> {
        let (image, fell_back) = self.resolve_image(&request.runtime_tag).await;

        // A base-image fallback owes the agent a self-install preamble.
        if fell_back {
            match std::fs::read_to_string(&request.instruction_path) {
                Ok(instruction) => {
                    let augmented = with_runtime_preamble(&instruction, "base");
                    if let Err(e) = std::fs::write(&request.instruction_path, augmented) {
                        tracing::warn!(error = %e, "failed to prepend runtime preamble");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read instruction for preamble");
                }
            }
        }

        let name = Self::container_name(&request.task_id, request.iteration);
        let mount = format!("{}:/workspace", request.project_path.to_string_lossy());

        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name,
            "-v".into(),
            mount,
            "-w".into(),
            "/workspace".into(),
        ];
        for (key, value) in &request.env {
            args.push("-e".into());
            args.push(format!("{key}={value}"));
        }
        args.extend(self.config.extra_flags.iter().cloned());
        args.push(image);
        args.extend(self.config.agent_command.iter().cloned());
        args.push(Self::container_instruction_path(request));

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("failed to run docker create: {e}")))?;

        if !output.status.success() {
            return Err(ProviderError::Unavailable(format!(
                "docker create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_owned();

        let start = Command::new("docker")
            .args(["start", &container_id])
            .output()
            .await
            .map_err(|e| ProviderError::Unavailable(format!("failed to run docker start: {e}")))?;

        if !start.status.success() {
            // Clean up the created container before surfacing the error.
            let _ = Command::new("docker")
                .args(["rm", "-f", &container_id])
                .output()
                .await;
            return Err(ProviderError::Unavailable(format!(
                "docker start failed: {}",
                String::from_utf8_lossy(&start.stderr)
            )));
        }

        Ok(container_id)
    }

    async fn wait_for_completion(&self, sandbox_id: &str, timeout_seconds: u64) -> i32 {
        let wait = Command::new("docker").args(["wait", sandbox_id]).output();

        match tokio::time::timeout(std::time::Duration::from_secs(timeout_seconds), wait).await {
            Ok(Ok(output)) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout)
                    .trim()
                    .parse::<i32>()
                    .unwrap_or(-1)
            }
            Ok(_) => -1,
            Err(_elapsed) => {
                tracing::warn!(sandbox_id = sandbox_id, "sandbox timed out, killing");
                let _ = Command::new("docker")
                    .args(["kill", sandbox_id])
                    .output()
                    .await;
                -1
            }
        }
    }

    async fn capture_output(&self, sandbox_id: &str) -> String {
        match Command::new("docker")
            .args(["logs", sandbox_id])
            .output()
            .await
        {
            Ok(output) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.is_empty() {
                    combined.push('\n');
                    combined.push_str(&stderr);
                }
                combined
            }
            Err(e) => {
                tracing::warn!(sandbox_id = sandbox_id, error = %e, "failed to capture logs");
                String::new()
            }
        }
    }

    async fn teardown_sandbox(&self, sandbox_id: &str) {
        match Command::new("docker")
            .args(["rm", "-f", sandbox_id])
            .output()
            .await
        {
            Ok(output) if !output.status.success() => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("No such container") {
                    tracing::warn!(
                        sandbox_id = sandbox_id,
                        stderr = %stderr,
                        "docker rm failed"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(sandbox_id = sandbox_id, error = %e, "failed to run docker rm");
            }
        }
    }
}

/// Whether an image exists locally.
async fn image_exists(image: &str) -> bool {
    Command::new("docker")
        .args(["image", "inspect", image])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Try to pull an image; quiet failure.
async fn pull_image(image: &str) -> bool {
    Command::new("docker")
        .args(["pull", image])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}
