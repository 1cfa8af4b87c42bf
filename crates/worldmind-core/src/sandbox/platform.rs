//! Platform-task sandbox provider.
//!
//! Runs the same instruction through a managed platform task (`cf run-task`
//! style) instead of a local container. The platform clones the project
//! branch itself, so change detection is overridden with a `git diff`
//! against the task's branch instead of a filesystem snapshot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::Command;

use crate::mission::model::{FileChange, FileChangeKind};
use super::provider::{OpenSandboxRequest, ProviderError, SandboxProvider};

/// Configuration for the platform-task provider.
#[derive(Debug, Clone)]
pub struct PlatformProviderConfig {
    /// Platform CLI binary (e.g. "cf").
    pub cli: String,
    /// Application the task runs under.
    pub app_name: String,
    /// Command template executed by the task; the instruction fetch key is
    /// appended.
    pub task_command: String,
    /// Poll interval while waiting for task completion.
    pub poll_interval_secs: u64,
}

impl Default for PlatformProviderConfig {
    fn default() -> Self {
        Self {
            cli: "cf".to_owned(),
            app_name: "worldmind-agent".to_owned(),
            task_command: "worldmind-agent-fetch".to_owned(),
            poll_interval_secs: 5,
        }
    }
}

/// Sandbox provider backed by managed platform tasks.
#[derive(Debug)]
pub struct PlatformProvider {
    config: PlatformProviderConfig,
    /// sandbox_id -> branch used for git-diff change detection.
    branches: Mutex<HashMap<String, String>>,
}

impl PlatformProvider {
    pub fn new(config: PlatformProviderConfig) -> Self {
        Self {
            config,
            branches: Mutex::new(HashMap::new()),
        }
    }

    fn sandbox_branch(&self, sandbox_id: &str) -> Option<String> {
        self.branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(sandbox_id)
            .cloned()
    }
}

#[async_trait]
impl SandboxProvider for PlatformProvider {
    fn name(&self) -> &str {
        "platform-task"
    }

    async fn open_sandbox(&self, request: &OpenSandboxRequest) -> Result<String, ProviderError> {
        // The task fetches its instruction through the internal API; only
        // the signed key crosses the platform boundary.
        let command = format!("{} {}", self.config.task_command, request.instruction_key);

        let output = Command::new(&self.config.cli)
            .args([
                "run-task",
                &self.config.app_name,
                "--command",
                &command,
                "--name",
                &format!("wmnd-{}-{}", request.task_id, request.iteration),
            ])
            .output()
            .await
            .map_err(|e| {
                ProviderError::Unavailable(format!(
                    "failed to run {} run-task: {e}",
                    self.config.cli
                ))
            })?;

        if !output.status.success() {
            return Err(ProviderError::Unavailable(format!(
                "platform task launch failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let task_id = parse_platform_task_id(&stdout)
            .unwrap_or_else(|| format!("wmnd-{}-{}", request.task_id, request.iteration));

        self.branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.clone(), format!("wave/{}", request.task_id));

        Ok(task_id)
    }

    async fn wait_for_completion(&self, sandbox_id: &str, timeout_seconds: u64) -> i32 {
        let deadline =
            tokio::time::Instant::now() + std::time::Duration::from_secs(timeout_seconds);

        loop {
            let output = Command::new(&self.config.cli)
                .args(["tasks", &self.config.app_name])
                .output()
                .await;

            if let Ok(output) = output {
                let listing = String::from_utf8_lossy(&output.stdout);
                match platform_task_state(&listing, sandbox_id) {
                    Some("SUCCEEDED") => return 0,
                    Some("FAILED") => return 1,
                    _ => {}
                }
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(sandbox_id = sandbox_id, "platform task timed out");
                let _ = Command::new(&self.config.cli)
                    .args(["terminate-task", &self.config.app_name, sandbox_id])
                    .output()
                    .await;
                return -1;
            }

            tokio::time::sleep(std::time::Duration::from_secs(
                self.config.poll_interval_secs,
            ))
            .await;
        }
    }

    async fn capture_output(&self, sandbox_id: &str) -> String {
        // Task output is captured through recent application logs; the
        // platform interleaves other lines, which the diagnosis layer
        // tolerates.
        match Command::new(&self.config.cli)
            .args(["logs", &self.config.app_name, "--recent"])
            .output()
            .await
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).into_owned(),
            Err(e) => {
                tracing::warn!(sandbox_id = sandbox_id, error = %e, "failed to capture logs");
                String::new()
            }
        }
    }

    async fn teardown_sandbox(&self, sandbox_id: &str) {
        // Terminate is idempotent on the platform side; a finished task is
        // a no-op.
        let _ = Command::new(&self.config.cli)
            .args(["terminate-task", &self.config.app_name, sandbox_id])
            .output()
            .await;
        self.branches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(sandbox_id);
    }

    async fn detect_changes(&self, task_id: &str, project_path: &Path) -> Option<Vec<FileChange>> {
        let branch = self
            .sandbox_branch(task_id)
            .unwrap_or_else(|| format!("wave/{task_id}"));

        let output = Command::new("git")
            .args(["diff", "--name-status", &format!("HEAD..{branch}")])
            .current_dir(project_path)
            .output()
            .await
            .ok()?;

        if !output.status.success() {
            return None;
        }

        Some(parse_name_status(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parse `task id: <n>` style output from a task launch.
fn parse_platform_task_id(stdout: &str) -> Option<String> {
    for line in stdout.lines() {
        let lower = line.to_lowercase();
        if let Some(rest) = lower.strip_prefix("task id:") {
            let id = rest.trim();
            if !id.is_empty() {
                return Some(id.to_owned());
            }
        }
    }
    None
}

/// Find a task's state column in a `tasks` listing.
fn platform_task_state<'a>(listing: &'a str, task_name: &str) -> Option<&'a str> {
    for line in listing.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.iter().any(|f| *f == task_name) {
            for state in ["SUCCEEDED", "FAILED", "RUNNING", "PENDING"] {
                if fields.contains(&state) {
                    return Some(state);
                }
            }
        }
    }
    None
}

/// Map `git diff --name-status` lines to file changes.
fn parse_name_status(diff: &str) -> Vec<FileChange> {
    let mut changes = Vec::new();
    for line in diff.lines() {
        let mut parts = line.split_whitespace();
        let (Some(status), Some(path)) = (parts.next(), parts.next()) else {
            continue;
        };
        let kind = match status.chars().next() {
            Some('A') => FileChangeKind::Created,
            Some('M') => FileChangeKind::Modified,
            Some('D') => FileChangeKind::Deleted,
            Some('R') => {
                // Renames list old then new; report the new path as created.
                if let Some(new_path) = parts.next() {
                    changes.push(FileChange {
                        path: new_path.to_owned(),
                        kind: FileChangeKind::Created,
                    });
                }
                changes.push(FileChange {
                    path: path.to_owned(),
                    kind: FileChangeKind::Deleted,
                });
                continue;
            }
            _ => continue,
        };
        changes.push(FileChange {
            path: path.to_owned(),
            kind,
        });
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_parsed_from_launch_output() {
        let stdout = "Creating task for app worldmind-agent...\nOK\n\ntask id: 42\n";
        assert_eq!(parse_platform_task_id(stdout).as_deref(), Some("42"));
        assert!(parse_platform_task_id("no task here").is_none());
    }

    #[test]
    fn task_state_found_in_listing() {
        let listing = "\
id   name              state       start time\n\
41   wmnd-TASK-001-0   SUCCEEDED   2026-07-30T10:00:00Z\n\
42   wmnd-TASK-002-0   RUNNING     2026-07-30T10:05:00Z\n";
        assert_eq!(
            platform_task_state(listing, "wmnd-TASK-001-0"),
            Some("SUCCEEDED")
        );
        assert_eq!(
            platform_task_state(listing, "wmnd-TASK-002-0"),
            Some("RUNNING")
        );
        assert_eq!(platform_task_state(listing, "wmnd-TASK-999-0"), None);
    }

    #[test]
    fn name_status_parsing() {
        let diff = "A\tsrc/new.py\nM\tsrc/main.py\nD\tsrc/old.py\nR100\tsrc/a.py\tsrc/b.py\n";
        let changes = parse_name_status(diff);

        assert!(changes.contains(&FileChange {
            path: "src/new.py".to_owned(),
            kind: FileChangeKind::Created
        }));
        assert!(changes.contains(&FileChange {
            path: "src/main.py".to_owned(),
            kind: FileChangeKind::Modified
        }));
        assert!(changes.contains(&FileChange {
            path: "src/old.py".to_owned(),
            kind: FileChangeKind::Deleted
        }));
        assert!(changes.contains(&FileChange {
            path: "src/b.py".to_owned(),
            kind: FileChangeKind::Created
        }));
    }
}
