//! Per-task isolated git worktrees over a single mission clone.
//!
//! Each mission gets one clone of the project; each task attempt runs in
//! its own worktree on a `wave/<task_id>` branch so concurrent tasks never
//! write to the same directory. Worktrees share the clone's object store.
//!
//! Git does not support concurrent worktree operations on the same
//! repository (it uses a lock file on the shared object store), so all
//! mutating git operations are serialised through an internal mutex.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Errors that can occur during workspace operations.
#[derive(Debug, Error)]
pub enum WorktreeError {
    /// A git command failed to execute.
    #[error("git command failed: {message}")]
    GitCommand {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    GitExit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// An operation referenced a task with no acquired worktree.
    #[error("no worktree acquired for task {0}")]
    UnknownTask(String),

    /// An operation referenced a mission with no workspace.
    #[error("no workspace created for mission {0}")]
    UnknownMission(String),

    /// Filesystem error while preparing the workspace layout.
    #[error("workspace io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A tracked per-task worktree.
#[derive(Debug, Clone)]
struct TaskWorktree {
    mission_id: String,
    path: PathBuf,
    branch: String,
}

/// Manages mission clones and per-task worktrees.
#[derive(Debug)]
pub struct WorkspaceManager {
    /// Base directory under which mission workspaces are created.
    base: PathBuf,
    /// mission_id -> clone path.
    clones: Mutex<HashMap<String, PathBuf>>,
    /// task_id -> worktree record.
    worktrees: Mutex<HashMap<String, TaskWorktree>>,
    /// Serialises mutating git operations.
    git_lock: Arc<Mutex<()>>,
}

impl WorkspaceManager {
    /// Create a manager rooted at `base` (created on demand).
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            clones: Mutex::new(HashMap::new()),
            worktrees: Mutex::new(HashMap::new()),
            git_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Conventional branch name for a task.
    pub fn branch_name(task_id: &str) -> String {
        format!("wave/{task_id}")
    }

    fn clone_dir(&self, mission_id: &str) -> PathBuf {
        self.base.join(mission_id).join("repo")
    }

    fn worktree_dir(&self, mission_id: &str, task_id: &str) -> PathBuf {
        self.base.join(mission_id).join("worktrees").join(task_id)
    }

    /// Create (or return) the mission's shared clone.
    ///
    /// Idempotent: a second call for the same mission returns the cached
    /// path without touching git.
    pub fn create_mission_workspace(
        &self,
        mission_id: &str,
        git_url: &str,
    ) -> Result<PathBuf, WorktreeError> {
        {
            let clones = self.clones.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(path) = clones.get(mission_id) {
                return Ok(path.clone());
            }
        }

        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let clone_path = self.clone_dir(mission_id);

        if !clone_path.exists() {
            let parent = clone_path
                .parent()
                .expect("clone dir has a parent by construction");
            std::fs::create_dir_all(parent).map_err(|e| WorktreeError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;

            run_git(
                &["clone", git_url, &clone_path.to_string_lossy()],
                Path::new("."),
            )?;
            tracing::info!(
                mission_id = mission_id,
                path = %clone_path.display(),
                "cloned mission workspace"
            );
        }

        let mut clones = self.clones.lock().unwrap_or_else(|e| e.into_inner());
        clones.insert(mission_id.to_owned(), clone_path.clone());
        Ok(clone_path)
    }

    /// Create (or return) the worktree for a task, branched `wave/<task_id>`
    /// from `base_branch`.
    ///
    /// Idempotent per task id.
    pub fn acquire_worktree(
        &self,
        mission_id: &str,
        task_id: &str,
        base_branch: &str,
    ) -> Result<PathBuf, WorktreeError> {
        {
            let worktrees = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = worktrees.get(task_id) {
                return Ok(existing.path.clone());
            }
        }

        let clone_path = {
            let clones = self.clones.lock().unwrap_or_else(|e| e.into_inner());
            clones
                .get(mission_id)
                .cloned()
                .ok_or_else(|| WorktreeError::UnknownMission(mission_id.to_owned()))?
        };

        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        let branch = Self::branch_name(task_id);
        let wt_path = self.worktree_dir(mission_id, task_id);

        let parent = wt_path
            .parent()
            .expect("worktree dir has a parent by construction");
        std::fs::create_dir_all(parent).map_err(|e| WorktreeError::Io {
            path: parent.to_path_buf(),
            source: e,
        })?;

        if branch_exists(&clone_path, &branch)? {
            run_git(
                &["worktree", "add", &wt_path.to_string_lossy(), &branch],
                &clone_path,
            )?;
        } else {
            run_git(
                &[
                    "worktree",
                    "add",
                    "-b",
                    &branch,
                    &wt_path.to_string_lossy(),
                    base_branch,
                ],
                &clone_path,
            )?;
        }

        tracing::info!(
            mission_id = mission_id,
            task_id = task_id,
            branch = %branch,
            path = %wt_path.display(),
            "acquired worktree"
        );

        let mut worktrees = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
        worktrees.insert(
            task_id.to_owned(),
            TaskWorktree {
                mission_id: mission_id.to_owned(),
                path: wt_path.clone(),
                branch,
            },
        );
        Ok(wt_path)
    }

    /// Path of an acquired worktree, if any.
    pub fn worktree_path(&self, task_id: &str) -> Option<PathBuf> {
        let worktrees = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
        worktrees.get(task_id).map(|w| w.path.clone())
    }

    /// Stage and commit everything in a task's worktree, then push its
    /// branch. Returns `Ok(false)` without committing when there are no
    /// changes.
    pub fn commit_and_push(&self, task_id: &str) -> Result<bool, WorktreeError> {
        let record = {
            let worktrees = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
            worktrees
                .get(task_id)
                .cloned()
                .ok_or_else(|| WorktreeError::UnknownTask(task_id.to_owned()))?
        };

        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        // Worktrees may not inherit identity configuration.
        let _ = run_git(&["config", "user.email", "worldmind@localhost"], &record.path);
        let _ = run_git(&["config", "user.name", "worldmind"], &record.path);

        run_git(&["add", "-A"], &record.path)?;

        let status = run_git(&["status", "--porcelain"], &record.path)?;
        if status.trim().is_empty() {
            tracing::info!(task_id = task_id, "no changes to commit");
            return Ok(false);
        }

        let message = format!("worldmind: {task_id} results");
        run_git(&["commit", "-m", &message], &record.path)?;

        // Push is best-effort when the clone has no remote (local missions).
        if let Err(e) = run_git(
            &["push", "-u", "origin", &record.branch],
            &record.path,
        ) {
            tracing::warn!(task_id = task_id, error = %e, "push failed (non-fatal)");
        }

        Ok(true)
    }

    /// Remove a task's worktree, preserving its branch for a later merge.
    ///
    /// Tolerant of missing worktrees: a release for an unknown or
    /// already-removed task only logs.
    pub fn release_worktree(&self, mission_id: &str, task_id: &str) {
        let record = {
            let mut worktrees = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
            worktrees.remove(task_id)
        };

        let Some(record) = record else {
            tracing::warn!(
                mission_id = mission_id,
                task_id = task_id,
                "release for task with no acquired worktree"
            );
            return;
        };

        let clone_path = {
            let clones = self.clones.lock().unwrap_or_else(|e| e.into_inner());
            clones.get(&record.mission_id).cloned()
        };

        let _git = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(clone_path) = clone_path {
            if let Err(e) = run_git(
                &[
                    "worktree",
                    "remove",
                    "--force",
                    &record.path.to_string_lossy(),
                ],
                &clone_path,
            ) {
                tracing::warn!(
                    task_id = task_id,
                    error = %e,
                    "worktree remove failed (non-fatal)"
                );
            }
        }
    }

    /// Remove every remaining worktree for a mission, then the workspace
    /// directory itself.
    pub fn cleanup_mission(&self, mission_id: &str) {
        let task_ids: Vec<String> = {
            let worktrees = self.worktrees.lock().unwrap_or_else(|e| e.into_inner());
            worktrees
                .iter()
                .filter(|(_, w)| w.mission_id == mission_id)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for task_id in task_ids {
            self.release_worktree(mission_id, &task_id);
        }

        {
            let mut clones = self.clones.lock().unwrap_or_else(|e| e.into_inner());
            clones.remove(mission_id);
        }

        let mission_dir = self.base.join(mission_id);
        if mission_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&mission_dir) {
                tracing::warn!(
                    mission_id = mission_id,
                    error = %e,
                    "failed to remove mission workspace (non-fatal)"
                );
            }
        }
        tracing::info!(mission_id = mission_id, "mission workspace cleaned up");
    }
}

/// Run a git command in `dir`, returning stdout on success.
fn run_git(args: &[&str], dir: &Path) -> Result<String, WorktreeError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map_err(|e| WorktreeError::GitCommand {
            message: format!("failed to run git {}", args.join(" ")),
            source: e,
        })?;

    if !output.status.success() {
        return Err(WorktreeError::GitExit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Whether a local branch exists in the clone.
fn branch_exists(clone_path: &Path, branch: &str) -> Result<bool, WorktreeError> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", branch])
        .current_dir(clone_path)
        .output()
        .map_err(|e| WorktreeError::GitCommand {
            message: "failed to run git rev-parse".into(),
            source: e,
        })?;
    Ok(output.status.success())
}
