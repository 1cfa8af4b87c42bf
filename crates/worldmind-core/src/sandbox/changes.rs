//! File-change detection and output truncation.
//!
//! The default change detector snapshots the project tree before a sandbox
//! runs and diffs it afterwards: paths absent from the before-snapshot are
//! `created`, paths with a different mtime are `modified`, and paths absent
//! afterwards are `deleted`.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::mission::model::{FileChange, FileChangeKind};

/// Directories never included in snapshots.
const EXCLUDED_DIRS: &[&str] = &[".git", ".worldmind"];

/// Snapshot of a project tree: relative path -> (mtime in nanos, length).
///
/// Length is recorded alongside mtime because same-size rewrites within
/// one timestamp tick are otherwise invisible on coarse filesystems.
pub type FileSnapshot = BTreeMap<String, (u128, u64)>;

/// Walk the project tree and record every file's mtime, excluding `.git`
/// and `.worldmind`. Unreadable entries are skipped.
pub fn snapshot(project_path: &Path) -> FileSnapshot {
    let mut snap = FileSnapshot::new();
    walk(project_path, project_path, &mut snap);
    snap
}

fn walk(root: &Path, dir: &Path, snap: &mut FileSnapshot) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if path.is_dir() {
            if EXCLUDED_DIRS.iter().any(|ex| *ex == name) || name.starts_with(".worldmind") {
                continue;
            }
            walk(root, &path, snap);
        } else if path.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let metadata = entry.metadata().ok();
            let mtime = metadata
                .as_ref()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            let len = metadata.map(|m| m.len()).unwrap_or(0);
            snap.insert(
                relative.to_string_lossy().replace('\\', "/"),
                (mtime, len),
            );
        }
    }
}

/// Diff a before-snapshot against the current tree state.
pub fn diff_snapshots(before: &FileSnapshot, project_path: &Path) -> Vec<FileChange> {
    let after = snapshot(project_path);
    diff(before, &after)
}

/// Diff two snapshots directly.
pub fn diff(before: &FileSnapshot, after: &FileSnapshot) -> Vec<FileChange> {
    let mut changes = Vec::new();

    for (path, stamp) in after {
        match before.get(path) {
            None => changes.push(FileChange {
                path: path.clone(),
                kind: FileChangeKind::Created,
            }),
            Some(old) if old != stamp => changes.push(FileChange {
                path: path.clone(),
                kind: FileChangeKind::Modified,
            }),
            Some(_) => {}
        }
    }

    for path in before.keys() {
        if !after.contains_key(path) {
            changes.push(FileChange {
                path: path.clone(),
                kind: FileChangeKind::Deleted,
            });
        }
    }

    changes
}

/// Truncate sandbox output to roughly `max_bytes`, preserving the head and
/// tail around an elision marker.
pub fn truncate_output(raw: &str, max_bytes: usize) -> String {
    if raw.len() <= max_bytes {
        return raw.to_owned();
    }

    let keep = max_bytes / 2;
    let head_end = floor_char_boundary(raw, keep);
    let tail_start = ceil_char_boundary(raw, raw.len() - keep);
    let elided = raw.len() - head_end - (raw.len() - tail_start);

    format!(
        "{}\n\n... [truncated {} chars] ...\n\n{}",
        &raw[..head_end],
        elided,
        &raw[tail_start..]
    )
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}
