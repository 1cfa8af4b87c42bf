//! Local filesystem project scanner.
//!
//! Walks the project tree, infers language and framework from file
//! extensions and manifest files, and collects declared dependencies.

use std::path::Path;

use async_trait::async_trait;

use crate::mission::model::ProjectContext;
use super::caller::ProjectScanner;

/// Directories skipped while walking.
const SKIPPED_DIRS: &[&str] = &[
    ".git",
    ".worldmind",
    "node_modules",
    "target",
    "__pycache__",
    ".venv",
    "venv",
];

/// Scanner over the local filesystem.
#[derive(Debug, Default)]
pub struct FsProjectScanner;

#[async_trait]
impl ProjectScanner for FsProjectScanner {
    async fn scan(&self, project_path: &Path) -> anyhow::Result<ProjectContext> {
        if !project_path.is_dir() {
            anyhow::bail!("project path {} is not a directory", project_path.display());
        }

        let mut file_tree = Vec::new();
        walk(project_path, project_path, &mut file_tree);
        file_tree.sort();

        let language = infer_language(&file_tree);
        let framework = infer_framework(project_path, &file_tree);
        let dependencies = collect_dependencies(project_path, &file_tree);

        let summary = format!(
            "{} project with {} files{}",
            language,
            file_tree.len(),
            if framework.is_empty() {
                String::new()
            } else {
                format!(", using {framework}")
            }
        );

        Ok(ProjectContext {
            language,
            framework,
            file_tree,
            dependencies,
            summary,
        })
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy().into_owned();

        if path.is_dir() {
            if SKIPPED_DIRS.contains(&name.as_str()) || name.starts_with(".worldmind") {
                continue;
            }
            walk(root, &path, out);
        } else if path.is_file() {
            if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
    }
}

/// Pick the language with the most source files.
fn infer_language(file_tree: &[String]) -> String {
    let buckets: &[(&str, &[&str])] = &[
        ("Python", &["py"]),
        ("Rust", &["rs"]),
        ("Java", &["java"]),
        ("TypeScript", &["ts", "tsx"]),
        ("JavaScript", &["js", "jsx"]),
        ("Go", &["go"]),
    ];

    let mut best = ("unknown", 0usize);
    for (language, extensions) in buckets {
        let count = file_tree
            .iter()
            .filter(|path| {
                Path::new(path)
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| extensions.contains(&e))
            })
            .count();
        if count > best.1 {
            best = (language, count);
        }
    }
    best.0.to_owned()
}

/// Shallow framework detection from well-known manifest contents.
fn infer_framework(project_path: &Path, file_tree: &[String]) -> String {
    let has = |name: &str| file_tree.iter().any(|p| p == name);

    if has("pom.xml") {
        let pom = std::fs::read_to_string(project_path.join("pom.xml")).unwrap_or_default();
        if pom.contains("spring-boot") {
            return "Spring Boot".to_owned();
        }
        return "Maven".to_owned();
    }
    if has("requirements.txt") {
        let reqs =
            std::fs::read_to_string(project_path.join("requirements.txt")).unwrap_or_default();
        for (needle, framework) in [("fastapi", "FastAPI"), ("flask", "Flask"), ("django", "Django")]
        {
            if reqs.to_lowercase().contains(needle) {
                return framework.to_owned();
            }
        }
    }
    if has("package.json") {
        let pkg =
            std::fs::read_to_string(project_path.join("package.json")).unwrap_or_default();
        for (needle, framework) in [("\"react\"", "React"), ("\"express\"", "Express")] {
            if pkg.contains(needle) {
                return framework.to_owned();
            }
        }
    }
    String::new()
}

/// Collect declared dependency names from whichever manifests exist.
fn collect_dependencies(project_path: &Path, file_tree: &[String]) -> Vec<String> {
    let mut deps = Vec::new();

    if file_tree.iter().any(|p| p == "requirements.txt") {
        if let Ok(contents) = std::fs::read_to_string(project_path.join("requirements.txt")) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let name: String = line
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
                    .collect();
                if !name.is_empty() {
                    deps.push(name);
                }
            }
        }
    }

    if file_tree.iter().any(|p| p == "package.json") {
        if let Ok(contents) = std::fs::read_to_string(project_path.join("package.json")) {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&contents) {
                for section in ["dependencies", "devDependencies"] {
                    if let Some(map) = json.get(section).and_then(|v| v.as_object()) {
                        deps.extend(map.keys().cloned());
                    }
                }
            }
        }
    }

    deps.sort();
    deps.dedup();
    deps
}
