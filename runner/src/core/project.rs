//! Structural invariants for code project revisions.

use std::path::{Component, Path};
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::core::types::CodeProject;

/// Check invariants every revision must satisfy:
/// - At least one file
/// - Paths are non-empty, relative and free of `..`
/// - The entrypoint names exactly one existing file
pub fn validate_project(project: &CodeProject) -> Vec<String> {
    let mut errors = Vec::new();

    if project.files.is_empty() {
        errors.push(format!("revision {}: project has no files", project.revision));
    }

    for path in project.files.keys() {
        if let Some(problem) = path_problem(path) {
            errors.push(format!("{path:?}: {problem}"));
        }
    }

    if project.entrypoint.trim().is_empty() {
        errors.push("entrypoint must be set".to_string());
    } else if !project.files.contains_key(&project.entrypoint) {
        errors.push(format!(
            "entrypoint {:?} is not a project file",
            project.entrypoint
        ));
    }

    errors
}

/// Describe why `path` cannot be materialized inside a working directory.
pub fn path_problem(path: &str) -> Option<&'static str> {
    if path.trim().is_empty() {
        return Some("path must be non-empty");
    }
    let parsed = Path::new(path);
    for component in parsed.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return Some("path must not contain '..'"),
            Component::RootDir | Component::Prefix(_) => return Some("path must be relative"),
        }
    }
    None
}

/// Constructs that escape the program's intended scope. Method calls such as
/// `model.eval()` do not match.
static RISKY_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("subprocess", r"\bsubprocess\b"),
        ("os.system", r"\bos\.system\s*\("),
        ("eval(", r"(?:^|[^\w.])eval\s*\("),
        ("exec(", r"(?:^|[^\w.])exec\s*\("),
        ("__import__", r"\b__import__\s*\("),
    ]
    .into_iter()
    .map(|(name, re)| (name, Regex::new(re).expect("valid regex")))
    .collect()
});

/// Warnings for risky constructs, one per file and pattern, as
/// `<path>:<line>: uses <pattern>`. Warnings never block execution.
pub fn risky_patterns(project: &CodeProject) -> Vec<String> {
    let mut warnings = Vec::new();
    for (path, content) in &project.files {
        for (name, re) in RISKY_PATTERNS.iter() {
            let hit = content
                .lines()
                .enumerate()
                .find(|(_, line)| re.is_match(line));
            if let Some((idx, _)) = hit {
                warnings.push(format!("{path}:{}: uses {name}", idx + 1));
            }
        }
    }
    warnings
}

/// SHA-256 over sorted `(path, content)` pairs, entrypoint and requirements.
///
/// Independent of the revision number so identical content hashes equal.
pub fn revision_digest(project: &CodeProject) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in &project.files {
        hasher.update(path.as_bytes());
        hasher.update([0u8]);
        hasher.update(content.len().to_le_bytes());
        hasher.update(content.as_bytes());
    }
    hasher.update(b"entrypoint\0");
    hasher.update(project.entrypoint.as_bytes());
    for req in &project.requirements {
        hasher.update(b"\0req\0");
        hasher.update(req.as_bytes());
    }
    hex::encode(hasher.finalize())
}
