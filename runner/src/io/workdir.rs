//! Scoped working directories for sandbox attempts.
//!
//! Each execution gets a fresh directory named `<run_id>.r<revision>` under the
//! work root. The directory is removed when the [`Workdir`] guard drops, so
//! every exit path of the executor cleans up. Directories left behind by a
//! crashed process are found again by name and removed by [`sweep_stale`].

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::project::path_problem;
use crate::core::types::CodeProject;

const REVISION_MARKER: &str = ".r";

/// Directory name for one revision of a run.
pub fn workdir_name(run_id: &str, revision: u32) -> String {
    format!("{run_id}{REVISION_MARKER}{revision}")
}

/// Split a working directory name back into `(run_id, revision)`.
pub fn parse_workdir_name(name: &str) -> Option<(&str, u32)> {
    let (run_id, revision) = name.rsplit_once(REVISION_MARKER)?;
    if run_id.is_empty() {
        return None;
    }
    let revision = revision.parse().ok()?;
    Some((run_id, revision))
}

/// Owned attempt directory, removed on drop.
#[derive(Debug)]
pub struct Workdir {
    path: PathBuf,
}

impl Workdir {
    /// Create a fresh directory for `revision`.
    ///
    /// A leftover directory with the same name (from a crash) is removed first.
    pub fn create(work_root: &Path, run_id: &str, revision: u32) -> Result<Self> {
        fs::create_dir_all(work_root)
            .with_context(|| format!("create work root {}", work_root.display()))?;
        let path = work_root.join(workdir_name(run_id, revision));
        if path.exists() {
            warn!(path = %path.display(), "removing stale working directory");
            fs::remove_dir_all(&path)
                .with_context(|| format!("remove stale workdir {}", path.display()))?;
        }
        fs::create_dir(&path).with_context(|| format!("create workdir {}", path.display()))?;
        debug!(path = %path.display(), "created working directory");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write every project file plus `requirements.txt` when requirements exist.
    pub fn materialize(&self, project: &CodeProject) -> Result<()> {
        for (rel, content) in &project.files {
            if let Some(problem) = path_problem(rel) {
                return Err(anyhow!("cannot materialize {rel:?}: {problem}"));
            }
            let dest = self.path.join(rel);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create directory {}", parent.display()))?;
            }
            fs::write(&dest, content).with_context(|| format!("write {}", dest.display()))?;
        }
        if !project.requirements.is_empty() && !project.files.contains_key("requirements.txt") {
            let dest = self.path.join("requirements.txt");
            fs::write(&dest, project.requirements_txt())
                .with_context(|| format!("write {}", dest.display()))?;
        }
        Ok(())
    }
}

impl Drop for Workdir {
    fn drop(&mut self) {
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "removed working directory"),
            Err(e) => warn!(path = %self.path.display(), err = %e, "failed to remove working directory"),
        }
    }
}

/// Remove working directories left under `work_root`.
///
/// Only directories whose name parses as `<run_id>.r<revision>` and whose run
/// id passes `should_remove` are touched. Returns the removed paths in sorted
/// order.
pub fn sweep_stale(
    work_root: &Path,
    should_remove: impl Fn(&str) -> bool,
) -> Result<Vec<PathBuf>> {
    if !work_root.exists() {
        return Ok(Vec::new());
    }
    let mut removed = Vec::new();
    let entries =
        fs::read_dir(work_root).with_context(|| format!("read {}", work_root.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", work_root.display()))?;
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let Some((owner, _revision)) = name.to_str().and_then(parse_workdir_name) else {
            continue;
        };
        if !should_remove(owner) {
            continue;
        }
        let path = entry.path();
        fs::remove_dir_all(&path).with_context(|| format!("remove {}", path.display()))?;
        removed.push(path);
    }
    removed.sort();
    if !removed.is_empty() {
        info!(count = removed.len(), root = %work_root.display(), "swept stale working directories");
    }
    Ok(removed)
}
