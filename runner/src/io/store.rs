//! Artifact store: one directory per run under `<output>/runs/<run_id>/`.
//!
//! ```text
//! manifest.json                  run status + ordered attempt summaries
//! spec.json                      algorithm description
//! revisions/<n>/project.json     immutable project revisions
//! attempts/<i>/record.json       attempt record (latest state)
//! attempts/<i>/result.json       execution result
//! attempts/<i>/stdout.log        captured stdout
//! attempts/<i>/stderr.log        captured stderr
//! attempts/<i>/repairs/<k>.json  every patch received for the attempt
//! project/                       final revision, exported on termination
//! ```
//!
//! Writes for a run go through a [`RunStore`], which holds an exclusive lock
//! file for the run directory so concurrent writers cannot interleave.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::project::revision_digest;
use crate::core::types::{
    AlgorithmSpec, AttemptRecord, CodeProject, ErrorCategory, ExitStatus, RepairPatch, RunStatus,
};
use crate::io::process::process_alive;

const LOCK_FILE: &str = ".lock";

/// Root of all runs and working directories.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    /// Parent of per-attempt working directories.
    pub fn work_root(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    /// Whether a live writer currently holds the lock for `run_id`.
    ///
    /// A lock left behind by a crashed writer names a process that no longer
    /// exists and is reported as unlocked, so its working directories can be
    /// swept.
    pub fn is_locked(&self, run_id: &str) -> bool {
        let path = self.run_dir(run_id).join(LOCK_FILE);
        let Ok(raw) = fs::read_to_string(&path) else {
            return false;
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) if process_alive(pid) => true,
            Ok(pid) => {
                debug!(run_id, pid, "lock holder is gone");
                false
            }
            Err(_) => {
                debug!(run_id, "lock file names no process");
                false
            }
        }
    }

    /// Create the directory for a new run and take its writer lock.
    pub fn create_run(&self, run_id: &str) -> Result<RunStore> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            bail!("invalid run id {run_id:?}");
        }
        let runs = self.runs_dir();
        fs::create_dir_all(&runs).with_context(|| format!("create {}", runs.display()))?;
        let dir = self.run_dir(run_id);
        fs::create_dir(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        let lock = RunLock::acquire(&dir)?;
        info!(run_id, dir = %dir.display(), "created run directory");
        Ok(RunStore {
            run_id: run_id.to_string(),
            dir,
            _lock: lock,
        })
    }
}

/// Exclusive writer lock, released on drop.
#[derive(Debug)]
struct RunLock {
    path: PathBuf,
}

impl RunLock {
    fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("run {} is locked by another writer", dir.display()))?;
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("write lock {}", path.display()))?;
        Ok(Self { path })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), err = %e, "failed to release run lock");
        }
    }
}

/// Writer for a single run directory.
#[derive(Debug)]
pub struct RunStore {
    run_id: String,
    dir: PathBuf,
    _lock: RunLock,
}

impl RunStore {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write_spec(&self, spec: &AlgorithmSpec) -> Result<()> {
        write_json_atomic(&self.dir.join("spec.json"), spec)
    }

    /// Persist a revision. Rewriting identical content is a no-op; different
    /// content for an existing revision is an error.
    pub fn write_revision(&self, project: &CodeProject) -> Result<()> {
        let path = self
            .dir
            .join("revisions")
            .join(project.revision.to_string())
            .join("project.json");
        if path.exists() {
            let existing: CodeProject = read_json(&path)?;
            if &existing == project {
                return Ok(());
            }
            bail!(
                "revision {} already persisted with different content",
                project.revision
            );
        }
        debug!(revision = project.revision, "persisting revision");
        write_json_atomic(&path, project)
    }

    /// Persist the current state of an attempt record with its raw output.
    pub fn write_attempt(&self, record: &AttemptRecord) -> Result<()> {
        let dir = self.attempt_dir(record.index);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        write_text(&dir.join("stdout.log"), &record.result.stdout)?;
        write_text(&dir.join("stderr.log"), &record.result.stderr)?;
        write_json_atomic(&dir.join("result.json"), &record.result)?;
        if let Some(patch) = &record.patch {
            write_json_atomic(&dir.join("patch.json"), patch)?;
        }
        write_json_atomic(&dir.join("record.json"), record)
    }

    /// Keep every patch received for an attempt, including rejected ones.
    pub fn write_repair(&self, attempt: u32, seq: u32, patch: &RepairPatch) -> Result<()> {
        let path = self
            .attempt_dir(attempt)
            .join("repairs")
            .join(format!("{seq}.json"));
        write_json_atomic(&path, patch)
    }

    pub fn write_manifest(&self, manifest: &Manifest) -> Result<()> {
        write_json_atomic(&self.dir.join("manifest.json"), manifest)
    }

    /// Write the final revision as a standalone project under `project/`.
    pub fn export_project(&self, project: &CodeProject) -> Result<PathBuf> {
        let dest = self.dir.join("project");
        if dest.exists() {
            fs::remove_dir_all(&dest).with_context(|| format!("remove {}", dest.display()))?;
        }
        fs::create_dir_all(&dest).with_context(|| format!("create {}", dest.display()))?;
        for (rel, content) in &project.files {
            let path = dest.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create {}", parent.display()))?;
            }
            write_text(&path, content)?;
        }
        if !project.requirements.is_empty() && !project.files.contains_key("requirements.txt") {
            write_text(&dest.join("requirements.txt"), &project.requirements_txt())?;
        }
        if !project.files.contains_key("README.md") {
            write_text(&dest.join("README.md"), &render_readme(project))?;
        }
        info!(revision = project.revision, dir = %dest.display(), "exported project");
        Ok(dest)
    }

    fn attempt_dir(&self, index: u32) -> PathBuf {
        self.dir.join("attempts").join(index.to_string())
    }
}

/// Run lifecycle as recorded in the manifest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Running,
    Succeeded,
    Exhausted,
    Fatal,
}

impl ManifestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ManifestStatus::Running => "running",
            ManifestStatus::Succeeded => "succeeded",
            ManifestStatus::Exhausted => "exhausted",
            ManifestStatus::Fatal => "fatal",
        }
    }
}

/// Budgets the run was started with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestConfig {
    pub max_attempts: u32,
    pub timeout_secs: u64,
    pub isolation: String,
    pub repair_budget: u32,
    pub infra_retry_limit: u32,
}

/// Per-attempt summary in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestAttempt {
    pub index: u32,
    pub revision: u32,
    pub revision_digest: String,
    pub exit_status: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub error_category: Option<ErrorCategory>,
    pub infra_retries: u32,
    pub repair_requests: u32,
    pub repair_failures: u32,
    pub terminal: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ManifestAttempt {
    pub fn from_record(record: &AttemptRecord, project: &CodeProject) -> Self {
        let exit_code = match &record.result.status {
            ExitStatus::NonZeroExit { code } => *code,
            ExitStatus::Success => Some(0),
            ExitStatus::Timeout
            | ExitStatus::InfrastructureFailure { .. }
            | ExitStatus::Cancelled => None,
        };
        Self {
            index: record.index,
            revision: record.revision,
            revision_digest: revision_digest(project),
            exit_status: record.result.status.as_str().to_string(),
            exit_code,
            duration_ms: record.result.duration_ms,
            error_category: record.result.classification.as_ref().map(|c| c.category),
            infra_retries: record.infra_failures.len() as u32,
            repair_requests: record.repair_requests,
            repair_failures: record.repair_failures.len() as u32,
            terminal: record.terminal,
            warnings: record.warnings.clone(),
        }
    }
}

/// Machine-readable summary of a run (`manifest.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub run_id: String,
    pub spec_name: String,
    pub status: ManifestStatus,
    #[serde(default)]
    pub fatal_reason: Option<String>,
    pub started_at: String,
    #[serde(default)]
    pub ended_at: Option<String>,
    pub config: ManifestConfig,
    pub repair_requests: u32,
    #[serde(default)]
    pub final_revision: Option<u32>,
    pub attempts: Vec<ManifestAttempt>,
}

impl Manifest {
    pub fn new(run_id: &str, spec_name: &str, config: ManifestConfig) -> Self {
        Self {
            run_id: run_id.to_string(),
            spec_name: spec_name.to_string(),
            status: ManifestStatus::Running,
            fatal_reason: None,
            started_at: now_rfc3339(),
            ended_at: None,
            config,
            repair_requests: 0,
            final_revision: None,
            attempts: Vec::new(),
        }
    }

    /// Record the terminal status and end time.
    pub fn finish(&mut self, status: &RunStatus) {
        let (status, reason) = match status {
            RunStatus::Succeeded => (ManifestStatus::Succeeded, None),
            RunStatus::Exhausted => (ManifestStatus::Exhausted, None),
            RunStatus::Fatal { reason } => (ManifestStatus::Fatal, Some(reason.clone())),
        };
        self.status = status;
        self.fatal_reason = reason;
        self.ended_at = Some(now_rfc3339());
    }

    /// Human-readable summary for the terminal.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("run:       {}\n", self.run_id));
        out.push_str(&format!("algorithm: {}\n", self.spec_name));
        out.push_str(&format!("status:    {}\n", self.status.as_str()));
        if let Some(reason) = &self.fatal_reason {
            out.push_str(&format!("reason:    {reason}\n"));
        }
        out.push_str(&format!(
            "attempts:  {} of {} (repair requests: {})\n",
            self.attempts.len(),
            self.config.max_attempts,
            self.repair_requests
        ));
        if let Some(revision) = self.final_revision {
            out.push_str(&format!("final:     revision {revision}\n"));
        }
        for attempt in &self.attempts {
            let category = attempt
                .error_category
                .map(|c| format!(" [{}]", category_label(c)))
                .unwrap_or_default();
            let code = attempt
                .exit_code
                .map(|c| format!(" code={c}"))
                .unwrap_or_default();
            out.push_str(&format!(
                "  #{} r{} {}{}{} {}ms{}\n",
                attempt.index,
                attempt.revision,
                attempt.exit_status,
                code,
                category,
                attempt.duration_ms,
                if attempt.terminal { " (terminal)" } else { "" }
            ));
            for warning in &attempt.warnings {
                out.push_str(&format!("      warning: {warning}\n"));
            }
        }
        out
    }
}

fn category_label(category: ErrorCategory) -> String {
    serde_json::to_value(category)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{category:?}"))
}

/// Load `manifest.json` from a run directory.
pub fn load_manifest(run_dir: &Path) -> Result<Manifest> {
    read_json(&run_dir.join("manifest.json"))
}

/// Load every attempt record of a run, ordered by index.
pub fn load_attempts(run_dir: &Path) -> Result<Vec<AttemptRecord>> {
    let dir = run_dir.join("attempts");
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path().join("record.json");
        if path.exists() {
            let record: AttemptRecord = read_json(&path)?;
            records.push(record);
        }
    }
    records.sort_by_key(|r| r.index);
    for (expected, record) in records.iter().enumerate() {
        if record.index as usize != expected {
            return Err(anyhow!(
                "attempt records are not contiguous: expected {expected}, found {}",
                record.index
            ));
        }
    }
    Ok(records)
}

/// Run identifier: UTC timestamp plus a short random suffix.
pub fn generate_run_id() -> String {
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), short_id())
}

/// Six lowercase alphanumeric characters.
pub fn short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn render_readme(project: &CodeProject) -> String {
    let mut out = format!("# {}\n\n", project.name);
    if !project.description.trim().is_empty() {
        out.push_str(project.description.trim());
        out.push_str("\n\n");
    }
    out.push_str("## Usage\n\n");
    if project.usage.trim().is_empty() {
        out.push_str(&format!("```\npython {}\n```\n\n", project.entrypoint));
    } else {
        out.push_str(project.usage.trim());
        out.push_str("\n\n");
    }
    if !project.requirements.is_empty() {
        out.push_str("## Requirements\n\n```\npip install -r requirements.txt\n```\n\n");
    }
    if !project.notes.trim().is_empty() {
        out.push_str("## Notes\n\n");
        out.push_str(project.notes.trim());
        out.push('\n');
    }
    out
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

/// Serialize `value` as pretty JSON and replace `path` atomically (temp file + rename).
fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
