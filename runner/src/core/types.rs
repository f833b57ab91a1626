//! Shared deterministic types for the generate-execute-repair loop.
//!
//! These types define stable contracts between core components and the
//! artifacts persisted for each run. They must not depend on external state or
//! I/O; serialized forms are part of the run manifest and attempt records.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Algorithm description extracted from a paper by an external collaborator.
///
/// Read-only once produced. The core only forwards it to collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmSpec {
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<TypedValue>,
    #[serde(default)]
    pub outputs: Vec<TypedValue>,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub libraries: BTreeSet<String>,
    #[serde(default)]
    pub hyperparameters: BTreeMap<String, Hyperparameter>,
    #[serde(default)]
    pub equations: Vec<String>,
    #[serde(default)]
    pub complexity: Option<Complexity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedValue {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameter {
    #[serde(rename = "type")]
    pub ty: String,
    #[serde(default)]
    pub default: serde_json::Value,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complexity {
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub space: Option<String>,
}

/// One immutable revision of a generated code project.
///
/// Repairs never edit a revision in place; the merger produces a new revision
/// numbered `base.revision + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeProject {
    pub revision: u32,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Relative path -> full file content. Ordered for deterministic output.
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub requirements: BTreeSet<String>,
    /// Path of the file launched by the sandbox. Must be a key of `files`.
    pub entrypoint: String,
    #[serde(default)]
    pub usage: String,
    #[serde(default)]
    pub notes: String,
}

impl CodeProject {
    /// Render `requirements.txt` content (sorted, one per line).
    pub fn requirements_txt(&self) -> String {
        let mut buf = String::new();
        for req in &self.requirements {
            buf.push_str(req);
            buf.push('\n');
        }
        buf
    }
}

/// How a single execution ended.
///
/// `Timeout` and `InfrastructureFailure` are distinct from `NonZeroExit`:
/// the retry policy budgets them differently. `Cancelled` means the run was
/// interrupted while the program executed and ends the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    Success,
    NonZeroExit { code: Option<i32> },
    Timeout,
    InfrastructureFailure { reason: String },
    Cancelled,
}

impl ExitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitStatus::Success => "success",
            ExitStatus::NonZeroExit { .. } => "non_zero_exit",
            ExitStatus::Timeout => "timeout",
            ExitStatus::InfrastructureFailure { .. } => "infrastructure_failure",
            ExitStatus::Cancelled => "cancelled",
        }
    }
}

/// Coarse category of a program failure, derived from captured diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Syntax,
    Import,
    Type,
    Value,
    Index,
    Attribute,
    ShapeMismatch,
    Memory,
    Timeout,
    Runtime,
}

impl ErrorCategory {
    /// Whether a code change is likely to fix this category.
    pub fn likely_fixable(self) -> bool {
        !matches!(self, ErrorCategory::Timeout | ErrorCategory::Memory)
    }
}

/// Structured error classification attached to failed executions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorClass {
    pub category: ErrorCategory,
    pub error_type: Option<String>,
    pub line: Option<u32>,
    pub message: Option<String>,
    pub fixable: bool,
}

/// Outcome of executing one revision in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub revision: u32,
    pub status: ExitStatus,
    /// Captured stdout, including the truncation marker when capped.
    pub stdout: String,
    /// Captured stderr, including the truncation marker when capped.
    pub stderr: String,
    #[serde(default)]
    pub stdout_truncated: usize,
    #[serde(default)]
    pub stderr_truncated: usize,
    pub duration_ms: u64,
    pub classification: Option<ErrorClass>,
}

impl ExecutionResult {
    /// Result used when the sandbox could not run the program at all.
    pub fn infrastructure_failure(revision: u32, reason: impl Into<String>) -> Self {
        Self {
            revision,
            status: ExitStatus::InfrastructureFailure {
                reason: reason.into(),
            },
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            duration_ms: 0,
            classification: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExitStatus::Success && self.classification.is_none()
    }
}

/// One file-level change proposed by the repair collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    /// Full replacement content.
    pub content: String,
    /// Must be set to add a path that does not exist in the base revision.
    #[serde(default)]
    pub new_file: bool,
}

/// Repair proposal targeting a specific base revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairPatch {
    /// Revision this patch repairs.
    pub revision: u32,
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub added_requirements: BTreeSet<String>,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairFailureKind {
    /// The patch violated the merger's structural invariants.
    InvalidPatch,
    /// The collaborator failed or returned an unusable response.
    CollaboratorError,
    /// The collaborator exceeded the configured ceiling.
    CollaboratorTimeout,
}

/// A repair request that did not yield a usable revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairFailure {
    pub kind: RepairFailureKind,
    pub detail: String,
}

/// Append-only record of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 0-based attempt index.
    pub index: u32,
    /// Revision executed by this attempt.
    pub revision: u32,
    /// Final execution result for this attempt.
    pub result: ExecutionResult,
    /// Reasons for infrastructure failures retried within this attempt.
    #[serde(default)]
    pub infra_failures: Vec<String>,
    /// Repair requests issued after this attempt.
    #[serde(default)]
    pub repair_requests: u32,
    /// Repair requests that did not produce a valid revision.
    #[serde(default)]
    pub repair_failures: Vec<RepairFailure>,
    /// Patch that produced the next revision, if any.
    #[serde(default)]
    pub patch: Option<RepairPatch>,
    /// True for the attempt that ended the run.
    #[serde(default)]
    pub terminal: bool,
    /// Risky constructs found in the executed revision.
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// The latest execution succeeded.
    Succeeded,
    /// The execution budget was consumed by program failures.
    Exhausted,
    /// The environment could not run the experiment.
    Fatal { reason: String },
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Succeeded => "succeeded",
            RunStatus::Exhausted => "exhausted",
            RunStatus::Fatal { .. } => "fatal",
        }
    }
}

/// Resource bounds applied to every execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub cpu_secs: u64,
    pub memory_mb: u64,
    pub cpus: f64,
    pub pids: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_secs: 120,
            memory_mb: 2048,
            cpus: 2.0,
            pids: 256,
        }
    }
}
