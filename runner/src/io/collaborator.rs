//! Collaborator abstraction for code generation and repair.
//!
//! The [`CodeGenerator`] and [`Repairer`] traits decouple the pipeline from
//! whatever produces code (an LLM wrapper script, a human, a fixture). The
//! command-backed [`CommandCollaborator`] runs an external program: the
//! request is written as JSON, the rendered brief is fed on stdin and the
//! program writes its JSON response to a path it is given. Responses are
//! checked against an embedded JSON Schema before use.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::types::{
    AlgorithmSpec, CodeProject, ExecutionResult, RepairFailure, RepairFailureKind, RepairPatch,
};
use crate::io::process::{CommandOutput, ProcessLimits, run_command_with_timeout};
use crate::io::prompt::{generate_brief, repair_brief};
use crate::io::schema::{GENERATED_PROJECT_SCHEMA, REPAIR_PATCH_SCHEMA, schema_violations};

/// Why a collaborator call produced nothing usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("collaborator failed: {0}")]
    Failed(String),
    #[error("collaborator returned an invalid response: {0}")]
    InvalidResponse(String),
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),
}

impl CollaboratorError {
    /// Repair-failure record for this error. Timeouts are budgeted like
    /// infrastructure failures, everything else consumes a repair attempt.
    pub fn to_repair_failure(&self) -> RepairFailure {
        let kind = match self {
            CollaboratorError::Timeout(_) => RepairFailureKind::CollaboratorTimeout,
            CollaboratorError::Failed(_) | CollaboratorError::InvalidResponse(_) => {
                RepairFailureKind::CollaboratorError
            }
        };
        RepairFailure {
            kind,
            detail: self.to_string(),
        }
    }
}

/// Everything the repair collaborator needs to propose a patch.
#[derive(Debug, Clone, Serialize)]
pub struct RepairRequest<'a> {
    /// Attempt whose execution failed.
    pub attempt: u32,
    pub spec: &'a AlgorithmSpec,
    /// Revision that failed; the patch must target `project.revision`.
    pub project: &'a CodeProject,
    pub result: &'a ExecutionResult,
    /// Validation failure of the previous patch for this attempt, if any.
    pub feedback: Option<&'a str>,
}

/// Produces the initial project from an algorithm description.
pub trait CodeGenerator {
    fn generate(&self, spec: &AlgorithmSpec) -> Result<CodeProject, CollaboratorError>;
}

/// Proposes a patch for a failed execution.
pub trait Repairer {
    fn repair(&self, request: &RepairRequest<'_>) -> Result<RepairPatch, CollaboratorError>;
}

/// Generation response; the pipeline assigns the revision.
#[derive(Debug, Clone, Deserialize)]
struct GeneratedProject {
    name: String,
    #[serde(default)]
    description: String,
    files: BTreeMap<String, String>,
    #[serde(default)]
    requirements: BTreeSet<String>,
    entrypoint: String,
    #[serde(default)]
    usage: String,
    #[serde(default)]
    notes: String,
}

impl GeneratedProject {
    fn into_project(self) -> CodeProject {
        CodeProject {
            revision: 0,
            name: self.name,
            description: self.description,
            files: self.files,
            requirements: self.requirements,
            entrypoint: self.entrypoint,
            usage: self.usage,
            notes: self.notes,
        }
    }
}

/// Collaborator that runs an external command per call.
///
/// `{input}`, `{output}` and `{schema}` in arguments are replaced with the
/// request, response and schema paths, which are also exported as
/// `PAPERLOOP_INPUT`, `PAPERLOOP_OUTPUT` and `PAPERLOOP_SCHEMA`.
#[derive(Debug)]
pub struct CommandCollaborator {
    command: Vec<String>,
    scratch_dir: PathBuf,
    limits: ProcessLimits,
    cancel: CancelToken,
    calls: Cell<u32>,
}

impl CommandCollaborator {
    pub fn new(
        command: Vec<String>,
        scratch_dir: PathBuf,
        limits: ProcessLimits,
        cancel: CancelToken,
    ) -> Self {
        Self {
            command,
            scratch_dir,
            limits,
            cancel,
            calls: Cell::new(0),
        }
    }

    /// Run the command once and return the schema-checked JSON response.
    #[instrument(skip_all, fields(label = label, call = tracing::field::Empty))]
    fn invoke(
        &self,
        label: &str,
        request: &impl Serialize,
        brief: &str,
        schema: &str,
    ) -> Result<Value, CollaboratorError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(CollaboratorError::Failed(format!(
                "no {label} command configured"
            )));
        };
        let call = self.calls.get();
        self.calls.set(call + 1);
        tracing::Span::current().record("call", call);

        let dir = self.scratch_dir.join(format!("{call:03}-{label}"));
        let paths = CallPaths::new(&dir);
        paths
            .prepare(request, brief, schema)
            .map_err(|e| CollaboratorError::Failed(format!("{e:#}")))?;

        let mut cmd = Command::new(program);
        for arg in args {
            cmd.arg(paths.substitute(arg));
        }
        cmd.env("PAPERLOOP_INPUT", &paths.input)
            .env("PAPERLOOP_OUTPUT", &paths.output)
            .env("PAPERLOOP_SCHEMA", &paths.schema);

        info!(program = %program, dir = %dir.display(), "invoking collaborator");
        let output =
            run_command_with_timeout(cmd, Some(brief.as_bytes()), &self.limits, Some(&self.cancel))
                .map_err(|e| CollaboratorError::Failed(format!("{e:#}")))?;
        if let Err(e) = write_log(&paths.log, &output) {
            warn!(err = %format!("{e:#}"), "failed to write collaborator log");
        }

        if output.timed_out {
            warn!(timeout_secs = self.limits.timeout.as_secs(), "collaborator timed out");
            return Err(CollaboratorError::Timeout(self.limits.timeout));
        }
        if output.cancelled {
            return Err(CollaboratorError::Failed("cancelled".to_string()));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let last = stderr.lines().rev().find(|l| !l.trim().is_empty());
            warn!(exit_code = ?output.exit_code(), "collaborator failed");
            let code = output
                .exit_code()
                .map_or_else(|| "unknown".to_string(), |c| c.to_string());
            return Err(CollaboratorError::Failed(format!(
                "exit code {code}{}",
                last.map(|l| format!(": {}", l.trim())).unwrap_or_default()
            )));
        }

        let value = read_response(&paths.output)?;
        let violations = schema_violations(schema, &value)
            .map_err(|e| CollaboratorError::Failed(format!("{e:#}")))?;
        if !violations.is_empty() {
            return Err(CollaboratorError::InvalidResponse(violations.join("; ")));
        }
        debug!("collaborator response accepted");
        Ok(value)
    }
}

impl CodeGenerator for CommandCollaborator {
    fn generate(&self, spec: &AlgorithmSpec) -> Result<CodeProject, CollaboratorError> {
        let brief = generate_brief(spec).map_err(|e| CollaboratorError::Failed(format!("{e:#}")))?;
        let value = self.invoke("generate", spec, &brief, GENERATED_PROJECT_SCHEMA)?;
        let generated: GeneratedProject = from_value(value)?;
        Ok(generated.into_project())
    }
}

/// Parse a hand-supplied project in the generation response format.
pub fn parse_generated_project(value: Value) -> Result<CodeProject, CollaboratorError> {
    let violations = schema_violations(GENERATED_PROJECT_SCHEMA, &value)
        .map_err(|e| CollaboratorError::Failed(format!("{e:#}")))?;
    if !violations.is_empty() {
        return Err(CollaboratorError::InvalidResponse(violations.join("; ")));
    }
    let generated: GeneratedProject = from_value(value)?;
    Ok(generated.into_project())
}

impl Repairer for CommandCollaborator {
    fn repair(&self, request: &RepairRequest<'_>) -> Result<RepairPatch, CollaboratorError> {
        let brief = repair_brief(request).map_err(|e| CollaboratorError::Failed(format!("{e:#}")))?;
        let value = self.invoke("repair", request, &brief, REPAIR_PATCH_SCHEMA)?;
        from_value(value)
    }
}

/// Files exchanged with one collaborator call.
struct CallPaths {
    input: PathBuf,
    brief: PathBuf,
    output: PathBuf,
    schema: PathBuf,
    log: PathBuf,
}

impl CallPaths {
    fn new(dir: &Path) -> Self {
        Self {
            input: dir.join("request.json"),
            brief: dir.join("brief.md"),
            output: dir.join("response.json"),
            schema: dir.join("response.schema.json"),
            log: dir.join("collaborator.log"),
        }
    }

    fn prepare(&self, request: &impl Serialize, brief: &str, schema: &str) -> anyhow::Result<()> {
        if let Some(dir) = self.input.parent() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let mut buf = serde_json::to_string_pretty(request).context("serialize request")?;
        buf.push('\n');
        fs::write(&self.input, buf).with_context(|| format!("write {}", self.input.display()))?;
        fs::write(&self.brief, brief).with_context(|| format!("write {}", self.brief.display()))?;
        fs::write(&self.schema, schema)
            .with_context(|| format!("write {}", self.schema.display()))?;
        if self.output.exists() {
            fs::remove_file(&self.output)
                .with_context(|| format!("remove stale {}", self.output.display()))?;
        }
        Ok(())
    }

    fn substitute(&self, arg: &str) -> String {
        arg.replace("{input}", &self.input.to_string_lossy())
            .replace("{output}", &self.output.to_string_lossy())
            .replace("{schema}", &self.schema.to_string_lossy())
    }
}

fn read_response(path: &Path) -> Result<Value, CollaboratorError> {
    if !path.exists() {
        return Err(CollaboratorError::InvalidResponse(format!(
            "missing response {}",
            path.display()
        )));
    }
    let contents = fs::read_to_string(path).map_err(|e| {
        CollaboratorError::InvalidResponse(format!("read {}: {e}", path.display()))
    })?;
    serde_json::from_str(&contents).map_err(|e| {
        CollaboratorError::InvalidResponse(format!("parse {}: {e}", path.display()))
    })
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T, CollaboratorError> {
    serde_json::from_value(value).map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))
}

fn write_log(path: &Path, output: &CommandOutput) -> anyhow::Result<()> {
    let mut buf = String::new();
    buf.push_str("=== stdout ===\n");
    buf.push_str(&output.stdout_text("collaborator"));
    buf.push_str("\n=== stderr ===\n");
    buf.push_str(&output.stderr_text("collaborator"));
    if output.timed_out {
        buf.push_str("\n[collaborator timed out]\n");
    }
    fs::write(path, buf).with_context(|| format!("write collaborator log {}", path.display()))
}
