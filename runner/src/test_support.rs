//! Test-only builders and scripted stand-ins for the sandbox and collaborators.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::Duration;

use crate::core::classifier::classify;
use crate::core::types::{
    AlgorithmSpec, AttemptRecord, CodeProject, ExecutionResult, ExitStatus, FileChange,
    Hyperparameter, RepairPatch, ResourceLimits,
};
use crate::io::collaborator::{CodeGenerator, CollaboratorError, RepairRequest, Repairer};
use crate::io::sandbox::Sandbox;

/// Project named `demo` whose entrypoint is the first listed file.
pub fn project(revision: u32, files: &[(&str, &str)]) -> CodeProject {
    CodeProject {
        revision,
        name: "demo".to_string(),
        description: String::new(),
        files: files
            .iter()
            .map(|(path, content)| (path.to_string(), content.to_string()))
            .collect::<BTreeMap<_, _>>(),
        requirements: BTreeSet::new(),
        entrypoint: files
            .first()
            .map(|(path, _)| path.to_string())
            .unwrap_or_default(),
        usage: String::new(),
        notes: String::new(),
    }
}

pub fn patch(revision: u32, changes: Vec<FileChange>) -> RepairPatch {
    RepairPatch {
        revision,
        changes,
        added_requirements: BTreeSet::new(),
        confidence: 0.5,
        rationale: "scripted".to_string(),
    }
}

pub fn attempt(index: u32, result: ExecutionResult) -> AttemptRecord {
    AttemptRecord {
        index,
        revision: result.revision,
        result,
        infra_failures: Vec::new(),
        repair_requests: 0,
        repair_failures: Vec::new(),
        patch: None,
        terminal: false,
        warnings: Vec::new(),
    }
}

/// Non-zero exit with a classified Python traceback.
pub fn failed_result(revision: u32, code: i32) -> ExecutionResult {
    let status = ExitStatus::NonZeroExit { code: Some(code) };
    let stderr = "Traceback (most recent call last):\n  File \"main.py\", line 3, in <module>\nRuntimeError: boom\n".to_string();
    let classification = classify(&status, &stderr);
    ExecutionResult {
        revision,
        status,
        stdout: String::new(),
        stderr,
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration_ms: 10,
        classification,
    }
}

pub fn success_result(revision: u32) -> ExecutionResult {
    ExecutionResult {
        revision,
        status: ExitStatus::Success,
        stdout: "ok\n".to_string(),
        stderr: String::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration_ms: 10,
        classification: None,
    }
}

pub fn infra_result(revision: u32) -> ExecutionResult {
    ExecutionResult::infrastructure_failure(revision, "container runtime unavailable")
}

/// Execution interrupted by cancellation, with the output captured so far.
pub fn cancelled_result(revision: u32) -> ExecutionResult {
    ExecutionResult {
        revision,
        status: ExitStatus::Cancelled,
        stdout: "epoch 1\n".to_string(),
        stderr: String::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        duration_ms: 10,
        classification: None,
    }
}

pub fn sample_spec() -> AlgorithmSpec {
    AlgorithmSpec {
        name: "gradient-descent".to_string(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        steps: vec![
            "initialise weights".to_string(),
            "update weights along the negative gradient".to_string(),
        ],
        libraries: BTreeSet::from(["numpy".to_string()]),
        hyperparameters: BTreeMap::from([(
            "learning_rate".to_string(),
            Hyperparameter {
                ty: "float".to_string(),
                default: serde_json::json!(0.01),
                description: String::new(),
            },
        )]),
        equations: Vec::new(),
        complexity: None,
    }
}

/// Sandbox that replays queued results, stamped with the executed revision.
/// Setting `unavailable` makes its preflight fail with that reason.
#[derive(Debug, Default)]
pub struct ScriptedSandbox {
    results: RefCell<VecDeque<ExecutionResult>>,
    executed: RefCell<Vec<u32>>,
    pub unavailable: Option<String>,
}

impl ScriptedSandbox {
    pub fn new(results: Vec<ExecutionResult>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            executed: RefCell::new(Vec::new()),
            unavailable: None,
        }
    }

    /// Revisions executed so far, in order.
    pub fn executed(&self) -> Vec<u32> {
        self.executed.borrow().clone()
    }
}

impl Sandbox for ScriptedSandbox {
    fn execute(
        &self,
        project: &CodeProject,
        _limits: &ResourceLimits,
        _timeout: Duration,
    ) -> ExecutionResult {
        self.executed.borrow_mut().push(project.revision);
        match self.results.borrow_mut().pop_front() {
            Some(mut result) => {
                result.revision = project.revision;
                result
            }
            None => ExecutionResult::infrastructure_failure(project.revision, "script exhausted"),
        }
    }

    fn preflight(&self) -> Result<(), String> {
        match &self.unavailable {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }
}

/// Generator returning a fixed outcome.
#[derive(Debug)]
pub struct ScriptedGenerator {
    outcome: Result<CodeProject, CollaboratorError>,
}

impl ScriptedGenerator {
    pub fn new(outcome: Result<CodeProject, CollaboratorError>) -> Self {
        Self { outcome }
    }
}

impl CodeGenerator for ScriptedGenerator {
    fn generate(&self, _spec: &AlgorithmSpec) -> Result<CodeProject, CollaboratorError> {
        self.outcome.clone()
    }
}

/// One observed repair request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenRequest {
    pub attempt: u32,
    pub revision: u32,
    pub feedback: Option<String>,
}

/// Repairer that replays queued outcomes. Patches are retargeted at the
/// requested revision unless `keep_revision` is set.
#[derive(Debug, Default)]
pub struct ScriptedRepairer {
    outcomes: RefCell<VecDeque<Result<RepairPatch, CollaboratorError>>>,
    seen: RefCell<Vec<SeenRequest>>,
    pub keep_revision: bool,
}

impl ScriptedRepairer {
    pub fn new(outcomes: Vec<Result<RepairPatch, CollaboratorError>>) -> Self {
        Self {
            outcomes: RefCell::new(outcomes.into()),
            seen: RefCell::new(Vec::new()),
            keep_revision: false,
        }
    }

    pub fn seen(&self) -> Vec<SeenRequest> {
        self.seen.borrow().clone()
    }
}

impl Repairer for ScriptedRepairer {
    fn repair(&self, request: &RepairRequest<'_>) -> Result<RepairPatch, CollaboratorError> {
        self.seen.borrow_mut().push(SeenRequest {
            attempt: request.attempt,
            revision: request.project.revision,
            feedback: request.feedback.map(str::to_string),
        });
        let outcome = self
            .outcomes
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| Err(CollaboratorError::Failed("script exhausted".to_string())));
        outcome.map(|mut patch| {
            if !self.keep_revision {
                patch.revision = request.project.revision;
            }
            patch
        })
    }
}
