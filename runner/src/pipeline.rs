//! Pipeline orchestrator: drives the run state machine against the sandbox,
//! the collaborators and the artifact store.
//!
//! The driver applies one event at a time and performs the resulting effects
//! in order. The sandbox backend is checked once before generation.
//! Cancellation is checked before every execution and repair request;
//! persisted artifacts are always written before the next transition.

use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::machine::{Checkpoint, Effect, Event, Machine};
use crate::core::project::risky_patterns;
use crate::core::types::{AlgorithmSpec, CodeProject, RunStatus};
use crate::io::collaborator::{CodeGenerator, RepairRequest, Repairer};
use crate::io::config::RunnerConfig;
use crate::io::sandbox::Sandbox;
use crate::io::store::{ArtifactStore, Manifest, ManifestAttempt, ManifestConfig, RunStore};

/// Collaborators and backends a run is driven against.
pub struct PipelineContext<'a> {
    pub config: &'a RunnerConfig,
    pub store: &'a ArtifactStore,
    pub sandbox: &'a dyn Sandbox,
    pub generator: &'a dyn CodeGenerator,
    pub repairer: &'a dyn Repairer,
    pub cancel: &'a CancelToken,
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub attempts: u32,
    pub repair_requests: u32,
    pub final_revision: Option<u32>,
    pub run_dir: PathBuf,
    /// Exported final project, when any revision exists.
    pub project_dir: Option<PathBuf>,
}

/// Run the generate-execute-repair loop for `spec` under `run_id`.
///
/// When `initial` is given, generation is skipped and that project becomes
/// revision 0. Program failures never surface as `Err`; they end the run as
/// `Exhausted` or `Fatal`. `Err` means the run could not be recorded.
#[instrument(skip_all, fields(run_id = %run_id, spec = %spec.name))]
pub fn run_pipeline(
    ctx: &PipelineContext<'_>,
    run_id: &str,
    spec: &AlgorithmSpec,
    initial: Option<CodeProject>,
) -> Result<RunOutcome> {
    let run = ctx.store.create_run(run_id)?;
    run.write_spec(spec)?;
    let mut driver = Driver {
        ctx,
        spec,
        run: &run,
        machine: Machine::new(ctx.config.retry_policy()),
        manifest: Manifest::new(run_id, &spec.name, manifest_config(ctx.config)),
    };
    run.write_manifest(&driver.manifest)?;

    let first = driver.initial_event(initial);
    driver.drive(first)
}

fn manifest_config(cfg: &RunnerConfig) -> ManifestConfig {
    ManifestConfig {
        max_attempts: cfg.max_attempts,
        timeout_secs: cfg.timeout_secs,
        isolation: cfg.isolation.as_str().to_string(),
        repair_budget: cfg.repair_budget,
        infra_retry_limit: cfg.infra_retry_limit,
    }
}

struct Driver<'a, 'c> {
    ctx: &'a PipelineContext<'c>,
    spec: &'a AlgorithmSpec,
    run: &'a RunStore,
    machine: Machine,
    manifest: Manifest,
}

impl Driver<'_, '_> {
    fn initial_event(&self, initial: Option<CodeProject>) -> Event {
        if self.ctx.cancel.is_cancelled() {
            return Event::Cancelled("cancelled before generation".to_string());
        }
        if let Err(reason) = self.ctx.sandbox.preflight() {
            warn!(reason = %reason, "sandbox unavailable");
            return Event::SandboxUnavailable(reason);
        }
        match initial {
            Some(project) => {
                info!(files = project.files.len(), "using provided project");
                Event::Start(project)
            }
            None => {
                info!("requesting code generation");
                match self.ctx.generator.generate(self.spec) {
                    Ok(project) => Event::Start(project),
                    Err(e) => {
                        warn!(err = %e, "code generation failed");
                        Event::GenerationFailed(e.to_string())
                    }
                }
            }
        }
    }

    fn apply(&mut self, event: Event) -> Result<Vec<Effect>> {
        let name = event.name();
        let from = self.machine.state().name();
        let effects = self
            .machine
            .apply(event)
            .map_err(|e| anyhow!("state machine rejected {name}: {e}"))?;
        debug!(event = name, from, to = self.machine.state().name(), "transition");
        Ok(effects)
    }

    fn drive(&mut self, first: Event) -> Result<RunOutcome> {
        let mut pending: VecDeque<Effect> = self.apply(first)?.into();
        while let Some(effect) = pending.pop_front() {
            match effect {
                Effect::Persist(checkpoint) => self.persist(checkpoint)?,
                Effect::Execute { attempt, revision } => {
                    let event = self.execute(attempt, revision)?;
                    pending.extend(self.apply(event)?);
                }
                Effect::RequestRepair {
                    attempt,
                    revision,
                    feedback,
                } => {
                    if self.ctx.cancel.is_cancelled() {
                        let event = Event::Cancelled("cancelled before repair".to_string());
                        pending.extend(self.apply(event)?);
                        continue;
                    }
                    for effect in self.apply(Event::RepairDispatched)? {
                        match effect {
                            Effect::Persist(checkpoint) => self.persist(checkpoint)?,
                            other => pending.push_back(other),
                        }
                    }
                    let event = self.request_repair(attempt, revision, feedback.as_deref())?;
                    pending.extend(self.apply(event)?);
                }
                Effect::Finish(status) => return self.finish(status),
            }
        }
        bail!("run ended without a terminal status")
    }

    fn persist(&mut self, checkpoint: Checkpoint) -> Result<()> {
        match checkpoint {
            Checkpoint::Revision(revision) => {
                let project = self
                    .machine
                    .revision(revision)
                    .with_context(|| format!("revision {revision} missing"))?;
                self.run.write_revision(project)
            }
            Checkpoint::Attempt(index) => {
                let record = self
                    .machine
                    .attempt(index)
                    .with_context(|| format!("attempt {index} missing"))?;
                let project = self
                    .machine
                    .revision(record.revision)
                    .with_context(|| format!("revision {} missing", record.revision))?;
                self.run.write_attempt(record)?;

                let summary = ManifestAttempt::from_record(record, project);
                match self.manifest.attempts.get_mut(index as usize) {
                    Some(slot) => *slot = summary,
                    None => self.manifest.attempts.push(summary),
                }
                self.manifest.repair_requests = self.machine.repair_requests();
                self.run.write_manifest(&self.manifest)
            }
        }
    }

    #[instrument(skip(self))]
    fn execute(&self, attempt: u32, revision: u32) -> Result<Event> {
        if self.ctx.cancel.is_cancelled() {
            return Ok(Event::Cancelled("cancelled before execution".to_string()));
        }
        let project = self
            .machine
            .revision(revision)
            .with_context(|| format!("revision {revision} missing"))?;
        for warning in risky_patterns(project) {
            warn!(warning = %warning, "risky construct in project");
        }
        let result = self.ctx.sandbox.execute(
            project,
            &self.ctx.config.resource_limits(),
            self.ctx.config.timeout(),
        );
        info!(
            status = result.status.as_str(),
            duration_ms = result.duration_ms,
            "attempt executed"
        );
        Ok(Event::Executed(result))
    }

    #[instrument(skip(self, feedback))]
    fn request_repair(
        &self,
        attempt: u32,
        revision: u32,
        feedback: Option<&str>,
    ) -> Result<Event> {
        let record = self
            .machine
            .attempt(attempt)
            .with_context(|| format!("attempt {attempt} missing"))?;
        let project = self
            .machine
            .revision(revision)
            .with_context(|| format!("revision {revision} missing"))?;
        let request = RepairRequest {
            attempt,
            spec: self.spec,
            project,
            result: &record.result,
            feedback,
        };

        match self.ctx.repairer.repair(&request) {
            Ok(patch) => {
                info!(
                    changes = patch.changes.len(),
                    confidence = patch.confidence,
                    "repair received"
                );
                self.run.write_repair(attempt, record.repair_requests, &patch)?;
                Ok(Event::RepairReceived(patch))
            }
            Err(e) => {
                warn!(err = %e, "repair request failed");
                Ok(Event::RepairFailed(e.to_repair_failure()))
            }
        }
    }

    fn finish(&mut self, status: RunStatus) -> Result<RunOutcome> {
        let latest = self.machine.latest_revision();
        let project_dir = match latest {
            Some(project) => Some(self.run.export_project(project)?),
            None => None,
        };
        self.manifest.finish(&status);
        self.manifest.final_revision = latest.map(|p| p.revision);
        self.manifest.repair_requests = self.machine.repair_requests();
        self.run.write_manifest(&self.manifest)?;

        info!(
            status = status.as_str(),
            attempts = self.machine.attempts().len(),
            repair_requests = self.machine.repair_requests(),
            "run finished"
        );
        Ok(RunOutcome {
            run_id: self.run.run_id().to_string(),
            status,
            attempts: self.machine.attempts().len() as u32,
            repair_requests: self.machine.repair_requests(),
            final_revision: self.manifest.final_revision,
            run_dir: self.run.dir().to_path_buf(),
            project_dir,
        })
    }
}
