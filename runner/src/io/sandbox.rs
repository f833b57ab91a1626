//! Sandbox executor: run one project revision inside an isolation boundary.
//!
//! The [`Sandbox`] trait decouples the pipeline from the isolation backend.
//! [`ProcessSandbox`] runs the entrypoint either inside a container (no
//! network, read-only root filesystem, CPU/memory/pid limits, only the working
//! directory mounted writable) or as a plain subprocess bounded by `ulimit`.
//! Tests use scripted sandboxes that return predetermined results.
//!
//! Failures of the backend itself (missing runtime, daemon errors, workdir
//! I/O) become [`ExitStatus::InfrastructureFailure`] so the retry policy can
//! budget them separately from program failures. [`Sandbox::preflight`] lets a
//! run fail fast when the backend is missing altogether.
//!
//! The working directory lives only for the duration of
//! [`Sandbox::execute`]. Everything the store persists for an attempt comes
//! from the returned [`ExecutionResult`], so the directory is already gone when
//! the attempt is written and nothing persisted refers to it.

use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use crate::cancel::CancelToken;
use crate::core::classifier::classify;
use crate::core::types::{CodeProject, ExecutionResult, ExitStatus, ResourceLimits};
use crate::io::config::{IsolationMode, RunnerConfig};
use crate::io::process::{CommandOutput, ProcessLimits, run_command_with_timeout};
use crate::io::store::short_id;
use crate::io::workdir::Workdir;

/// Exit code the docker CLI reserves for daemon/runtime errors.
const CONTAINER_RUNTIME_ERROR: i32 = 125;
/// Mount point of the working directory inside the container.
const CONTAINER_WORKDIR: &str = "/app";
/// Label used in truncation markers.
const OUTPUT_LABEL: &str = "program";
/// Ceiling for the runtime availability check.
const PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

/// Abstraction over isolation backends.
pub trait Sandbox {
    /// Run `project.entrypoint` and report how it ended. Never fails: backend
    /// problems are reported as an infrastructure failure result.
    fn execute(
        &self,
        project: &CodeProject,
        limits: &ResourceLimits,
        timeout: Duration,
    ) -> ExecutionResult;

    /// Check once, before the run starts, that the backend can execute
    /// programs at all. `Err` carries a reason for the operator.
    fn preflight(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Settings for [`ProcessSandbox`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub isolation: IsolationMode,
    /// Parent directory for per-attempt working directories.
    pub work_root: PathBuf,
    /// Run identifier, used to name working directories.
    pub run_id: String,
    pub interpreter: Vec<String>,
    pub runtime: String,
    pub image: String,
    pub kill_grace: Duration,
    pub output_limit_bytes: usize,
}

impl SandboxConfig {
    pub fn from_runner_config(cfg: &RunnerConfig, work_root: PathBuf, run_id: &str) -> Self {
        Self {
            isolation: cfg.isolation,
            work_root,
            run_id: run_id.to_string(),
            interpreter: cfg.interpreter.clone(),
            runtime: cfg.container.runtime.clone(),
            image: cfg.container.image.clone(),
            kill_grace: cfg.kill_grace(),
            output_limit_bytes: cfg.output_limit_bytes,
        }
    }
}

/// Sandbox backed by a container runtime or a bounded subprocess.
#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    config: SandboxConfig,
    cancel: CancelToken,
}

impl ProcessSandbox {
    pub fn new(config: SandboxConfig, cancel: CancelToken) -> Self {
        Self { config, cancel }
    }

    fn build_command(
        &self,
        project: &CodeProject,
        limits: &ResourceLimits,
        workdir: &Workdir,
        container_name: &str,
    ) -> Command {
        match self.config.isolation {
            IsolationMode::Container => {
                let mut cmd = Command::new(&self.config.runtime);
                cmd.arg("run")
                    .arg("--rm")
                    .arg("--name")
                    .arg(container_name)
                    .arg("--network")
                    .arg("none")
                    .arg("--read-only")
                    .arg("--tmpfs")
                    .arg("/tmp")
                    .arg("--memory")
                    .arg(format!("{}m", limits.memory_mb))
                    .arg("--memory-swap")
                    .arg(format!("{}m", limits.memory_mb))
                    .arg("--cpus")
                    .arg(format!("{}", limits.cpus))
                    .arg("--pids-limit")
                    .arg(limits.pids.to_string())
                    .arg("--ulimit")
                    .arg(format!("cpu={}", limits.cpu_secs))
                    .arg("--env")
                    .arg("PYTHONDONTWRITEBYTECODE=1")
                    .arg("--env")
                    .arg(format!("HOME={CONTAINER_WORKDIR}"))
                    .arg("--volume")
                    .arg(format!("{}:{CONTAINER_WORKDIR}", workdir.path().display()))
                    .arg("--workdir")
                    .arg(CONTAINER_WORKDIR)
                    .arg(&self.config.image)
                    .args(&self.config.interpreter)
                    .arg(&project.entrypoint);
                cmd
            }
            IsolationMode::Subprocess => {
                // Limits apply to the shell, then carry over to the exec'd program.
                let script = format!(
                    "ulimit -t {} 2>/dev/null; ulimit -v {} 2>/dev/null; exec \"$@\"",
                    limits.cpu_secs,
                    limits.memory_mb.saturating_mul(1024)
                );
                let mut cmd = Command::new("sh");
                cmd.arg("-c")
                    .arg(script)
                    .arg("sh")
                    .args(&self.config.interpreter)
                    .arg(&project.entrypoint)
                    .current_dir(workdir.path())
                    .env_clear()
                    .env("PATH", std::env::var_os("PATH").unwrap_or_default())
                    .env("HOME", workdir.path())
                    .env("LANG", "C.UTF-8")
                    .env("PYTHONDONTWRITEBYTECODE", "1");
                cmd
            }
        }
    }

    /// Force-remove the container; a no-op when `--rm` already removed it.
    fn remove_container(&self, name: &str) {
        let result = Command::new(&self.config.runtime)
            .arg("rm")
            .arg("--force")
            .arg(name)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
        if let Err(e) = result {
            warn!(err = %e, container = name, "failed to remove container");
        }
    }

    fn to_result(&self, revision: u32, output: &CommandOutput) -> ExecutionResult {
        let stdout = output.stdout_text(OUTPUT_LABEL);
        let stderr = output.stderr_text(OUTPUT_LABEL);
        // Classified without the truncation marker.
        let captured_stderr = String::from_utf8_lossy(&output.stderr);
        let code = output.exit_code();

        let status = if output.cancelled {
            ExitStatus::Cancelled
        } else if output.timed_out {
            ExitStatus::Timeout
        } else if output.status.success() {
            ExitStatus::Success
        } else if self.config.isolation == IsolationMode::Container
            && code == Some(CONTAINER_RUNTIME_ERROR)
        {
            ExitStatus::InfrastructureFailure {
                reason: format!(
                    "container runtime error: {}",
                    last_line(&captured_stderr).unwrap_or("no diagnostics")
                ),
            }
        } else {
            ExitStatus::NonZeroExit { code }
        };

        let classification = classify(&status, &captured_stderr);
        ExecutionResult {
            revision,
            status,
            stdout,
            stderr,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
            duration_ms: output.duration.as_millis() as u64,
            classification,
        }
    }
}

impl Sandbox for ProcessSandbox {
    /// Container mode asks the runtime for its version, which also reaches the
    /// daemon. Subprocess mode has nothing to check.
    fn preflight(&self) -> Result<(), String> {
        if self.config.isolation == IsolationMode::Subprocess {
            return Ok(());
        }
        let runtime = &self.config.runtime;
        let mut cmd = Command::new(runtime);
        cmd.arg("version");
        let limits = ProcessLimits {
            timeout: PREFLIGHT_TIMEOUT,
            kill_grace: self.config.kill_grace,
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let output = run_command_with_timeout(cmd, None, &limits, Some(&self.cancel))
            .map_err(|e| format!("container runtime {runtime:?} is not available: {e:#}"))?;
        if output.timed_out {
            return Err(format!(
                "container runtime {runtime:?} did not answer within {}s",
                PREFLIGHT_TIMEOUT.as_secs()
            ));
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "container runtime {runtime:?} is not usable: {}",
                last_line(&stderr).unwrap_or("no diagnostics")
            ));
        }
        debug!(runtime = %runtime, "container runtime available");
        Ok(())
    }

    #[instrument(skip_all, fields(revision = project.revision, isolation = self.config.isolation.as_str(), timeout_secs = timeout.as_secs()))]
    fn execute(
        &self,
        project: &CodeProject,
        limits: &ResourceLimits,
        timeout: Duration,
    ) -> ExecutionResult {
        let started = Instant::now();
        let created = Workdir::create(&self.config.work_root, &self.config.run_id, project.revision);
        let workdir = match created {
            Ok(dir) => dir,
            Err(e) => {
                warn!(err = %format!("{e:#}"), "failed to create working directory");
                return ExecutionResult::infrastructure_failure(project.revision, format!("{e:#}"));
            }
        };
        if let Err(e) = workdir.materialize(project) {
            warn!(err = %format!("{e:#}"), "failed to materialize project");
            return ExecutionResult::infrastructure_failure(project.revision, format!("{e:#}"));
        }

        let container_name = format!(
            "paperloop-{}-r{}-{}",
            self.config.run_id,
            project.revision,
            short_id()
        );
        let cmd = self.build_command(project, limits, &workdir, &container_name);
        let process_limits = ProcessLimits {
            timeout,
            kill_grace: self.config.kill_grace,
            output_limit_bytes: self.config.output_limit_bytes,
        };
        info!(entrypoint = %project.entrypoint, "executing project");
        let output = run_command_with_timeout(cmd, None, &process_limits, Some(&self.cancel));

        if self.config.isolation == IsolationMode::Container {
            self.remove_container(&container_name);
        }

        let mut result = match output {
            Ok(output) => self.to_result(project.revision, &output),
            Err(e) => {
                warn!(err = %format!("{e:#}"), "failed to launch program");
                ExecutionResult::infrastructure_failure(project.revision, format!("{e:#}"))
            }
        };
        if result.duration_ms == 0 {
            result.duration_ms = started.elapsed().as_millis() as u64;
        }
        debug!(
            status = result.status.as_str(),
            duration_ms = result.duration_ms,
            "execution finished"
        );
        result
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().rev().map(str::trim).find(|l| !l.is_empty())
}
