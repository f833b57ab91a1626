//! Pipeline configuration stored as TOML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::retry::RetryPolicy;
use crate::core::types::ResourceLimits;

/// Isolation backend for program execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Container runtime with no network, read-only root and resource limits.
    #[default]
    Container,
    /// Plain child process with `ulimit` bounds. For hosts without a runtime.
    Subprocess,
}

impl IsolationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            IsolationMode::Container => "container",
            IsolationMode::Subprocess => "subprocess",
        }
    }
}

/// Pipeline configuration (TOML).
///
/// Missing fields default to the values documented on each field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Execution attempts per run (>= 1).
    pub max_attempts: u32,

    /// Wall-clock budget per execution in seconds.
    pub timeout_secs: u64,

    pub isolation: IsolationMode,

    /// Repair requests allowed per failing attempt before the run is fatal.
    pub repair_budget: u32,

    /// Immediate re-executions after sandbox infrastructure failures.
    pub infra_retry_limit: u32,

    /// Grace between SIGTERM and SIGKILL for the program's process group.
    pub kill_grace_ms: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// Ceiling for a single generation or repair call.
    pub collaborator_timeout_secs: u64,

    /// Program used to launch the entrypoint, e.g. `["python3", "-u"]`.
    pub interpreter: Vec<String>,

    pub limits: LimitsConfig,
    pub container: ContainerConfig,
    pub generator: CollaboratorConfig,
    pub repairer: CollaboratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub cpu_secs: u64,
    pub memory_mb: u64,
    /// Container CPU share; ignored in subprocess mode.
    pub cpus: f64,
    pub pids: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = ResourceLimits::default();
        Self {
            cpu_secs: limits.cpu_secs,
            memory_mb: limits.memory_mb,
            cpus: limits.cpus,
            pids: limits.pids,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Container CLI (`docker`, `podman`).
    pub runtime: String,
    pub image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "python:3.11-slim".to_string(),
        }
    }
}

/// External command implementing a collaborator.
///
/// `{input}`, `{output}` and `{schema}` in arguments are replaced with the
/// request, response and response-schema paths; the same paths are exported
/// as `PAPERLOOP_INPUT`, `PAPERLOOP_OUTPUT` and `PAPERLOOP_SCHEMA`. The
/// rendered brief is written to stdin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct CollaboratorConfig {
    pub command: Vec<String>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout_secs: 120,
            isolation: IsolationMode::default(),
            repair_budget: 2,
            infra_retry_limit: 2,
            kill_grace_ms: 2_000,
            output_limit_bytes: 64 * 1024,
            collaborator_timeout_secs: 10 * 60,
            interpreter: vec!["python3".to_string()],
            limits: LimitsConfig::default(),
            container: ContainerConfig::default(),
            generator: CollaboratorConfig::default(),
            repairer: CollaboratorConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(anyhow!("max_attempts must be >= 1"));
        }
        if self.timeout_secs == 0 {
            return Err(anyhow!("timeout_secs must be > 0"));
        }
        if self.repair_budget == 0 {
            return Err(anyhow!("repair_budget must be >= 1"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.collaborator_timeout_secs == 0 {
            return Err(anyhow!("collaborator_timeout_secs must be > 0"));
        }
        if self.interpreter.is_empty() || self.interpreter[0].trim().is_empty() {
            return Err(anyhow!("interpreter must be a non-empty array"));
        }
        if self.limits.cpu_secs == 0 || self.limits.memory_mb == 0 || self.limits.pids == 0 {
            return Err(anyhow!("limits.cpu_secs, limits.memory_mb and limits.pids must be > 0"));
        }
        if self.limits.cpus.is_nan() || self.limits.cpus <= 0.0 {
            return Err(anyhow!("limits.cpus must be > 0"));
        }
        if self.isolation == IsolationMode::Container
            && (self.container.runtime.trim().is_empty() || self.container.image.trim().is_empty())
        {
            return Err(anyhow!("container.runtime and container.image must be set"));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_secs(self.collaborator_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            repair_budget: self.repair_budget,
            infra_retry_limit: self.infra_retry_limit,
        }
    }

    pub fn resource_limits(&self) -> ResourceLimits {
        ResourceLimits {
            cpu_secs: self.limits.cpu_secs,
            memory_mb: self.limits.memory_mb,
            cpus: self.limits.cpus,
            pids: self.limits.pids,
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `RunnerConfig::default()`.
pub fn load_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let cfg = RunnerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RunnerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
