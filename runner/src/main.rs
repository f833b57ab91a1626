//! `paperloop` command-line entry point.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::Value;

use paperloop::cancel::CancelToken;
use paperloop::core::types::{AlgorithmSpec, CodeProject};
use paperloop::exit_codes;
use paperloop::io::collaborator::{CommandCollaborator, parse_generated_project};
use paperloop::io::config::{IsolationMode, RunnerConfig, load_config, write_config};
use paperloop::io::process::ProcessLimits;
use paperloop::io::sandbox::{ProcessSandbox, SandboxConfig};
use paperloop::io::schema::{ALGORITHM_SPEC_SCHEMA, schema_violations};
use paperloop::io::store::{ArtifactStore, generate_run_id, load_manifest};
use paperloop::io::workdir::sweep_stale;
use paperloop::logging;
use paperloop::pipeline::{PipelineContext, run_pipeline};

const DEFAULT_OUTPUT: &str = "paperloop-out";

#[derive(Parser)]
#[command(
    name = "paperloop",
    version,
    about = "Generate, execute and repair research code"
)]
struct Cli {
    /// Raise log verbosity (`-v` info, `-vv` debug). `RUST_LOG` overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the generate-execute-repair loop for an algorithm description.
    Run {
        /// Algorithm description (JSON).
        #[arg(long)]
        spec: PathBuf,
        /// Start from this project (generation response format) instead of generating one.
        #[arg(long)]
        project: Option<PathBuf>,
        /// Output root holding `runs/` and `work/`.
        #[arg(long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,
        /// Configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        max_attempts: Option<u32>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Execute as a plain subprocess instead of inside a container.
        #[arg(long)]
        no_isolation: bool,
    },
    /// Print the summary of a recorded run.
    Show {
        run_dir: PathBuf,
        /// Print the raw manifest.
        #[arg(long)]
        json: bool,
    },
    /// Remove working directories left behind by interrupted runs. Runs that
    /// still hold their writer lock are skipped.
    Sweep {
        #[arg(long, default_value = DEFAULT_OUTPUT)]
        output: PathBuf,
    },
    /// Write a configuration file with default values.
    InitConfig {
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run {
            spec,
            project,
            output,
            config,
            max_attempts,
            timeout_secs,
            no_isolation,
        } => {
            let mut cfg = match config {
                Some(path) => load_config(&path)?,
                None => RunnerConfig::default(),
            };
            if let Some(n) = max_attempts {
                cfg.max_attempts = n;
            }
            if let Some(secs) = timeout_secs {
                cfg.timeout_secs = secs;
            }
            if no_isolation {
                cfg.isolation = IsolationMode::Subprocess;
            }
            cfg.validate()?;
            cmd_run(&cfg, &spec, project.as_deref(), &output)
        }
        Command::Show { run_dir, json } => cmd_show(&run_dir, json),
        Command::Sweep { output } => cmd_sweep(&output),
        Command::InitConfig { path, force } => {
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            write_config(&path, &RunnerConfig::default())?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(
    cfg: &RunnerConfig,
    spec_path: &Path,
    project_path: Option<&Path>,
    output: &Path,
) -> Result<i32> {
    let spec = load_spec(spec_path)?;
    let initial = project_path.map(load_project).transpose()?;

    let store = ArtifactStore::new(output);
    let run_id = generate_run_id();
    let cancel = CancelToken::new();
    let sandbox = ProcessSandbox::new(
        SandboxConfig::from_runner_config(cfg, store.work_root(), &run_id),
        cancel.clone(),
    );
    let scratch = store.run_dir(&run_id).join("collaborator");
    let limits = ProcessLimits {
        timeout: cfg.collaborator_timeout(),
        kill_grace: cfg.kill_grace(),
        output_limit_bytes: cfg.output_limit_bytes,
    };
    let generator = CommandCollaborator::new(
        cfg.generator.command.clone(),
        scratch.clone(),
        limits,
        cancel.clone(),
    );
    let repairer =
        CommandCollaborator::new(cfg.repairer.command.clone(), scratch, limits, cancel.clone());

    let ctx = PipelineContext {
        config: cfg,
        store: &store,
        sandbox: &sandbox,
        generator: &generator,
        repairer: &repairer,
        cancel: &cancel,
    };
    let outcome = run_pipeline(&ctx, &run_id, &spec, initial)?;

    let manifest = load_manifest(&outcome.run_dir)?;
    print!("{}", manifest.summary());
    println!("run dir:   {}", outcome.run_dir.display());
    if let Some(dir) = &outcome.project_dir {
        println!("project:   {}", dir.display());
    }
    Ok(exit_codes::for_status(&outcome.status))
}

fn cmd_show(run_dir: &Path, json: bool) -> Result<i32> {
    let manifest = load_manifest(run_dir)?;
    if json {
        let payload = serde_json::to_string_pretty(&manifest).context("serialize manifest")?;
        println!("{payload}");
    } else {
        print!("{}", manifest.summary());
    }
    Ok(exit_codes::OK)
}

fn cmd_sweep(output: &Path) -> Result<i32> {
    let store = ArtifactStore::new(output);
    let removed = sweep_stale(&store.work_root(), |run_id| !store.is_locked(run_id))?;
    for path in &removed {
        println!("removed {}", path.display());
    }
    Ok(exit_codes::OK)
}

/// Read an algorithm description and check it against its schema.
fn load_spec(path: &Path) -> Result<AlgorithmSpec> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    let violations = schema_violations(ALGORITHM_SPEC_SCHEMA, &value)?;
    if !violations.is_empty() {
        bail!(
            "invalid algorithm description {}:\n- {}",
            path.display(),
            violations.join("\n- ")
        );
    }
    serde_json::from_value(value).with_context(|| format!("decode {}", path.display()))
}

fn load_project(path: &Path) -> Result<CodeProject> {
    let raw = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let value: Value =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    parse_generated_project(value).with_context(|| format!("load project {}", path.display()))
}
