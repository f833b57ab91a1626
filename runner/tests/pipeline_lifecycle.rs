//! Loop-level tests for full pipeline lifecycle scenarios.
//!
//! These tests drive `run_pipeline` with scripted sandbox and collaborator
//! stand-ins and verify the terminal status, the attempt history and the
//! artifacts left in the run directory.

use std::fs;
use std::time::Duration;

use paperloop::cancel::CancelToken;
use paperloop::core::types::{
    CodeProject, ExecutionResult, FileChange, RepairFailureKind, RepairPatch, ResourceLimits,
    RunStatus,
};
use paperloop::io::collaborator::CollaboratorError;
use paperloop::io::config::RunnerConfig;
use paperloop::io::sandbox::Sandbox;
use paperloop::io::store::{ArtifactStore, load_attempts, load_manifest};
use paperloop::pipeline::{PipelineContext, RunOutcome, run_pipeline};
use paperloop::test_support::{
    ScriptedGenerator, ScriptedRepairer, ScriptedSandbox, cancelled_result, failed_result,
    infra_result, patch, project, sample_spec, success_result,
};
use tempfile::TempDir;

fn config(max_attempts: u32) -> RunnerConfig {
    RunnerConfig {
        max_attempts,
        ..RunnerConfig::default()
    }
}

fn initial() -> CodeProject {
    project(0, &[("main.py", "print(undefined)"), ("util.py", "X = 1")])
}

fn fix(content: &str) -> Result<RepairPatch, CollaboratorError> {
    Ok(patch(0, vec![FileChange {
        path: "main.py".to_string(),
        content: content.to_string(),
        new_file: false,
    }]))
}

fn run(
    cfg: &RunnerConfig,
    sandbox: &dyn Sandbox,
    repairer: &ScriptedRepairer,
    cancel: &CancelToken,
) -> (TempDir, RunOutcome) {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(temp.path());
    let generator = ScriptedGenerator::new(Ok(initial()));
    let ctx = PipelineContext {
        config: cfg,
        store: &store,
        sandbox,
        generator: &generator,
        repairer,
        cancel,
    };
    let outcome = run_pipeline(&ctx, "run-1", &sample_spec(), None).expect("run");
    (temp, outcome)
}

/// Two failures repaired in turn, then success on the third attempt.
///
/// Execution sequence:
/// 1. Attempt 0 runs revision 0 → fails, repair produces revision 1
/// 2. Attempt 1 runs revision 1 → fails, repair produces revision 2
/// 3. Attempt 2 runs revision 2 → succeeds
#[test]
fn fail_fail_succeed_repairs_twice() {
    let cfg = config(3);
    let sandbox = ScriptedSandbox::new(vec![
        failed_result(0, 1),
        failed_result(0, 1),
        success_result(0),
    ]);
    let repairer = ScriptedRepairer::new(vec![fix("print(1)"), fix("print(2)")]);
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(sandbox.executed(), vec![0, 1, 2]);
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.repair_requests, 2);
    assert_eq!(outcome.final_revision, Some(2));

    let seen = repairer.seen();
    assert_eq!(
        seen.iter().map(|s| (s.attempt, s.revision)).collect::<Vec<_>>(),
        vec![(0, 0), (1, 1)]
    );

    for revision in 0..3 {
        assert!(
            outcome
                .run_dir
                .join(format!("revisions/{revision}/project.json"))
                .exists()
        );
    }
    let exported = outcome.project_dir.expect("exported");
    assert_eq!(
        fs::read_to_string(exported.join("main.py")).expect("read"),
        "print(2)"
    );
    assert_eq!(
        fs::read_to_string(exported.join("util.py")).expect("read"),
        "X = 1"
    );

    let manifest = load_manifest(&outcome.run_dir).expect("manifest");
    assert_eq!(manifest.status.as_str(), "succeeded");
    assert_eq!(manifest.repair_requests, 2);
    let summary: Vec<(u32, u32, bool)> = manifest
        .attempts
        .iter()
        .map(|a| (a.index, a.revision, a.terminal))
        .collect();
    assert_eq!(summary, vec![(0, 0, false), (1, 1, false), (2, 2, true)]);
    assert_ne!(
        manifest.attempts[0].revision_digest,
        manifest.attempts[1].revision_digest
    );

    let records = load_attempts(&outcome.run_dir).expect("records");
    assert_eq!(records.len(), 3);
    assert!(records[0].patch.is_some());
    assert!(records[2].patch.is_none());
}

#[test]
fn single_attempt_budget_exhausts_without_repair() {
    let cfg = config(1);
    let sandbox = ScriptedSandbox::new(vec![failed_result(0, 1)]);
    let repairer = ScriptedRepairer::new(Vec::new());
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    assert_eq!(outcome.status, RunStatus::Exhausted);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.repair_requests, 0);
    assert!(repairer.seen().is_empty());
    assert_eq!(
        paperloop::exit_codes::for_status(&outcome.status),
        paperloop::exit_codes::EXHAUSTED
    );
}

/// Verifies the last failing revision is still exported when the budget runs out.
#[test]
fn exhausted_run_exports_last_revision() {
    let cfg = config(2);
    let sandbox = ScriptedSandbox::new(vec![failed_result(0, 1), failed_result(0, 2)]);
    let repairer = ScriptedRepairer::new(vec![fix("print('still broken')")]);
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    assert_eq!(outcome.status, RunStatus::Exhausted);
    assert_eq!(outcome.repair_requests, 1);
    assert_eq!(outcome.final_revision, Some(1));
    let manifest = load_manifest(&outcome.run_dir).expect("manifest");
    assert_eq!(manifest.attempts[1].exit_code, Some(2));
    assert!(manifest.attempts[1].terminal);
}

/// An invalid patch is rejected without a new attempt; the next request
/// carries the validation failure as feedback.
#[test]
fn invalid_patch_is_rerequested_with_feedback() {
    let cfg = config(3);
    let sandbox = ScriptedSandbox::new(vec![failed_result(0, 1), success_result(0)]);
    let bad = patch(0, vec![FileChange {
        path: "missing.py".to_string(),
        content: "x".to_string(),
        new_file: false,
    }]);
    let repairer = ScriptedRepairer::new(vec![Ok(bad), fix("print(1)")]);
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(outcome.repair_requests, 2);
    assert_eq!(sandbox.executed(), vec![0, 1]);

    let seen = repairer.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].feedback, None);
    assert_eq!((seen[1].attempt, seen[1].revision), (0, 0));
    assert!(
        seen[1]
            .feedback
            .as_deref()
            .is_some_and(|f| f.contains("missing.py"))
    );

    let records = load_attempts(&outcome.run_dir).expect("records");
    assert_eq!(records[0].repair_requests, 2);
    assert_eq!(records[0].repair_failures.len(), 1);
    assert_eq!(records[0].repair_failures[0].kind, RepairFailureKind::InvalidPatch);
    assert!(outcome.run_dir.join("attempts/0/repairs/1.json").exists());
    assert!(outcome.run_dir.join("attempts/0/repairs/2.json").exists());
}

#[test]
fn stale_patch_revision_is_rejected() {
    let cfg = config(3);
    let sandbox = ScriptedSandbox::new(vec![failed_result(0, 1), success_result(0)]);
    let mut repairer = ScriptedRepairer::new(vec![
        Ok(patch(7, Vec::new())),
        Ok(patch(0, Vec::new())),
    ]);
    repairer.keep_revision = true;
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.repair_requests, 2);
    let records = load_attempts(&outcome.run_dir).expect("records");
    assert_eq!(records[0].repair_failures.len(), 1);
}

#[test]
fn spent_repair_budget_is_fatal() {
    let cfg = config(3);
    let sandbox = ScriptedSandbox::new(vec![failed_result(0, 1)]);
    let repairer = ScriptedRepairer::new(vec![
        Err(CollaboratorError::Failed("exit code 1".to_string())),
        Err(CollaboratorError::InvalidResponse("not json".to_string())),
    ]);
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    let RunStatus::Fatal { reason } = &outcome.status else {
        panic!("expected fatal, got {:?}", outcome.status);
    };
    assert!(reason.contains("not json"));
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.repair_requests, 2);
    assert_eq!(sandbox.executed(), vec![0]);
}

/// Verifies a collaborator timeout is charged like an infrastructure failure.
#[test]
fn repair_timeout_uses_infrastructure_budget() {
    let cfg = RunnerConfig {
        repair_budget: 1,
        ..config(3)
    };
    let sandbox = ScriptedSandbox::new(vec![failed_result(0, 1), success_result(0)]);
    let repairer = ScriptedRepairer::new(vec![
        Err(CollaboratorError::Timeout(Duration::from_secs(600))),
        fix("print(1)"),
    ]);
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    assert_eq!(outcome.status, RunStatus::Succeeded);
    let records = load_attempts(&outcome.run_dir).expect("records");
    assert_eq!(
        records[0].repair_failures[0].kind,
        RepairFailureKind::CollaboratorTimeout
    );
}

/// Infrastructure failures re-run the same attempt until the limit, then end the run.
#[test]
fn repeated_infrastructure_failure_is_fatal() {
    let cfg = RunnerConfig {
        infra_retry_limit: 2,
        ..config(3)
    };
    let sandbox = ScriptedSandbox::new(vec![infra_result(0), infra_result(0), infra_result(0)]);
    let repairer = ScriptedRepairer::new(Vec::new());
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    assert!(matches!(outcome.status, RunStatus::Fatal { .. }));
    assert_eq!(sandbox.executed(), vec![0, 0, 0]);
    assert_eq!(outcome.attempts, 1);
    assert!(repairer.seen().is_empty());

    let manifest = load_manifest(&outcome.run_dir).expect("manifest");
    assert_eq!(manifest.attempts[0].infra_retries, 3);
    assert_eq!(manifest.attempts[0].exit_status, "infrastructure_failure");
}

#[test]
fn infrastructure_retry_then_success() {
    let cfg = config(1);
    let sandbox = ScriptedSandbox::new(vec![infra_result(0), success_result(0)]);
    let repairer = ScriptedRepairer::new(Vec::new());
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(outcome.attempts, 1);
}

/// Sandbox that raises the cancel flag after its first execution.
struct CancellingSandbox {
    inner: ScriptedSandbox,
    cancel: CancelToken,
}

impl Sandbox for CancellingSandbox {
    fn execute(
        &self,
        project: &CodeProject,
        limits: &ResourceLimits,
        timeout: Duration,
    ) -> ExecutionResult {
        let result = self.inner.execute(project, limits, timeout);
        self.cancel.cancel();
        result
    }
}

#[test]
fn cancellation_stops_before_repair() {
    let cfg = config(3);
    let cancel = CancelToken::new();
    let sandbox = CancellingSandbox {
        inner: ScriptedSandbox::new(vec![failed_result(0, 1)]),
        cancel: cancel.clone(),
    };
    let repairer = ScriptedRepairer::new(vec![fix("print(1)")]);
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &cancel);

    let RunStatus::Fatal { reason } = &outcome.status else {
        panic!("expected fatal, got {:?}", outcome.status);
    };
    assert!(reason.contains("cancelled"));
    assert!(repairer.seen().is_empty());
    assert_eq!(outcome.attempts, 1);

    let manifest = load_manifest(&outcome.run_dir).expect("manifest");
    assert!(manifest.attempts[0].terminal);
    assert!(manifest.ended_at.is_some());
    assert!(!outcome.run_dir.join(".lock").exists());
}

/// An execution interrupted by cancellation ends the run as cancelled even
/// when no infrastructure retries are allowed.
#[test]
fn cancelled_execution_is_not_an_infrastructure_failure() {
    let cfg = RunnerConfig {
        infra_retry_limit: 0,
        ..config(3)
    };
    let sandbox = ScriptedSandbox::new(vec![cancelled_result(0)]);
    let repairer = ScriptedRepairer::new(vec![fix("print(1)")]);
    let (_temp, outcome) = run(&cfg, &sandbox, &repairer, &CancelToken::new());

    let RunStatus::Fatal { reason } = &outcome.status else {
        panic!("expected fatal, got {:?}", outcome.status);
    };
    assert!(reason.starts_with("cancelled:"), "{reason}");
    assert!(repairer.seen().is_empty());

    let manifest = load_manifest(&outcome.run_dir).expect("manifest");
    assert_eq!(manifest.attempts[0].exit_status, "cancelled");
    assert_eq!(manifest.attempts[0].infra_retries, 0);
    assert!(manifest.attempts[0].terminal);
    assert_eq!(
        fs::read_to_string(outcome.run_dir.join("attempts/0/stdout.log")).expect("stdout"),
        "epoch 1\n"
    );
}

/// Risky constructs in the executed revision are kept in the manifest.
#[test]
fn risky_constructs_are_recorded_per_attempt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(temp.path());
    let cfg = config(3);
    let sandbox = ScriptedSandbox::new(vec![success_result(0)]);
    let generator = ScriptedGenerator::new(Ok(project(0, &[(
        "main.py",
        "import os\nos.system('nvidia-smi')\n",
    )])));
    let repairer = ScriptedRepairer::new(Vec::new());
    let cancel = CancelToken::new();
    let ctx = PipelineContext {
        config: &cfg,
        store: &store,
        sandbox: &sandbox,
        generator: &generator,
        repairer: &repairer,
        cancel: &cancel,
    };

    let outcome = run_pipeline(&ctx, "run-1", &sample_spec(), None).expect("run");
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let manifest = load_manifest(&outcome.run_dir).expect("manifest");
    assert_eq!(manifest.attempts[0].warnings, vec![
        "main.py:2: uses os.system".to_string()
    ]);
}

/// Two runs driven on separate threads against one store keep separate,
/// complete run directories.
#[test]
fn concurrent_runs_share_one_store() {
    let temp = tempfile::tempdir().expect("tempdir");
    let store = ArtifactStore::new(temp.path());
    let cfg = config(3);

    let outcomes: Vec<RunOutcome> = std::thread::scope(|scope| {
        let handles: Vec<_> = ["run-a", "run-b"]
            .into_iter()
            .map(|run_id| {
                let store = &store;
                let cfg = &cfg;
                scope.spawn(move || {
                    let sandbox = ScriptedSandbox::new(vec![failed_result(0, 1), success_result(0)]);
                    let generator = ScriptedGenerator::new(Ok(initial()));
                    let repairer = ScriptedRepairer::new(vec![fix(&format!("print('{run_id}')"))]);
                    let cancel = CancelToken::new();
                    let ctx = PipelineContext {
                        config: cfg,
                        store,
                        sandbox: &sandbox,
                        generator: &generator,
                        repairer: &repairer,
                        cancel: &cancel,
                    };
                    run_pipeline(&ctx, run_id, &sample_spec(), None).expect("run")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("join"))
            .collect()
    });

    for (outcome, run_id) in outcomes.iter().zip(["run-a", "run-b"]) {
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.run_dir, store.run_dir(run_id));

        let manifest = load_manifest(&outcome.run_dir).expect("manifest");
        assert_eq!(manifest.run_id, run_id);
        assert_eq!(manifest.attempts.len(), 2);
        assert_eq!(manifest.repair_requests, 1);

        let records = load_attempts(&outcome.run_dir).expect("records");
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.revision == r.index));

        let exported = fs::read_to_string(outcome.run_dir.join("project/main.py")).expect("main");
        assert_eq!(exported, format!("print('{run_id}')"));
        assert!(!store.is_locked(run_id));
    }
    assert_eq!(
        fs::read_dir(store.runs_dir()).expect("runs").count(),
        2
    );
}
