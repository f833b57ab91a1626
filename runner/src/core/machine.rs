//! Run state machine for the generate-execute-repair loop.
//!
//! [`Machine::apply`] is a pure transition: it consumes one [`Event`], updates
//! the run state and returns the [`Effect`]s the driver must perform, in order.
//! Persist effects always precede the effect that starts the next transition,
//! so a crashed driver leaves an auditable history behind.
//!
//! ```text
//! Ready -> Executing -> Succeeded
//!                    -> Exhausted
//!                    -> AwaitingRepair -> RepairRequested -> (merge) -> Executing
//! any non-terminal   -> Fatal
//! ```
//!
//! Merging is not a resting state: the merger is pure, so a received patch is
//! merged inside the `RepairReceived` transition.

use crate::core::merge::apply_patch;
use crate::core::project::{risky_patterns, validate_project};
use crate::core::retry::{Decision, RetryPolicy, StopReason, SubBudget};
use crate::core::types::{
    AttemptRecord, CodeProject, ExecutionResult, ExitStatus, RepairFailure, RepairFailureKind,
    RepairPatch, RunStatus,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Ready,
    Executing {
        attempt: u32,
        revision: u32,
        infra_failures: u32,
    },
    /// A repair must be dispatched for `attempt`.
    AwaitingRepair(RepairCycle),
    /// A repair request is in flight.
    RepairRequested(RepairCycle),
    Succeeded,
    Exhausted,
    Fatal,
}

impl State {
    pub fn name(&self) -> &'static str {
        match self {
            State::Ready => "ready",
            State::Executing { .. } => "executing",
            State::AwaitingRepair(_) => "awaiting_repair",
            State::RepairRequested(_) => "repair_requested",
            State::Succeeded => "succeeded",
            State::Exhausted => "exhausted",
            State::Fatal => "fatal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Succeeded | State::Exhausted | State::Fatal)
    }
}

/// Bookkeeping for the repair requests that follow one failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairCycle {
    pub attempt: u32,
    pub revision: u32,
    /// Failed repairs charged to the repair budget.
    pub failures: u32,
    /// Collaborator timeouts, charged like infrastructure failures.
    pub timeouts: u32,
    /// Context appended to the next request (last validation failure).
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The initial project is available.
    Start(CodeProject),
    /// The generation collaborator failed before any project existed.
    GenerationFailed(String),
    /// The sandbox backend cannot execute programs at all.
    SandboxUnavailable(String),
    Executed(ExecutionResult),
    RepairDispatched,
    RepairReceived(RepairPatch),
    RepairFailed(RepairFailure),
    Cancelled(String),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start(_) => "start",
            Event::GenerationFailed(_) => "generation_failed",
            Event::SandboxUnavailable(_) => "sandbox_unavailable",
            Event::Executed(_) => "executed",
            Event::RepairDispatched => "repair_dispatched",
            Event::RepairReceived(_) => "repair_received",
            Event::RepairFailed(_) => "repair_failed",
            Event::Cancelled(_) => "cancelled",
        }
    }
}

/// Artifact the driver must persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    /// A new revision entered the arena.
    Revision(u32),
    /// The attempt record at this index changed.
    Attempt(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Persist(Checkpoint),
    Execute {
        attempt: u32,
        revision: u32,
    },
    RequestRepair {
        attempt: u32,
        revision: u32,
        feedback: Option<String>,
    },
    Finish(RunStatus),
}

/// The orchestrator's run state: current state, revision arena and the
/// append-only attempt history.
#[derive(Debug, Clone)]
pub struct Machine {
    policy: RetryPolicy,
    state: State,
    revisions: Vec<CodeProject>,
    attempts: Vec<AttemptRecord>,
    status: Option<RunStatus>,
    repair_requests: u32,
}

impl Machine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: State::Ready,
            revisions: Vec::new(),
            attempts: Vec::new(),
            status: None,
            repair_requests: 0,
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Terminal status, once reached.
    pub fn status(&self) -> Option<&RunStatus> {
        self.status.as_ref()
    }

    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    pub fn attempt(&self, index: u32) -> Option<&AttemptRecord> {
        self.attempts.get(index as usize)
    }

    pub fn revisions(&self) -> &[CodeProject] {
        &self.revisions
    }

    pub fn revision(&self, revision: u32) -> Option<&CodeProject> {
        self.revisions.get(revision as usize)
    }

    pub fn latest_revision(&self) -> Option<&CodeProject> {
        self.revisions.last()
    }

    /// Total repair requests dispatched over the run.
    pub fn repair_requests(&self) -> u32 {
        self.repair_requests
    }

    /// Apply one event. Errors indicate a driver bug (event not valid in the
    /// current state); the machine is left unchanged in that case.
    pub fn apply(&mut self, event: Event) -> Result<Vec<Effect>, String> {
        if self.state.is_terminal() {
            return Err(format!(
                "run already finished ({}); got {}",
                self.state.name(),
                event.name()
            ));
        }

        let state = self.state.clone();
        match (state, event) {
            (_, Event::Cancelled(reason)) => Ok(self.fatal(format!("cancelled: {reason}"))),
            (State::Ready, Event::Start(project)) => Ok(self.start(project)),
            (State::Ready, Event::GenerationFailed(reason)) => {
                Ok(self.fatal(format!("code generation failed: {reason}")))
            }
            (State::Ready, Event::SandboxUnavailable(reason)) => {
                Ok(self.fatal(format!("sandbox unavailable: {reason}")))
            }
            (
                State::Executing {
                    attempt,
                    revision,
                    infra_failures,
                },
                Event::Executed(result),
            ) => {
                if result.revision != revision {
                    return Err(format!(
                        "result for revision {} while executing revision {revision}",
                        result.revision
                    ));
                }
                Ok(self.executed(attempt, revision, infra_failures, result))
            }
            (State::AwaitingRepair(cycle), Event::RepairDispatched) => {
                self.repair_requests += 1;
                if let Some(record) = self.attempts.get_mut(cycle.attempt as usize) {
                    record.repair_requests += 1;
                }
                let attempt = cycle.attempt;
                self.state = State::RepairRequested(cycle);
                Ok(vec![Effect::Persist(Checkpoint::Attempt(attempt))])
            }
            (State::RepairRequested(cycle), Event::RepairReceived(patch)) => {
                Ok(self.merge(cycle, patch))
            }
            (State::RepairRequested(cycle), Event::RepairFailed(failure)) => {
                Ok(self.repair_failed(cycle, failure))
            }
            (state, event) => Err(format!(
                "event {} is not valid in state {}",
                event.name(),
                state.name()
            )),
        }
    }

    fn start(&mut self, project: CodeProject) -> Vec<Effect> {
        let mut errors = validate_project(&project);
        if project.revision != 0 {
            errors.push(format!(
                "initial project must be revision 0, got {}",
                project.revision
            ));
        }
        if !errors.is_empty() {
            return self.fatal(format!(
                "generated project is invalid: {}",
                errors.join("; ")
            ));
        }
        self.revisions.push(project);
        self.state = State::Executing {
            attempt: 0,
            revision: 0,
            infra_failures: 0,
        };
        vec![
            Effect::Persist(Checkpoint::Revision(0)),
            Effect::Execute {
                attempt: 0,
                revision: 0,
            },
        ]
    }

    fn executed(
        &mut self,
        attempt: u32,
        revision: u32,
        infra_failures: u32,
        result: ExecutionResult,
    ) -> Vec<Effect> {
        let infra_reason = match &result.status {
            ExitStatus::InfrastructureFailure { reason } => Some(reason.clone()),
            ExitStatus::Success
            | ExitStatus::NonZeroExit { .. }
            | ExitStatus::Timeout
            | ExitStatus::Cancelled => None,
        };
        let cancelled = result.status == ExitStatus::Cancelled;
        self.record_result(attempt, revision, result, infra_reason.clone());

        if cancelled {
            return self.fatal(format!(
                "cancelled: execution of attempt {attempt} (revision {revision}) was interrupted"
            ));
        }

        if let Some(reason) = infra_reason {
            let failures = infra_failures + 1;
            return match self.policy.after_infra_failure(failures) {
                SubBudget::Retry(_) => {
                    self.state = State::Executing {
                        attempt,
                        revision,
                        infra_failures: failures,
                    };
                    vec![
                        Effect::Persist(Checkpoint::Attempt(attempt)),
                        Effect::Execute { attempt, revision },
                    ]
                }
                SubBudget::Spent => self.fatal(format!(
                    "sandbox infrastructure failed {failures} times: {reason}"
                )),
            };
        }

        match self.policy.decide(&self.attempts) {
            Decision::Stop(StopReason::Success) => {
                self.finish(State::Succeeded, RunStatus::Succeeded)
            }
            Decision::Stop(StopReason::Exhausted) => {
                self.finish(State::Exhausted, RunStatus::Exhausted)
            }
            Decision::Continue => {
                self.state = State::AwaitingRepair(RepairCycle {
                    attempt,
                    revision,
                    failures: 0,
                    timeouts: 0,
                    feedback: None,
                });
                vec![
                    Effect::Persist(Checkpoint::Attempt(attempt)),
                    Effect::RequestRepair {
                        attempt,
                        revision,
                        feedback: None,
                    },
                ]
            }
        }
    }

    /// Insert or replace the record for `attempt`. Infrastructure retries
    /// replace the result of the same attempt and accumulate their reasons.
    fn record_result(
        &mut self,
        attempt: u32,
        revision: u32,
        result: ExecutionResult,
        infra_reason: Option<String>,
    ) {
        let idx = attempt as usize;
        if idx == self.attempts.len() {
            let warnings = self
                .revisions
                .get(revision as usize)
                .map(risky_patterns)
                .unwrap_or_default();
            self.attempts.push(AttemptRecord {
                index: attempt,
                revision,
                result,
                infra_failures: Vec::new(),
                repair_requests: 0,
                repair_failures: Vec::new(),
                patch: None,
                terminal: false,
                warnings,
            });
        } else {
            self.attempts[idx].result = result;
        }
        if let Some(reason) = infra_reason {
            self.attempts[idx].infra_failures.push(reason);
        }
    }

    fn merge(&mut self, cycle: RepairCycle, patch: RepairPatch) -> Vec<Effect> {
        let Some(base) = self.revisions.get(cycle.revision as usize) else {
            return self.fatal(format!("revision {} missing from arena", cycle.revision));
        };
        match apply_patch(base, &patch) {
            Ok(next) => {
                let next_revision = next.revision;
                self.revisions.push(next);
                if let Some(record) = self.attempts.get_mut(cycle.attempt as usize) {
                    record.patch = Some(patch);
                }
                let next_attempt = self.policy.next_attempt(&self.attempts, next_revision);
                self.state = State::Executing {
                    attempt: next_attempt.index,
                    revision: next_attempt.revision,
                    infra_failures: 0,
                };
                vec![
                    Effect::Persist(Checkpoint::Revision(next_revision)),
                    Effect::Persist(Checkpoint::Attempt(cycle.attempt)),
                    Effect::Execute {
                        attempt: next_attempt.index,
                        revision: next_attempt.revision,
                    },
                ]
            }
            Err(err) => self.repair_failed(
                cycle,
                RepairFailure {
                    kind: RepairFailureKind::InvalidPatch,
                    detail: err.to_string(),
                },
            ),
        }
    }

    fn repair_failed(&mut self, mut cycle: RepairCycle, failure: RepairFailure) -> Vec<Effect> {
        if let Some(record) = self.attempts.get_mut(cycle.attempt as usize) {
            record.repair_failures.push(failure.clone());
        }

        let verdict = match failure.kind {
            RepairFailureKind::CollaboratorTimeout => {
                cycle.timeouts += 1;
                self.policy.after_infra_failure(cycle.timeouts)
            }
            RepairFailureKind::InvalidPatch => {
                cycle.failures += 1;
                cycle.feedback = Some(failure.detail.clone());
                self.policy.after_repair_failure(cycle.failures)
            }
            RepairFailureKind::CollaboratorError => {
                cycle.failures += 1;
                self.policy.after_repair_failure(cycle.failures)
            }
        };

        match verdict {
            SubBudget::Retry(_) => {
                let effects = vec![
                    Effect::Persist(Checkpoint::Attempt(cycle.attempt)),
                    Effect::RequestRepair {
                        attempt: cycle.attempt,
                        revision: cycle.revision,
                        feedback: cycle.feedback.clone(),
                    },
                ];
                self.state = State::AwaitingRepair(cycle);
                effects
            }
            SubBudget::Spent => self.fatal(format!(
                "repair failed for attempt {} ({} failures, {} timeouts): {}",
                cycle.attempt, cycle.failures, cycle.timeouts, failure.detail
            )),
        }
    }

    fn fatal(&mut self, reason: String) -> Vec<Effect> {
        self.finish(State::Fatal, RunStatus::Fatal { reason })
    }

    fn finish(&mut self, state: State, status: RunStatus) -> Vec<Effect> {
        let mut effects = Vec::new();
        if let Some(last) = self.attempts.last_mut() {
            last.terminal = true;
            effects.push(Effect::Persist(Checkpoint::Attempt(last.index)));
        }
        self.state = state;
        self.status = Some(status.clone());
        effects.push(Effect::Finish(status));
        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FileChange;
    use crate::test_support::{
        cancelled_result, failed_result, infra_result, patch, project, success_result,
    };

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            repair_budget: 2,
            infra_retry_limit: 1,
        }
    }

    fn started(max_attempts: u32) -> Machine {
        let mut machine = Machine::new(policy(max_attempts));
        machine
            .apply(Event::Start(project(0, &[("main.py", "print(1)")])))
            .expect("start");
        machine
    }

    fn fix_main(revision: u32) -> RepairPatch {
        patch(revision, vec![FileChange {
            path: "main.py".to_string(),
            content: format!("print({})", revision + 1),
            new_file: false,
        }])
    }

    #[test]
    fn start_persists_revision_then_executes() {
        let mut machine = Machine::new(policy(3));
        let effects = machine
            .apply(Event::Start(project(0, &[("main.py", "")])))
            .expect("start");
        assert_eq!(
            effects,
            vec![
                Effect::Persist(Checkpoint::Revision(0)),
                Effect::Execute {
                    attempt: 0,
                    revision: 0
                },
            ]
        );
        assert_eq!(machine.state().name(), "executing");
    }

    #[test]
    fn invalid_initial_project_is_fatal() {
        let mut machine = Machine::new(policy(3));
        let mut p = project(0, &[("main.py", "")]);
        p.entrypoint = "missing.py".to_string();
        let effects = machine.apply(Event::Start(p)).expect("start");

        assert_eq!(machine.state(), &State::Fatal);
        assert!(matches!(effects.last(), Some(Effect::Finish(RunStatus::Fatal { .. }))));
        assert!(machine.attempts().is_empty());
    }

    #[test]
    fn generation_failure_is_fatal_without_attempts() {
        let mut machine = Machine::new(policy(3));
        let effects = machine
            .apply(Event::GenerationFailed("model unavailable".to_string()))
            .expect("apply");
        assert_eq!(effects.len(), 1);
        let Some(RunStatus::Fatal { reason }) = machine.status() else {
            panic!("expected fatal");
        };
        assert!(reason.contains("model unavailable"));
    }

    #[test]
    fn success_on_first_attempt() {
        let mut machine = started(3);
        let effects = machine
            .apply(Event::Executed(success_result(0)))
            .expect("executed");
        assert_eq!(
            effects,
            vec![
                Effect::Persist(Checkpoint::Attempt(0)),
                Effect::Finish(RunStatus::Succeeded),
            ]
        );
        assert!(machine.attempts()[0].terminal);
    }

    #[test]
    fn single_attempt_budget_exhausts_without_repair() {
        let mut machine = started(1);
        let effects = machine
            .apply(Event::Executed(failed_result(0, 1)))
            .expect("executed");
        assert_eq!(effects.last(), Some(&Effect::Finish(RunStatus::Exhausted)));
        assert_eq!(machine.repair_requests(), 0);
        assert_eq!(machine.attempts().len(), 1);
    }

    #[test]
    fn fail_fail_succeed_uses_three_attempts_and_two_repairs() {
        let mut machine = started(3);
        for revision in 0..2 {
            let effects = machine
                .apply(Event::Executed(failed_result(revision, 1)))
                .expect("executed");
            assert!(matches!(
                effects.last(),
                Some(Effect::RequestRepair { feedback: None, .. })
            ));
            machine.apply(Event::RepairDispatched).expect("dispatch");
            let effects = machine
                .apply(Event::RepairReceived(fix_main(revision)))
                .expect("repair");
            assert_eq!(
                effects.last(),
                Some(&Effect::Execute {
                    attempt: revision + 1,
                    revision: revision + 1
                })
            );
        }
        machine
            .apply(Event::Executed(success_result(2)))
            .expect("executed");

        assert_eq!(machine.status(), Some(&RunStatus::Succeeded));
        assert_eq!(machine.attempts().len(), 3);
        assert_eq!(machine.repair_requests(), 2);
        assert_eq!(machine.revisions().len(), 3);
        assert!(machine.attempts()[0].patch.is_some());
        assert!(machine.attempts()[2].patch.is_none());
    }

    #[test]
    fn invalid_patch_rerequests_with_feedback_without_new_attempt() {
        let mut machine = started(3);
        machine
            .apply(Event::Executed(failed_result(0, 1)))
            .expect("executed");
        machine.apply(Event::RepairDispatched).expect("dispatch");

        let bad = patch(0, vec![FileChange {
            path: "ghost.py".to_string(),
            content: String::new(),
            new_file: false,
        }]);
        let effects = machine
            .apply(Event::RepairReceived(bad))
            .expect("repair");

        let Some(Effect::RequestRepair {
            attempt,
            revision,
            feedback: Some(feedback),
        }) = effects.last()
        else {
            panic!("expected a second repair request, got {effects:?}");
        };
        assert_eq!((*attempt, *revision), (0, 0));
        assert!(feedback.contains("ghost.py"));
        assert_eq!(machine.attempts().len(), 1);
        assert_eq!(machine.revisions().len(), 1);
        assert_eq!(
            machine.attempts()[0].repair_failures[0].kind,
            RepairFailureKind::InvalidPatch
        );
    }

    #[test]
    fn repair_budget_spent_is_fatal() {
        let mut machine = started(3);
        machine
            .apply(Event::Executed(failed_result(0, 1)))
            .expect("executed");
        for _ in 0..2 {
            machine.apply(Event::RepairDispatched).expect("dispatch");
            machine
                .apply(Event::RepairFailed(RepairFailure {
                    kind: RepairFailureKind::CollaboratorError,
                    detail: "unparseable".to_string(),
                }))
                .expect("failed");
        }
        assert_eq!(machine.state(), &State::Fatal);
        assert_eq!(machine.repair_requests(), 2);
        assert!(machine.attempts()[0].terminal);
    }

    #[test]
    fn collaborator_timeouts_use_infra_budget() {
        let mut machine = started(3);
        machine
            .apply(Event::Executed(failed_result(0, 1)))
            .expect("executed");
        machine.apply(Event::RepairDispatched).expect("dispatch");
        let timeout = RepairFailure {
            kind: RepairFailureKind::CollaboratorTimeout,
            detail: "no response".to_string(),
        };
        let effects = machine
            .apply(Event::RepairFailed(timeout.clone()))
            .expect("timeout 1");
        assert!(matches!(effects.last(), Some(Effect::RequestRepair { .. })));

        machine.apply(Event::RepairDispatched).expect("dispatch");
        machine
            .apply(Event::RepairFailed(timeout))
            .expect("timeout 2");
        assert_eq!(machine.state(), &State::Fatal);
    }

    #[test]
    fn infra_failure_retries_same_attempt_then_fatal() {
        let mut machine = started(3);
        let effects = machine
            .apply(Event::Executed(infra_result(0)))
            .expect("infra 1");
        assert_eq!(
            effects.last(),
            Some(&Effect::Execute {
                attempt: 0,
                revision: 0
            })
        );
        assert_eq!(machine.attempts().len(), 1);

        machine
            .apply(Event::Executed(infra_result(0)))
            .expect("infra 2");
        assert_eq!(machine.state(), &State::Fatal);
        assert_eq!(machine.attempts().len(), 1);
        assert_eq!(machine.attempts()[0].infra_failures.len(), 2);
    }

    #[test]
    fn infra_retry_then_success_keeps_one_attempt() {
        let mut machine = started(1);
        machine
            .apply(Event::Executed(infra_result(0)))
            .expect("infra");
        machine
            .apply(Event::Executed(success_result(0)))
            .expect("success");
        assert_eq!(machine.status(), Some(&RunStatus::Succeeded));
        assert_eq!(machine.attempts().len(), 1);
        assert_eq!(machine.attempts()[0].infra_failures.len(), 1);
    }

    #[test]
    fn cancellation_is_fatal_and_terminal() {
        let mut machine = started(3);
        machine
            .apply(Event::Cancelled("operator".to_string()))
            .expect("cancel");
        assert_eq!(machine.state(), &State::Fatal);
        let err = machine
            .apply(Event::Executed(success_result(0)))
            .unwrap_err();
        assert!(err.contains("already finished"));
    }

    /// Verifies an interrupted execution is recorded and ends the run without
    /// touching the infrastructure budget.
    #[test]
    fn cancelled_execution_is_recorded_then_fatal() {
        let mut machine = Machine::new(RetryPolicy {
            infra_retry_limit: 0,
            ..policy(3)
        });
        machine
            .apply(Event::Start(project(0, &[("main.py", "")])))
            .expect("start");
        let effects = machine
            .apply(Event::Executed(cancelled_result(0)))
            .expect("executed");

        assert_eq!(effects.first(), Some(&Effect::Persist(Checkpoint::Attempt(0))));
        let Some(RunStatus::Fatal { reason }) = machine.status() else {
            panic!("expected fatal");
        };
        assert!(reason.starts_with("cancelled:"), "{reason}");
        let record = &machine.attempts()[0];
        assert!(record.infra_failures.is_empty());
        assert_eq!(record.result.stdout, "epoch 1\n");
        assert!(record.terminal);
    }

    #[test]
    fn sandbox_unavailable_is_fatal_before_any_attempt() {
        let mut machine = Machine::new(policy(3));
        machine
            .apply(Event::SandboxUnavailable("docker missing".to_string()))
            .expect("apply");
        let Some(RunStatus::Fatal { reason }) = machine.status() else {
            panic!("expected fatal");
        };
        assert_eq!(reason, "sandbox unavailable: docker missing");
        assert!(machine.attempts().is_empty());
    }

    /// Verifies the executed revision's risky constructs are kept on the record.
    #[test]
    fn attempt_records_risky_patterns() {
        let mut machine = Machine::new(policy(3));
        machine
            .apply(Event::Start(project(0, &[("main.py", "import subprocess")])))
            .expect("start");
        machine
            .apply(Event::Executed(success_result(0)))
            .expect("executed");
        assert_eq!(machine.attempts()[0].warnings, vec![
            "main.py:1: uses subprocess".to_string()
        ]);
    }

    #[test]
    fn out_of_order_events_are_rejected() {
        let mut machine = started(3);
        let err = machine.apply(Event::RepairDispatched).unwrap_err();
        assert!(err.contains("not valid in state executing"));

        let err = machine
            .apply(Event::Executed(success_result(5)))
            .unwrap_err();
        assert!(err.contains("revision 5"));
    }
}
