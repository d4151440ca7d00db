//! The decision engine: one pure verdict per cycle.
//!
//! Rules are evaluated in strict priority order and the first match wins:
//!
//! 1. run already completed/errored, or no step left: finish
//! 2. substep ceiling reached: advance
//! 3. circuit breaker tripped: finish
//! 4. current step already completed: finish with an invariant violation
//! 5. a verdict exists: confident completion advances, otherwise the
//!    no-change, failure and low-confidence limits decide
//! 6. no usable verdict: fall back to the last execution result
//! 7. nothing recorded yet: continue
//!
//! With [`DuplicatePolicy::ForceAdvance`], a duplicate pattern advances the step
//! between rules 4 and 5.

use serde::{Deserialize, Serialize};

use crate::core::state::RunState;
use crate::core::types::{AdvanceReason, Decision, FinishReason, RunStatus, ValidationVerdict};

/// What a detected duplicate pattern does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Feed the duplicate flag into the next plan request only.
    #[default]
    Annotate,
    /// Advance the step once the duplicate pattern threshold is reached.
    ForceAdvance,
}

/// Thresholds used by [`decide`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecisionPolicy {
    pub max_substeps_per_step: u32,
    pub confidence_threshold: f64,
    pub low_confidence: f64,
    pub circuit_breaker_failures: u32,
    pub step_failure_limit: u32,
    pub low_confidence_failure_limit: u32,
    pub no_change_limit: u32,
    pub duplicate_policy: DuplicatePolicy,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            max_substeps_per_step: 10,
            confidence_threshold: 0.7,
            low_confidence: 0.6,
            circuit_breaker_failures: 5,
            step_failure_limit: 3,
            low_confidence_failure_limit: 2,
            no_change_limit: 3,
            duplicate_policy: DuplicatePolicy::Annotate,
        }
    }
}

pub fn decide(state: &RunState, policy: &DecisionPolicy) -> Decision {
    let index = state.current_step_index();
    let ledger = state.ledger();

    if matches!(state.status(), RunStatus::Completed) || state.status().is_terminal() {
        return Decision::FinishRun(FinishReason::Done);
    }
    if index >= state.steps().len() {
        return Decision::FinishRun(FinishReason::Done);
    }
    if state.current_substep_index() >= policy.max_substeps_per_step {
        return Decision::AdvanceStep(AdvanceReason::SubstepCeiling);
    }
    if ledger.failures_at_least(policy.circuit_breaker_failures) {
        return Decision::FinishRun(FinishReason::CircuitBreaker);
    }
    if state.is_step_completed(index) {
        return Decision::FinishRun(FinishReason::InvariantViolation(format!(
            "decision requested for step index {index} which is already completed"
        )));
    }
    if policy.duplicate_policy == DuplicatePolicy::ForceAdvance && state.duplicate().pattern {
        return Decision::AdvanceStep(AdvanceReason::DuplicatePattern);
    }

    if let Some(decision) = state
        .last_validation()
        .and_then(|verdict| decide_from_verdict(state, verdict, policy))
    {
        return decision;
    }

    let Some(last) = state.last_result_for_step() else {
        return Decision::ContinueSubstep;
    };
    if last.result.success {
        if last.is_final {
            return Decision::AdvanceStep(AdvanceReason::FinalSubstepSucceeded);
        }
        return Decision::ContinueSubstep;
    }
    if ledger.failures_at_least(policy.step_failure_limit) {
        return Decision::AdvanceStep(AdvanceReason::RepeatedFailures);
    }
    // A failed final check is retried like any other failure.
    Decision::ContinueSubstep
}

/// Rule 5. `None` means the verdict is not confident enough to decide alone.
fn decide_from_verdict(
    state: &RunState,
    verdict: &ValidationVerdict,
    policy: &DecisionPolicy,
) -> Option<Decision> {
    let ledger = state.ledger();
    let low_confidence_give_up = verdict.confidence < policy.low_confidence
        && ledger.failures_at_least(policy.low_confidence_failure_limit);

    if verdict.confidence >= policy.confidence_threshold {
        if verdict.is_completed {
            return Some(Decision::AdvanceStep(AdvanceReason::Validated));
        }
        if ledger.no_change_at_least(policy.no_change_limit) {
            return Some(Decision::AdvanceStep(AdvanceReason::PageUnchanged));
        }
        if ledger.failures_at_least(policy.step_failure_limit) {
            return Some(Decision::AdvanceStep(AdvanceReason::RepeatedFailures));
        }
        if low_confidence_give_up {
            return Some(Decision::AdvanceStep(AdvanceReason::LowConfidence));
        }
        return Some(Decision::ContinueSubstep);
    }

    if low_confidence_give_up {
        return Some(Decision::AdvanceStep(AdvanceReason::LowConfidence));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::duplicate::DuplicateCheck;
    use crate::core::ledger::RetryLedger;
    use crate::core::state::WindowLimits;
    use crate::core::types::{ActionKind, ExecResult, Plan, RecordId, Step, Target};

    fn state(n: usize) -> RunState {
        let steps = (0..n)
            .map(|i| Step {
                id: format!("step-{i}"),
                order: i as u32,
                action: "do it".to_string(),
                expected_result: "done".to_string(),
                comment: None,
            })
            .collect();
        RunState::new("case", "cred", steps, WindowLimits::default())
    }

    fn verdict(is_completed: bool, confidence: f64) -> Option<ValidationVerdict> {
        Some(ValidationVerdict {
            is_completed,
            confidence,
            reason: "r".to_string(),
            evidence: String::new(),
        })
    }

    fn push_result(state: &mut RunState, success: bool, is_final: bool) {
        let mut plan = Plan::new("Click", ActionKind::Click, Target::selector("#b"));
        plan.is_final = is_final;
        let result = if success {
            ExecResult::succeeded("ok")
        } else {
            ExecResult::failed("click", "timeout")
        };
        state.record_result(RecordId::Stored("sub".into()), &plan, result);
    }

    fn policy() -> DecisionPolicy {
        DecisionPolicy::default()
    }

    #[test]
    fn confident_completion_advances() {
        let mut state = state(2);
        state.set_last_validation(verdict(true, 0.9));
        assert_eq!(
            decide(&state, &policy()),
            Decision::AdvanceStep(AdvanceReason::Validated)
        );
    }

    #[test]
    fn low_confidence_with_two_failures_advances() {
        let mut state = state(2);
        state.set_ledger(RetryLedger::with_counts(2, 0));
        state.set_last_validation(verdict(false, 0.5));
        assert_eq!(
            decide(&state, &policy()),
            Decision::AdvanceStep(AdvanceReason::LowConfidence)
        );
    }

    #[test]
    fn failed_final_plan_without_verdict_is_retried() {
        let mut state = state(2);
        push_result(&mut state, false, true);
        assert_eq!(state.ledger().consecutive_failures(), 1);
        assert_eq!(decide(&state, &policy()), Decision::ContinueSubstep);
    }

    #[test]
    fn completed_current_step_is_an_invariant_violation() {
        let mut state = state(4);
        state.force_step_index(2);
        state.force_completed(2);
        assert!(matches!(
            decide(&state, &policy()),
            Decision::FinishRun(FinishReason::InvariantViolation(_))
        ));
    }

    #[test]
    fn circuit_breaker_beats_every_other_signal() {
        let mut state = state(2);
        state.set_ledger(RetryLedger::with_counts(5, 3));
        state.set_last_validation(verdict(true, 1.0));
        assert_eq!(
            decide(&state, &policy()),
            Decision::FinishRun(FinishReason::CircuitBreaker)
        );
    }

    #[test]
    fn substep_ceiling_advances_despite_confident_not_completed() {
        let mut state = state(2);
        state.set_substep_index(10);
        state.set_last_validation(verdict(false, 0.95));
        assert_eq!(
            decide(&state, &policy()),
            Decision::AdvanceStep(AdvanceReason::SubstepCeiling)
        );
    }

    #[test]
    fn substep_ceiling_outranks_circuit_breaker() {
        let mut state = state(2);
        state.set_substep_index(10);
        state.set_ledger(RetryLedger::with_counts(5, 0));
        assert_eq!(
            decide(&state, &policy()),
            Decision::AdvanceStep(AdvanceReason::SubstepCeiling)
        );
    }

    #[test]
    fn no_steps_left_finishes() {
        let mut state = state(1);
        state
            .advance_step(AdvanceReason::Validated)
            .expect("advance");
        assert_eq!(
            decide(&state, &policy()),
            Decision::FinishRun(FinishReason::Done)
        );
    }

    #[test]
    fn errored_run_finishes() {
        let mut state = state(2);
        state.fail("boom");
        assert_eq!(
            decide(&state, &policy()),
            Decision::FinishRun(FinishReason::Done)
        );
    }

    #[test]
    fn confident_not_completed_uses_sub_policy() {
        let mut state = state(2);
        state.set_last_validation(verdict(false, 0.8));
        assert_eq!(decide(&state, &policy()), Decision::ContinueSubstep);

        state.set_ledger(RetryLedger::with_counts(0, 3));
        assert_eq!(
            decide(&state, &policy()),
            Decision::AdvanceStep(AdvanceReason::PageUnchanged)
        );

        state.set_ledger(RetryLedger::with_counts(3, 0));
        assert_eq!(
            decide(&state, &policy()),
            Decision::AdvanceStep(AdvanceReason::RepeatedFailures)
        );
    }

    #[test]
    fn middling_confidence_falls_back_to_execution_result() {
        let mut state = state(2);
        push_result(&mut state, true, true);
        state.set_last_validation(verdict(false, 0.65));
        assert_eq!(
            decide(&state, &policy()),
            Decision::AdvanceStep(AdvanceReason::FinalSubstepSucceeded)
        );
    }

    #[test]
    fn fallback_rules_without_verdict() {
        let mut state = state(2);
        assert_eq!(decide(&state, &policy()), Decision::ContinueSubstep);

        push_result(&mut state, true, false);
        assert_eq!(decide(&state, &policy()), Decision::ContinueSubstep);

        for _ in 0..3 {
            push_result(&mut state, false, false);
        }
        assert_eq!(
            decide(&state, &policy()),
            Decision::AdvanceStep(AdvanceReason::RepeatedFailures)
        );
    }

    #[test]
    fn duplicate_pattern_only_advances_when_forced() {
        let mut state = state(2);
        let plan = Plan::new("Click", ActionKind::Click, Target::selector("#b"));
        state.record_plan(
            plan,
            DuplicateCheck {
                matches: 2,
                exact: true,
                pattern: true,
            },
        );
        assert_eq!(decide(&state, &policy()), Decision::ContinueSubstep);

        let forced = DecisionPolicy {
            duplicate_policy: DuplicatePolicy::ForceAdvance,
            ..policy()
        };
        assert_eq!(
            decide(&state, &forced),
            Decision::AdvanceStep(AdvanceReason::DuplicatePattern)
        );
    }
}
