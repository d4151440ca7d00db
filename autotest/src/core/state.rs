//! The mutable aggregate for one test-case run and its transitions.
//!
//! Every mutation goes through a method here so the run-level invariants
//! (monotonic step index, each step completed at most once, terminal statuses
//! are sinks) are enforced in one place. Transitions that would break an
//! invariant return an error string instead of mutating.

use std::collections::BTreeSet;

use crate::core::duplicate::DuplicateCheck;
use crate::core::ledger::RetryLedger;
use crate::core::stuck::{SnapshotWindow, StuckDetector};
use crate::core::types::{
    AdvanceReason, ExecResult, PageSnapshot, Plan, RecordId, RunStatus, Step, StepOutcome,
    SubstepResult, ValidationVerdict,
};
use crate::core::verify;

/// Sizes of the observation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowLimits {
    pub history_capacity: usize,
    pub stuck_threshold: usize,
}

impl Default for WindowLimits {
    fn default() -> Self {
        Self {
            history_capacity: 5,
            stuck_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunState {
    test_case_id: String,
    credentials_id: String,
    steps: Vec<Step>,
    current_step_index: usize,
    completed_step_indices: BTreeSet<usize>,
    current_substep_index: u32,
    plan_history: Vec<Plan>,
    execution_results: Vec<SubstepResult>,
    ledger: RetryLedger,
    last_validation: Option<ValidationVerdict>,
    last_validation_snapshot: Option<PageSnapshot>,
    page_history: SnapshotWindow,
    stuck_detector: StuckDetector,
    stuck: bool,
    duplicate: DuplicateCheck,
    status: RunStatus,
    error_message: Option<String>,
    step_outcomes: Vec<StepOutcome>,
}

impl RunState {
    pub fn new(
        test_case_id: impl Into<String>,
        credentials_id: impl Into<String>,
        steps: Vec<Step>,
        limits: WindowLimits,
    ) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            credentials_id: credentials_id.into(),
            steps,
            current_step_index: 0,
            completed_step_indices: BTreeSet::new(),
            current_substep_index: 0,
            plan_history: Vec::new(),
            execution_results: Vec::new(),
            ledger: RetryLedger::default(),
            last_validation: None,
            last_validation_snapshot: None,
            page_history: SnapshotWindow::new(limits.history_capacity),
            stuck_detector: StuckDetector::new(limits.stuck_threshold),
            stuck: false,
            duplicate: DuplicateCheck::default(),
            status: RunStatus::Running,
            error_message: None,
            step_outcomes: Vec::new(),
        }
    }

    pub fn test_case_id(&self) -> &str {
        &self.test_case_id
    }

    pub fn credentials_id(&self) -> &str {
        &self.credentials_id
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn current_step_index(&self) -> usize {
        self.current_step_index
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn completed_step_indices(&self) -> &BTreeSet<usize> {
        &self.completed_step_indices
    }

    pub fn is_step_completed(&self, index: usize) -> bool {
        self.completed_step_indices.contains(&index)
    }

    pub fn current_substep_index(&self) -> u32 {
        self.current_substep_index
    }

    pub fn plan_history(&self) -> &[Plan] {
        &self.plan_history
    }

    pub fn execution_results(&self) -> &[SubstepResult] {
        &self.execution_results
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    pub fn last_validation(&self) -> Option<&ValidationVerdict> {
        self.last_validation.as_ref()
    }

    pub fn is_stuck(&self) -> bool {
        self.stuck
    }

    pub fn duplicate(&self) -> DuplicateCheck {
        self.duplicate
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn step_outcomes(&self) -> &[StepOutcome] {
        &self.step_outcomes
    }

    /// Most recent result recorded for the current step.
    pub fn last_result_for_step(&self) -> Option<&SubstepResult> {
        self.execution_results
            .last()
            .filter(|r| r.step_index == self.current_step_index)
    }

    pub fn results_for_step(&self, step_index: usize) -> impl Iterator<Item = &SubstepResult> {
        self.execution_results
            .iter()
            .filter(move |r| r.step_index == step_index)
    }

    /// Append an observation and recompute the stuck flag.
    pub fn observe(&mut self, snapshot: PageSnapshot) -> bool {
        self.page_history.push(snapshot);
        self.stuck = self.stuck_detector.is_stuck(&self.page_history);
        self.stuck
    }

    /// Planning for a completed step is a contract violation.
    pub fn ensure_plannable(&self) -> Result<(), String> {
        if self.is_step_completed(self.current_step_index) {
            return Err(format!(
                "planning requested for step index {} which is already completed",
                self.current_step_index
            ));
        }
        Ok(())
    }

    pub fn record_plan(&mut self, plan: Plan, duplicate: DuplicateCheck) {
        self.duplicate = duplicate;
        self.plan_history.push(plan);
    }

    /// Append an executed result for the current substep and update the ledger.
    pub fn record_result(&mut self, substep_id: RecordId, plan: &Plan, result: ExecResult) {
        self.ledger.record_execution(result.success);
        self.execution_results.push(SubstepResult {
            step_index: self.current_step_index,
            substep_index: self.current_substep_index,
            substep_id,
            description: plan.description.clone(),
            action_kind: plan.action_kind.clone(),
            is_final: plan.is_final,
            result,
        });
    }

    /// Store a verdict taken against `snapshot`, track page changes between
    /// validations, and apply the confidence-weighted override to the current
    /// step's latest result. Returns true when that result was overridden.
    pub fn apply_validation(
        &mut self,
        verdict: ValidationVerdict,
        snapshot: PageSnapshot,
        override_threshold: f64,
    ) -> bool {
        let unchanged = self
            .last_validation_snapshot
            .as_ref()
            .is_some_and(|prev| prev.same_page(&snapshot));
        self.ledger.record_page_change(unchanged);
        self.last_validation_snapshot = Some(snapshot);

        let step_index = self.current_step_index;
        let overridden = match self.execution_results.last_mut() {
            Some(last) if last.step_index == step_index => {
                verify::apply_override(&mut last.result, &verdict, override_threshold)
            }
            _ => false,
        };
        if overridden {
            self.ledger.clear_failures();
        }
        self.last_validation = Some(verdict);
        overridden
    }

    /// The validation call failed: keep no verdict for this cycle so the
    /// decision falls back to the mechanical result.
    pub fn record_validation_failure(&mut self, snapshot: PageSnapshot, reason: impl Into<String>) {
        let unchanged = self
            .last_validation_snapshot
            .as_ref()
            .is_some_and(|prev| prev.same_page(&snapshot));
        self.ledger.record_page_change(unchanged);
        self.last_validation_snapshot = Some(snapshot);
        self.last_validation = None;

        let step_index = self.current_step_index;
        if let Some(last) = self
            .execution_results
            .last_mut()
            .filter(|r| r.step_index == step_index)
        {
            last.result.validation_reason = Some(reason.into());
        }
    }

    pub fn continue_substep(&mut self) {
        self.current_substep_index = self.current_substep_index.saturating_add(1);
    }

    /// Mark the current step completed and move to the next uncompleted one.
    pub fn advance_step(&mut self, reason: AdvanceReason) -> Result<(), String> {
        let index = self.current_step_index;
        if index >= self.steps.len() {
            return Err(format!("cannot advance past the last step (index {index})"));
        }
        if !self.completed_step_indices.insert(index) {
            return Err(format!("step index {index} entered the completed set twice"));
        }
        self.step_outcomes.push(StepOutcome {
            step_index: index,
            step_id: self.steps[index].id.clone(),
            reason,
            substeps: self.results_for_step(index).count() as u32,
        });

        self.current_step_index = index + 1;
        while self.current_step_index < self.steps.len()
            && self.is_step_completed(self.current_step_index)
        {
            self.current_step_index += 1;
        }

        self.current_substep_index = 0;
        self.plan_history.clear();
        self.ledger.reset();
        self.last_validation = None;
        self.last_validation_snapshot = None;
        self.duplicate = DuplicateCheck::default();

        if self.current_step_index >= self.steps.len() && self.status == RunStatus::Running {
            self.status = RunStatus::Completed;
        }
        Ok(())
    }

    /// Record a fatal error. The first message wins.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() && self.status != RunStatus::Error {
            return;
        }
        self.status = RunStatus::Error;
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
    }

    /// Stop looping without marking the run as errored. The first message wins.
    pub fn halt(&mut self, message: impl Into<String>) {
        if self.error_message.is_none() {
            self.error_message = Some(message.into());
        }
    }

    /// Compute the terminal status. Idempotent.
    pub fn finalize(&mut self) -> RunStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        let all_completed =
            !self.steps.is_empty() && self.completed_step_indices.len() >= self.steps.len();
        self.status = if all_completed {
            RunStatus::Passed
        } else {
            RunStatus::Failed
        };
        self.status
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn set_ledger(&mut self, ledger: RetryLedger) {
        self.ledger = ledger;
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn set_last_validation(&mut self, verdict: Option<ValidationVerdict>) {
        self.last_validation = verdict;
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn set_substep_index(&mut self, index: u32) {
        self.current_substep_index = index;
    }

    /// Put the state into an inconsistent shape for invariant tests.
    #[cfg(any(test, feature = "test-support"))]
    pub fn force_completed(&mut self, index: usize) {
        self.completed_step_indices.insert(index);
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn force_step_index(&mut self, index: usize) {
        self.current_step_index = index;
    }
}
