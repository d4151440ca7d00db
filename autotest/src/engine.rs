//! The execution engine: one test case, one session, one loop.
//!
//! Each cycle runs `observe -> plan -> act -> validate -> decide` strictly in
//! that order. All run state lives in [`RunState`]; this module only sequences
//! the ports and feeds their outputs through the pure transitions in
//! [`crate::core`].

use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, instrument, warn};

use crate::auth::{authenticate, is_login_step};
use crate::core::budget::remaining_budget;
use crate::core::decision::decide;
use crate::core::duplicate::{DuplicateRules, check_duplicate};
use crate::core::guard::{DestructiveActionPolicy, Guarded, guard_plan};
use crate::core::invariants::validate_run_invariants;
use crate::core::state::RunState;
use crate::core::types::{
    AdvanceReason, Credentials, Decision, ExecResult, FinishReason, PageSnapshot, PageState, Plan,
    RecordId, RunStatus, Step, TestCase,
};
use crate::core::verify;
use crate::error::EngineError;
use crate::io::actuator::Actuator;
use crate::io::bridge::is_worker_gone;
use crate::io::config::EngineConfig;
use crate::io::planner::{HistoryEntry, PlanRequest, Planner, ValidateRequest};
use crate::io::store::{ResultRecord, ResultScope, Store, SubstepRecord, new_record_id};
use crate::report::{AuthOutcome, RunReport};

/// Prior substeps shown to the planner.
const HISTORY_TAIL: usize = 3;

/// Await `call`, giving up with [`EngineError::Timeout`] once the run deadline
/// passes.
pub(crate) async fn within_budget<F: Future>(
    deadline: Instant,
    call: F,
) -> Result<F::Output, EngineError> {
    let remaining = remaining_budget(deadline)?;
    tokio::time::timeout(remaining, call)
        .await
        .map_err(|_| EngineError::Timeout)
}

/// Runs test cases against one actuator session.
///
/// The actuator is owned by this engine and must not be shared with another
/// run. Planner and store are stateless and may be shared.
pub struct Engine<P, A, S> {
    planner: P,
    actuator: A,
    store: S,
    config: EngineConfig,
    guard: Box<dyn DestructiveActionPolicy>,
}

/// Per-run bookkeeping that is not part of the decision state.
#[derive(Debug, Default)]
struct RunContext {
    degraded_writes: usize,
}

impl RunContext {
    /// Turn a store handle into a record id, substituting a placeholder when
    /// the write did not land.
    fn settle(&mut self, kind: &str, handle: Option<String>) -> RecordId {
        match handle {
            Some(id) => RecordId::Stored(id),
            None => {
                self.degraded_writes += 1;
                let id = new_record_id(&format!("local-{kind}"));
                warn!(kind, placeholder = %id, "store unavailable, continuing with placeholder");
                RecordId::Placeholder(id)
            }
        }
    }
}

impl<P, A, S> Engine<P, A, S>
where
    P: Planner,
    A: Actuator,
    S: Store,
{
    pub fn new(planner: P, actuator: A, store: S, config: EngineConfig) -> Self {
        let guard = Box::new(config.keyword_policy());
        Self {
            planner,
            actuator,
            store,
            config,
            guard,
        }
    }

    /// Replace the destructive-action policy built from config.
    pub fn with_guard(mut self, guard: impl DestructiveActionPolicy + 'static) -> Self {
        self.guard = Box::new(guard);
        self
    }

    /// Give back the actuator, e.g. to shut its worker down.
    pub fn into_actuator(self) -> A {
        self.actuator
    }

    /// Execute one test case end to end.
    ///
    /// Never returns an error: fatal conditions end up as `status = error` with
    /// the first message in the report.
    #[instrument(skip_all, fields(case = %test_case_id, credentials = %credentials_id))]
    pub async fn run(&self, test_case_id: &str, credentials_id: &str) -> RunReport {
        let started_at = Utc::now();
        let limits = self.config.window_limits();

        let (case, steps, creds) = match self.load(test_case_id, credentials_id).await {
            Ok(loaded) => loaded,
            Err(err) => {
                error!(err = %err, "setup failed");
                let mut state = RunState::new(test_case_id, credentials_id, Vec::new(), limits);
                state.fail(err.to_string());
                state.finalize();
                return RunReport::from_state(&state, None, AuthOutcome::NotAttempted, 0, started_at);
            }
        };
        let name = (!case.name.is_empty()).then(|| case.name.clone());
        let mut state = RunState::new(test_case_id, credentials_id, steps, limits);
        let mut ctx = RunContext::default();

        if let Err(err) = self.actuator.start_session().await {
            let err = EngineError::actuator(err);
            error!(err = %err, "could not open session");
            state.fail(err.to_string());
            state.finalize();
            return RunReport::from_state(&state, name, AuthOutcome::NotAttempted, 0, started_at);
        }
        info!(steps = state.steps().len(), "session open");

        let deadline = Instant::now() + Duration::from_secs(self.config.run_timeout_secs);
        let mut auth = AuthOutcome::NotAttempted;
        if let Err(err) = self
            .drive(&mut state, &creds, &mut auth, &mut ctx, deadline)
            .await
        {
            error!(err = %err, step = state.current_step_index(), "run aborted");
            state.fail(err.to_string());
        }

        if let Err(err) = self.actuator.stop_session().await {
            warn!(err = %format!("{err:#}"), "failed to stop session");
        }
        let status = state.finalize();
        info!(status = status.as_str(), "run finished");

        let record = ResultRecord {
            test_case_id: test_case_id.to_string(),
            scope: ResultScope::Run { status },
            passed: status == RunStatus::Passed,
            message: state.error_message().unwrap_or_default().to_string(),
            screenshot_id: None,
            recorded_at: Utc::now(),
        };
        ctx.settle("result", self.store.create_result(&record).await);

        RunReport::from_state(&state, name, auth, ctx.degraded_writes, started_at)
    }

    async fn load(
        &self,
        test_case_id: &str,
        credentials_id: &str,
    ) -> Result<(TestCase, Vec<Step>, Credentials), EngineError> {
        let case = self
            .store
            .get_test_case(test_case_id)
            .await
            .map_err(|err| EngineError::setup(format!("load test case {test_case_id}: {err:#}")))?
            .ok_or_else(|| EngineError::setup(format!("test case {test_case_id} not found")))?;
        let steps = self
            .store
            .get_steps(test_case_id)
            .await
            .map_err(|err| EngineError::setup(format!("load steps of {test_case_id}: {err:#}")))?;
        if steps.is_empty() {
            return Err(EngineError::setup(format!(
                "test case {test_case_id} has no steps"
            )));
        }
        let creds = self
            .store
            .get_credentials(credentials_id)
            .await
            .map_err(|err| EngineError::setup(format!("load credentials {credentials_id}: {err:#}")))?
            .ok_or_else(|| EngineError::setup(format!("credentials {credentials_id} not found")))?;
        Ok((case, steps, creds))
    }

    async fn drive(
        &self,
        state: &mut RunState,
        creds: &Credentials,
        auth: &mut AuthOutcome,
        ctx: &mut RunContext,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        *auth = authenticate(
            &self.planner,
            &self.actuator,
            creds,
            &self.config.auth,
            deadline,
        )
        .await?;

        let logged_in = matches!(auth, AuthOutcome::LoggedIn { .. });
        let keywords = &self.config.auth.login_step_keywords;
        if logged_in
            && self.config.auth.skip_login_step
            && state.current_step().is_some_and(|s| is_login_step(s, keywords))
        {
            info!("first step is the login just performed, marking it completed");
            self.advance(state, ctx, AdvanceReason::LoginStep).await?;
        }

        let policy = self.config.decision_policy();
        let rules = self.config.duplicate_rules();
        loop {
            if state.current_step().is_none() || state.status().is_terminal() {
                return Ok(());
            }
            remaining_budget(deadline)?;
            // The ceiling is checked before planning so a step never runs more
            // than `max_substeps_per_step` substeps.
            if state.current_substep_index() >= policy.max_substeps_per_step {
                warn!(
                    step = state.current_step_index(),
                    substeps = state.current_substep_index(),
                    "substep ceiling reached"
                );
                self.advance(state, ctx, AdvanceReason::SubstepCeiling).await?;
                continue;
            }
            self.cycle(state, ctx, &rules, deadline).await?;

            let decision = decide(state, &policy);
            let violations = validate_run_invariants(state);
            if !violations.is_empty() {
                return Err(EngineError::InvariantViolation(violations.join("; ")));
            }
            debug!(
                step = state.current_step_index(),
                substep = state.current_substep_index(),
                decision = ?decision,
                "decided"
            );
            match decision {
                Decision::ContinueSubstep => state.continue_substep(),
                Decision::AdvanceStep(reason) => self.advance(state, ctx, reason).await?,
                Decision::FinishRun(FinishReason::Done) => return Ok(()),
                Decision::FinishRun(FinishReason::CircuitBreaker) => {
                    let failures = state.ledger().consecutive_failures();
                    warn!(failures, "circuit breaker tripped");
                    state.halt(format!("stopped after {failures} consecutive failures"));
                    return Ok(());
                }
                Decision::FinishRun(FinishReason::InvariantViolation(message)) => {
                    return Err(EngineError::InvariantViolation(message));
                }
            }
        }
    }

    /// One observe/plan/act/validate pass for the current substep.
    #[instrument(skip_all, fields(step = state.current_step_index(), substep = state.current_substep_index()))]
    async fn cycle(
        &self,
        state: &mut RunState,
        ctx: &mut RunContext,
        rules: &DuplicateRules,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        // Observing
        let page = self.observe_page(deadline).await?;
        if state.observe(page.snapshot.clone()) {
            debug!(url = %page.url(), "page unchanged across recent observations");
        }

        // Planning
        state
            .ensure_plannable()
            .map_err(EngineError::InvariantViolation)?;
        let step = state
            .current_step()
            .cloned()
            .ok_or_else(|| EngineError::InvariantViolation("no current step to plan".into()))?;
        let request = PlanRequest {
            step: step.clone(),
            step_index: state.current_step_index(),
            total_steps: state.steps().len(),
            substep_index: state.current_substep_index(),
            max_substeps: self.config.max_substeps_per_step,
            page,
            history: history_tail(state),
            stuck: state.is_stuck(),
            duplicate: state.duplicate(),
            last_validation: state.last_validation().cloned(),
        };
        let plan = within_budget(deadline, self.planner.plan(&request))
            .await?
            .map_err(EngineError::planner)?;

        let duplicate = check_duplicate(&plan, state.plan_history(), rules);
        if duplicate.is_duplicate() {
            info!(
                matches = duplicate.matches,
                pattern = duplicate.pattern,
                "planner repeated a recent plan"
            );
        }
        let plan = match guard_plan(plan, &step, self.guard.as_ref()) {
            Guarded::Unchanged(plan) => plan,
            Guarded::Downgraded { original, plan } => {
                warn!(original = %original, "session-ending plan replaced by a final verification");
                plan
            }
        };
        state.record_plan(plan.clone(), duplicate);

        let substep = SubstepRecord {
            test_case_id: state.test_case_id().to_string(),
            step_id: step.id.clone(),
            step_index: state.current_step_index(),
            substep_index: state.current_substep_index(),
            description: plan.description.clone(),
            created_at: Utc::now(),
        };
        let substep_id = ctx.settle("substep", self.store.create_substep(&substep).await);
        ctx.settle(
            "action",
            self.store.create_action(substep_id.as_str(), &plan).await,
        );

        // Acting
        let before_evidence = state
            .last_result_for_step()
            .and_then(|r| r.result.screenshot_ref.clone());
        let mut result = self.act(&plan, deadline).await?;
        if self.config.capture_evidence {
            result.screenshot_ref = self.capture(ctx, &substep_id, deadline).await?;
        }
        info!(
            action = plan.action_kind.as_str(),
            success = result.success,
            "substep executed"
        );
        let after_evidence = result.screenshot_ref.clone();
        state.record_result(substep_id, &plan, result);

        // Validating
        let page = self.observe_page(deadline).await?;
        let request = ValidateRequest {
            step_goal: step.action.clone(),
            expected: step.expected_result.clone(),
            page: page.clone(),
            history: history_tail(state),
            before_evidence,
            after_evidence,
        };
        match within_budget(deadline, self.planner.validate(&request)).await? {
            Ok(verdict) => {
                debug!(
                    completed = verdict.is_completed,
                    confidence = verdict.confidence,
                    "validation verdict"
                );
                let threshold = self.config.decision.confidence_threshold;
                if state.apply_validation(verdict, page.snapshot, threshold) {
                    info!("failed action overridden by confident validation");
                }
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "validation unavailable, using mechanical result");
                state.record_validation_failure(
                    page.snapshot,
                    format!("validation unavailable: {err:#}"),
                );
            }
        }

        if let Some(record) = substep_result_record(state) {
            ctx.settle("result", self.store.create_result(&record).await);
        }
        Ok(())
    }

    /// Execute a plan and re-check its own verification when it failed.
    async fn act(&self, plan: &Plan, deadline: Instant) -> Result<ExecResult, EngineError> {
        let mut result = match within_budget(deadline, self.actuator.execute(plan)).await? {
            Ok(result) => result,
            Err(err) if is_worker_gone(&err) => return Err(EngineError::actuator(err)),
            Err(err) => ExecResult::failed("action could not be executed", format!("{err:#}")),
        };
        if result.success || !plan.verification.check_kind.is_checkable() {
            return Ok(result);
        }
        match within_budget(deadline, self.actuator.check(&plan.verification)).await? {
            Ok(holds) => {
                if verify::reverify(&mut result, holds) {
                    info!(
                        check = plan.verification.check_kind.as_str(),
                        "verification holds after reported failure"
                    );
                }
            }
            Err(err) if is_worker_gone(&err) => return Err(EngineError::actuator(err)),
            Err(err) => debug!(err = %format!("{err:#}"), "re-verification failed"),
        }
        Ok(result)
    }

    async fn capture(
        &self,
        ctx: &mut RunContext,
        substep_id: &RecordId,
        deadline: Instant,
    ) -> Result<Option<String>, EngineError> {
        match within_budget(deadline, self.actuator.screenshot()).await? {
            Ok(png) => {
                let id = ctx.settle(
                    "screenshot",
                    self.store.create_screenshot(substep_id.as_str(), &png).await,
                );
                Ok(Some(id.as_str().to_string()))
            }
            Err(err) if is_worker_gone(&err) => Err(EngineError::actuator(err)),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "screenshot failed");
                Ok(None)
            }
        }
    }

    /// Current page, or a placeholder observation when the driver could not
    /// describe it.
    async fn observe_page(&self, deadline: Instant) -> Result<PageState, EngineError> {
        match within_budget(deadline, self.actuator.page_state()).await? {
            Ok(page) => Ok(page),
            Err(err) if is_worker_gone(&err) => Err(EngineError::actuator(err)),
            Err(err) => {
                let message = format!("{err:#}");
                warn!(err = %message, "page observation failed");
                Ok(PageState {
                    snapshot: PageSnapshot::from_content("", &message),
                    title: None,
                    context: json!({ "observation_error": message }),
                })
            }
        }
    }

    async fn advance(
        &self,
        state: &mut RunState,
        ctx: &mut RunContext,
        reason: AdvanceReason,
    ) -> Result<(), EngineError> {
        let step_id = state
            .current_step()
            .map(|s| s.id.clone())
            .unwrap_or_default();
        state
            .advance_step(reason)
            .map_err(EngineError::InvariantViolation)?;
        info!(step = %step_id, reason = ?reason, "step advanced");

        let record = ResultRecord {
            test_case_id: state.test_case_id().to_string(),
            scope: ResultScope::Step {
                step_id: step_id.clone(),
                reason,
            },
            passed: reason.is_confirmed(),
            message: format!("step {step_id} advanced: {reason:?}"),
            screenshot_id: None,
            recorded_at: Utc::now(),
        };
        ctx.settle("result", self.store.create_result(&record).await);
        Ok(())
    }
}

fn history_tail(state: &RunState) -> Vec<HistoryEntry> {
    let results: Vec<_> = state
        .results_for_step(state.current_step_index())
        .collect();
    let start = results.len().saturating_sub(HISTORY_TAIL);
    results[start..]
        .iter()
        .map(|r| HistoryEntry::from_result(r))
        .collect()
}

fn substep_result_record(state: &RunState) -> Option<ResultRecord> {
    let last = state.last_result_for_step()?;
    let message = match &last.result.validation_reason {
        Some(reason) => format!("{} [{reason}]", last.result.message),
        None => last.result.message.clone(),
    };
    Some(ResultRecord {
        test_case_id: state.test_case_id().to_string(),
        scope: ResultScope::Substep {
            substep_id: last.substep_id.as_str().to_string(),
        },
        passed: last.result.success,
        message,
        screenshot_id: last.result.screenshot_ref.clone(),
        recorded_at: Utc::now(),
    })
}
