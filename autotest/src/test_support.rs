//! Test doubles and builders shared by unit and integration tests.
//!
//! Scripted ports return predetermined values without spawning processes or
//! touching the filesystem. Each records what it was asked so tests can assert
//! on call order and request contents.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde_json::json;

use crate::core::types::{
    ActionKind, CheckKind, Credentials, ExecResult, LoginAction, LoginActionKind, LoginVerdict,
    PageSnapshot, PageState, Plan, Step, Target, TestCase, ValidationVerdict, Verification,
};
use crate::io::actuator::Driver;
use crate::io::planner::{LoginCheckRequest, LoginRequest, PlanRequest, Planner, ValidateRequest};
use crate::io::store::{ResultRecord, Store, SubstepRecord};

/// Create `n` steps with ids `step-0..` and distinct actions.
pub fn steps(n: usize) -> Vec<Step> {
    (0..n)
        .map(|i| step(i, &format!("Do thing {i}"), &format!("Thing {i} is done")))
        .collect()
}

pub fn step(index: usize, action: &str, expected: &str) -> Step {
    Step {
        id: format!("step-{index}"),
        order: index as u32 + 1,
        action: action.to_string(),
        expected_result: expected.to_string(),
        comment: None,
    }
}

pub fn test_case(id: &str) -> TestCase {
    TestCase {
        id: id.to_string(),
        name: format!("{id} name"),
        description: None,
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        id: "cred".to_string(),
        username: "qa@example.com".to_string(),
        password: "s3cret-pass".to_string(),
        web_url: "https://app.example.com/login".to_string(),
        name: None,
    }
}

pub fn click_plan(description: &str, selector: &str) -> Plan {
    Plan::new(description, ActionKind::Click, Target::selector(selector))
}

/// A click marked as the last substep of its step.
pub fn final_plan(description: &str, selector: &str) -> Plan {
    let mut plan = click_plan(description, selector);
    plan.is_final = true;
    plan
}

/// A click whose verification expects `selector` to be visible afterwards.
pub fn verified_plan(description: &str, selector: &str) -> Plan {
    let mut plan = click_plan(description, selector);
    plan.verification = Verification {
        check_kind: CheckKind::ElementVisible,
        selector: Some(selector.to_string()),
        expected_value: None,
    };
    plan
}

pub fn verdict(is_completed: bool, confidence: f64) -> ValidationVerdict {
    ValidationVerdict {
        is_completed,
        confidence,
        reason: format!("completed={is_completed}"),
        evidence: String::new(),
    }
}

pub fn login_action(kind: LoginActionKind, selector: Option<&str>) -> LoginAction {
    LoginAction {
        kind,
        target: selector.map(Target::selector),
        reason: "scripted".to_string(),
        confidence: 0.9,
    }
}

pub fn page(url: &str, fingerprint: u64) -> PageState {
    PageState {
        snapshot: PageSnapshot::new(url, fingerprint),
        title: Some("Scripted".to_string()),
        context: json!({ "elements": [] }),
    }
}

#[derive(Debug, Default)]
struct CallLogInner {
    calls: Vec<String>,
    active: usize,
    max_active: usize,
}

/// Ordered record of driver calls, shareable across threads.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<Mutex<CallLogInner>>,
}

impl CallLog {
    fn enter(&self, call: String) {
        let mut inner = self.inner.lock().expect("call log lock");
        inner.calls.push(call);
        inner.active += 1;
        inner.max_active = inner.max_active.max(inner.active);
    }

    fn exit(&self) {
        let mut inner = self.inner.lock().expect("call log lock");
        inner.active -= 1;
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().expect("call log lock").calls.clone()
    }

    /// Most calls ever in flight at once.
    pub fn max_concurrency(&self) -> usize {
        self.inner.lock().expect("call log lock").max_active
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.snapshot()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

/// Synchronous driver returning queued values, then defaults.
///
/// Defaults: every action succeeds, every check fails, and every observation
/// returns a new fingerprint on the same URL.
#[derive(Debug)]
pub struct ScriptedDriver {
    calls: CallLog,
    session: bool,
    fail_start: bool,
    results: VecDeque<Result<ExecResult, String>>,
    default_result: ExecResult,
    checks: VecDeque<bool>,
    pages: VecDeque<PageState>,
    static_page: Option<PageState>,
    observations: u64,
}

impl Default for ScriptedDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedDriver {
    pub fn new() -> Self {
        Self {
            calls: CallLog::default(),
            session: false,
            fail_start: false,
            results: VecDeque::new(),
            default_result: ExecResult::succeeded("ok"),
            checks: VecDeque::new(),
            pages: VecDeque::new(),
            static_page: None,
            observations: 0,
        }
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn with_results(mut self, results: impl IntoIterator<Item = ExecResult>) -> Self {
        self.results.extend(results.into_iter().map(Ok));
        self
    }

    /// Queue a driver-level error for the next `execute`.
    pub fn with_execute_error(mut self, message: &str) -> Self {
        self.results.push_back(Err(message.to_string()));
        self
    }

    /// Result returned once the queue is empty.
    pub fn with_default_result(mut self, result: ExecResult) -> Self {
        self.default_result = result;
        self
    }

    pub fn with_checks(mut self, checks: impl IntoIterator<Item = bool>) -> Self {
        self.checks.extend(checks);
        self
    }

    pub fn with_pages(mut self, pages: impl IntoIterator<Item = PageState>) -> Self {
        self.pages.extend(pages);
        self
    }

    /// Every observation returns the same page.
    pub fn with_static_page(mut self, url: &str) -> Self {
        self.static_page = Some(page(url, 7));
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    fn logged<R>(&self, call: String, f: impl FnOnce() -> R) -> R {
        self.calls.enter(call);
        let out = f();
        self.calls.exit();
        out
    }

    fn next_page(&mut self) -> PageState {
        self.observations += 1;
        if let Some(page) = self.pages.pop_front() {
            return page;
        }
        match &self.static_page {
            Some(page) => page.clone(),
            None => page("https://app.example.com/home", self.observations),
        }
    }
}

impl Driver for ScriptedDriver {
    fn start_session(&mut self) -> Result<()> {
        let fail = self.fail_start;
        self.logged("start_session".to_string(), || -> Result<()> {
            if fail {
                bail!("browser failed to launch");
            }
            Ok(())
        })?;
        self.session = true;
        Ok(())
    }

    fn stop_session(&mut self) -> Result<()> {
        self.logged("stop_session".to_string(), || ());
        self.session = false;
        Ok(())
    }

    fn has_session(&self) -> bool {
        self.session
    }

    fn navigate(&mut self, url: &str) -> Result<ExecResult> {
        self.logged(format!("navigate:{url}"), || ());
        Ok(ExecResult {
            page_url_after: url.to_string(),
            ..ExecResult::succeeded("navigated")
        })
    }

    fn execute(&mut self, plan: &Plan) -> Result<ExecResult> {
        let next = self.results.pop_front();
        let default = self.default_result.clone();
        self.logged(format!("execute:{}", plan.description), || match next {
            Some(Ok(result)) => Ok(result),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(default),
        })
    }

    fn snapshot(&mut self) -> Result<PageSnapshot> {
        let page = self.next_page();
        self.logged("snapshot".to_string(), || Ok(page.snapshot))
    }

    fn page_state(&mut self) -> Result<PageState> {
        let page = self.next_page();
        self.logged("page_state".to_string(), || Ok(page))
    }

    fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.logged("screenshot".to_string(), || Ok(b"\x89PNG scripted".to_vec()))
    }

    fn check(&mut self, verification: &Verification) -> Result<bool> {
        let holds = self.checks.pop_front().unwrap_or(false);
        self.logged(format!("check:{}", verification.check_kind.as_str()), || {
            Ok(holds)
        })
    }
}

/// Planner returning queued responses, then a repeating fallback.
///
/// Without a fallback, `plan` and `validate` fail once their queues run dry.
/// Login defaults to "completed" and a confident logged-in verdict.
#[derive(Debug, Default)]
pub struct ScriptedPlanner {
    plans: Mutex<VecDeque<Result<Plan, String>>>,
    repeat_plan: Option<Plan>,
    verdicts: Mutex<VecDeque<Result<ValidationVerdict, String>>>,
    repeat_verdict: Option<ValidationVerdict>,
    login_actions: Mutex<VecDeque<LoginAction>>,
    login_verdict: Option<LoginVerdict>,
    login_delay: Option<Duration>,
    plan_requests: Mutex<Vec<PlanRequest>>,
    login_requests: Mutex<Vec<LoginRequest>>,
    validations: AtomicU64,
}

impl ScriptedPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plans(self, plans: impl IntoIterator<Item = Plan>) -> Self {
        self.plans
            .lock()
            .expect("plans lock")
            .extend(plans.into_iter().map(Ok));
        self
    }

    pub fn with_plan_error(self, message: &str) -> Self {
        self.plans
            .lock()
            .expect("plans lock")
            .push_back(Err(message.to_string()));
        self
    }

    pub fn repeating_plan(mut self, plan: Plan) -> Self {
        self.repeat_plan = Some(plan);
        self
    }

    pub fn with_verdicts(self, verdicts: impl IntoIterator<Item = ValidationVerdict>) -> Self {
        self.verdicts
            .lock()
            .expect("verdicts lock")
            .extend(verdicts.into_iter().map(Ok));
        self
    }

    pub fn with_validation_error(self, message: &str) -> Self {
        self.verdicts
            .lock()
            .expect("verdicts lock")
            .push_back(Err(message.to_string()));
        self
    }

    pub fn repeating_verdict(mut self, verdict: ValidationVerdict) -> Self {
        self.repeat_verdict = Some(verdict);
        self
    }

    pub fn with_login_actions(self, actions: impl IntoIterator<Item = LoginAction>) -> Self {
        self.login_actions
            .lock()
            .expect("login lock")
            .extend(actions);
        self
    }

    pub fn with_login_verdict(mut self, verdict: LoginVerdict) -> Self {
        self.login_verdict = Some(verdict);
        self
    }

    /// Make every `plan_login` call take `delay`.
    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = Some(delay);
        self
    }

    pub fn plan_requests(&self) -> Vec<PlanRequest> {
        self.plan_requests.lock().expect("requests lock").clone()
    }

    pub fn login_requests(&self) -> Vec<LoginRequest> {
        self.login_requests.lock().expect("requests lock").clone()
    }

    pub fn validation_calls(&self) -> u64 {
        self.validations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        self.plan_requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.plans.lock().expect("plans lock").pop_front();
        match next {
            Some(Ok(plan)) => Ok(plan),
            Some(Err(message)) => Err(anyhow!(message)),
            None => self
                .repeat_plan
                .clone()
                .ok_or_else(|| anyhow!("no scripted plan left")),
        }
    }

    async fn validate(&self, _request: &ValidateRequest) -> Result<ValidationVerdict> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        let next = self.verdicts.lock().expect("verdicts lock").pop_front();
        match next {
            Some(Ok(verdict)) => Ok(verdict),
            Some(Err(message)) => Err(anyhow!(message)),
            None => self
                .repeat_verdict
                .clone()
                .ok_or_else(|| anyhow!("no scripted verdict left")),
        }
    }

    async fn plan_login(&self, request: &LoginRequest) -> Result<LoginAction> {
        self.login_requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(delay) = self.login_delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.login_actions.lock().expect("login lock").pop_front();
        Ok(next.unwrap_or_else(|| login_action(LoginActionKind::Completed, None)))
    }

    async fn validate_login(&self, _request: &LoginCheckRequest) -> Result<LoginVerdict> {
        Ok(self.login_verdict.clone().unwrap_or(LoginVerdict {
            is_logged_in: true,
            confidence: 0.9,
            reason: "dashboard visible".to_string(),
            evidence: String::new(),
        }))
    }
}

/// In-memory store with a switch that makes every create call fail.
#[derive(Debug, Default)]
pub struct MemoryStore {
    cases: Mutex<HashMap<String, (TestCase, Vec<Step>)>>,
    credentials: Mutex<HashMap<String, Credentials>>,
    fail_writes: AtomicBool,
    next_id: AtomicU64,
    substeps: Mutex<Vec<SubstepRecord>>,
    actions: Mutex<HashMap<String, Plan>>,
    screenshots: Mutex<Vec<String>>,
    results: Mutex<Vec<ResultRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_case(self, case: TestCase, steps: Vec<Step>) -> Self {
        self.cases
            .lock()
            .expect("cases lock")
            .insert(case.id.clone(), (case, steps));
        self
    }

    pub fn with_credentials(self, creds: Credentials) -> Self {
        self.credentials
            .lock()
            .expect("credentials lock")
            .insert(creds.id.clone(), creds);
        self
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn substeps(&self) -> Vec<SubstepRecord> {
        self.substeps.lock().expect("substeps lock").clone()
    }

    pub fn results(&self) -> Vec<ResultRecord> {
        self.results.lock().expect("results lock").clone()
    }

    pub fn screenshot_count(&self) -> usize {
        self.screenshots.lock().expect("screenshots lock").len()
    }

    fn next(&self, kind: &str) -> Option<String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return None;
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Some(format!("{kind}-{n}"))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_test_case(&self, id: &str) -> Result<Option<TestCase>> {
        let cases = self.cases.lock().expect("cases lock");
        Ok(cases.get(id).map(|(case, _)| case.clone()))
    }

    async fn get_steps(&self, test_case_id: &str) -> Result<Vec<Step>> {
        let cases = self.cases.lock().expect("cases lock");
        Ok(cases
            .get(test_case_id)
            .map(|(_, steps)| steps.clone())
            .unwrap_or_default())
    }

    async fn get_credentials(&self, id: &str) -> Result<Option<Credentials>> {
        Ok(self
            .credentials
            .lock()
            .expect("credentials lock")
            .get(id)
            .cloned())
    }

    async fn create_substep(&self, record: &SubstepRecord) -> Option<String> {
        let id = self.next("substep")?;
        self.substeps
            .lock()
            .expect("substeps lock")
            .push(record.clone());
        Some(id)
    }

    async fn create_action(&self, substep_id: &str, plan: &Plan) -> Option<String> {
        let id = self.next("action")?;
        self.actions
            .lock()
            .expect("actions lock")
            .insert(substep_id.to_string(), plan.clone());
        Some(id)
    }

    async fn create_screenshot(&self, substep_id: &str, _png: &[u8]) -> Option<String> {
        let id = self.next("screenshot")?;
        self.screenshots
            .lock()
            .expect("screenshots lock")
            .push(substep_id.to_string());
        Some(id)
    }

    async fn create_result(&self, record: &ResultRecord) -> Option<String> {
        let id = self.next("result")?;
        self.results
            .lock()
            .expect("results lock")
            .push(record.clone());
        Some(id)
    }

    async fn get_action(&self, substep_id: &str) -> Result<Option<Plan>> {
        Ok(self
            .actions
            .lock()
            .expect("actions lock")
            .get(substep_id)
            .cloned())
    }
}
