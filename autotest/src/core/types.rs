//! Shared deterministic types for the execution core.
//!
//! These types define stable contracts between the engine and its ports. Planner
//! payloads are schema-less JSON in practice, so the kinds below are closed sets
//! of known variants with an `Other` fallback, and plans keep any unrecognised
//! fields verbatim in `extra` without interpreting them.

use std::fmt;
use std::hash::{DefaultHasher, Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Test case header as loaded from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One human-authored unit of a test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub order: u32,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub expected_result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// Login credentials for the application under test.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub id: String,
    #[serde(alias = "email")]
    pub username: String,
    pub password: String,
    pub web_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("web_url", &self.web_url)
            .field("name", &self.name)
            .finish()
    }
}

/// Kind of atomic UI action proposed by the planner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionKind {
    Click,
    Fill,
    Select,
    Check,
    Press,
    Hover,
    Navigate,
    Wait,
    Verify,
    /// Unrecognised kind, kept verbatim.
    Other(String),
}

impl ActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Fill => "fill",
            ActionKind::Select => "select",
            ActionKind::Check => "check",
            ActionKind::Press => "press",
            ActionKind::Hover => "hover",
            ActionKind::Navigate => "navigate",
            ActionKind::Wait => "wait",
            ActionKind::Verify => "verify",
            ActionKind::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for ActionKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "click" => ActionKind::Click,
            "fill" | "type" => ActionKind::Fill,
            "select" => ActionKind::Select,
            "check" => ActionKind::Check,
            "press" => ActionKind::Press,
            "hover" => ActionKind::Hover,
            "navigate" | "goto" => ActionKind::Navigate,
            "wait" => ActionKind::Wait,
            "verify" => ActionKind::Verify,
            _ => ActionKind::Other(raw),
        }
    }
}

impl From<ActionKind> for String {
    fn from(kind: ActionKind) -> Self {
        match kind {
            ActionKind::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of post-condition attached to a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CheckKind {
    /// No verification requested.
    #[default]
    None,
    UrlContains,
    ElementVisible,
    ElementNotVisible,
    TextVisible,
    Other(String),
}

impl CheckKind {
    pub fn as_str(&self) -> &str {
        match self {
            CheckKind::None => "none",
            CheckKind::UrlContains => "url_contains",
            CheckKind::ElementVisible => "element_visible",
            CheckKind::ElementNotVisible => "element_not_visible",
            CheckKind::TextVisible => "text_visible",
            CheckKind::Other(raw) => raw.as_str(),
        }
    }

    /// True when the engine knows how to re-check this condition against the page.
    pub fn is_checkable(&self) -> bool {
        matches!(
            self,
            CheckKind::UrlContains
                | CheckKind::ElementVisible
                | CheckKind::ElementNotVisible
                | CheckKind::TextVisible
        )
    }
}

impl From<String> for CheckKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "none" => CheckKind::None,
            "url_contains" => CheckKind::UrlContains,
            "element_visible" => CheckKind::ElementVisible,
            "element_not_visible" | "element_hidden" => CheckKind::ElementNotVisible,
            "text_visible" | "text_present" => CheckKind::TextVisible,
            _ => CheckKind::Other(raw),
        }
    }
}

impl From<CheckKind> for String {
    fn from(kind: CheckKind) -> Self {
        match kind {
            CheckKind::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

/// Element addressed by a plan. Selectors are tried in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    #[serde(default)]
    pub primary_selector: String,
    #[serde(default, alias = "backup_selectors")]
    pub fallback_selectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Target {
    pub fn selector(selector: impl Into<String>) -> Self {
        Self {
            primary_selector: selector.into(),
            ..Self::default()
        }
    }

    /// Primary selector followed by fallbacks, skipping blanks.
    pub fn candidates(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.primary_selector.as_str())
            .chain(self.fallback_selectors.iter().map(String::as_str))
            .filter(|s| !s.trim().is_empty())
    }
}

/// Post-condition the plan claims will hold once the action ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default, alias = "check_type", alias = "type")]
    pub check_kind: CheckKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, alias = "expected", skip_serializing_if = "Option::is_none")]
    pub expected_value: Option<String>,
}

/// One atomic UI action proposed by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(alias = "substep_description")]
    pub description: String,
    #[serde(alias = "action_type")]
    pub action_kind: ActionKind,
    #[serde(default, alias = "target_element")]
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_value: Option<String>,
    #[serde(default)]
    pub verification: Verification,
    #[serde(default, alias = "is_final_substep")]
    pub is_final: bool,
    /// Fields the planner sent that the engine does not interpret.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Plan {
    pub fn new(description: impl Into<String>, action_kind: ActionKind, target: Target) -> Self {
        Self {
            description: description.into(),
            action_kind,
            target,
            action_value: None,
            verification: Verification::default(),
            is_final: false,
            extra: Map::new(),
        }
    }
}

/// Outcome of executing one plan against the live session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub page_url_after: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intermediate_progress: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_validated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_reason: Option<String>,
    /// Upgraded to success by the post-action re-check.
    #[serde(default)]
    pub reverified: bool,
    /// Flipped to success by a confident validation verdict. Set at most once.
    #[serde(default)]
    pub overridden: bool,
}

impl ExecResult {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn failed(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Page fingerprint used purely for equality comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub fingerprint: u64,
    pub captured_at: DateTime<Utc>,
}

impl PageSnapshot {
    pub fn new(url: impl Into<String>, fingerprint: u64) -> Self {
        Self {
            url: url.into(),
            fingerprint,
            captured_at: Utc::now(),
        }
    }

    /// Fingerprint a page body.
    pub fn from_content(url: impl Into<String>, content: &str) -> Self {
        let mut hasher = DefaultHasher::new();
        content.hash(&mut hasher);
        Self::new(url, hasher.finish())
    }

    /// Same URL and content, ignoring capture time.
    pub fn same_page(&self, other: &PageSnapshot) -> bool {
        self.url == other.url && self.fingerprint == other.fingerprint
    }
}

/// Full observation handed to the planner. The core never inspects `context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageState {
    pub snapshot: PageSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub context: Value,
}

impl PageState {
    pub fn url(&self) -> &str {
        &self.snapshot.url
    }
}

/// Completion verdict from the planner's validation capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub is_completed: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub evidence: String,
}

/// Next move in the login sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LoginActionKind {
    EnterEmail,
    EnterPassword,
    ClickNext,
    ClickSubmit,
    WaitForRedirect,
    Completed,
    Error,
    Other(String),
}

impl LoginActionKind {
    pub fn as_str(&self) -> &str {
        match self {
            LoginActionKind::EnterEmail => "enter_email",
            LoginActionKind::EnterPassword => "enter_password",
            LoginActionKind::ClickNext => "click_next",
            LoginActionKind::ClickSubmit => "click_submit",
            LoginActionKind::WaitForRedirect => "wait_for_redirect",
            LoginActionKind::Completed => "completed",
            LoginActionKind::Error => "error",
            LoginActionKind::Other(raw) => raw.as_str(),
        }
    }
}

impl From<String> for LoginActionKind {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "enter_email" | "enter_username" => LoginActionKind::EnterEmail,
            "enter_password" => LoginActionKind::EnterPassword,
            "click_next" => LoginActionKind::ClickNext,
            "click_submit" => LoginActionKind::ClickSubmit,
            "wait_for_redirect" => LoginActionKind::WaitForRedirect,
            "completed" => LoginActionKind::Completed,
            "error" => LoginActionKind::Error,
            _ => LoginActionKind::Other(raw),
        }
    }
}

impl From<LoginActionKind> for String {
    fn from(kind: LoginActionKind) -> Self {
        match kind {
            LoginActionKind::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginAction {
    #[serde(alias = "action_type")]
    pub kind: LoginActionKind,
    #[serde(default)]
    pub target: Option<Target>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginVerdict {
    pub is_logged_in: bool,
    pub confidence: f64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub evidence: String,
}

/// What the login sub-protocol has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginProgress {
    pub email_entered: bool,
    pub password_entered: bool,
    pub attempts: u32,
    pub current_url: String,
}

/// Lifecycle status of one run. `Passed`, `Failed` and `Error` are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    /// Every step was walked; awaiting finalisation.
    Completed,
    Passed,
    Failed,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed | RunStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
            RunStatus::Error => "error",
        }
    }
}

/// Why a step was advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvanceReason {
    /// Confident validation verdict said the step is complete.
    Validated,
    /// A plan marked final executed successfully (no confident verdict).
    FinalSubstepSucceeded,
    /// Handled by authentication.
    LoginStep,
    SubstepCeiling,
    PageUnchanged,
    RepeatedFailures,
    LowConfidence,
    DuplicatePattern,
}

impl AdvanceReason {
    /// True when the step goal was actually confirmed rather than given up on.
    pub fn is_confirmed(self) -> bool {
        matches!(
            self,
            AdvanceReason::Validated | AdvanceReason::FinalSubstepSucceeded | AdvanceReason::LoginStep
        )
    }
}

/// Why a run stopped looping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum FinishReason {
    /// Status already final or no steps left.
    Done,
    /// Run-level consecutive failure limit reached.
    CircuitBreaker,
    /// Internal bookkeeping is inconsistent; the run must end in `error`.
    InvariantViolation(String),
}

/// Verdict of the decision engine for one cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    ContinueSubstep,
    AdvanceStep(AdvanceReason),
    FinishRun(FinishReason),
}

/// Handle returned for something written to the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RecordId {
    Stored(String),
    /// Synthesised in memory because the store write failed.
    Placeholder(String),
}

impl RecordId {
    pub fn as_str(&self) -> &str {
        match self {
            RecordId::Stored(id) | RecordId::Placeholder(id) => id,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, RecordId::Placeholder(_))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One executed-and-recorded plan within a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstepResult {
    pub step_index: usize,
    pub substep_index: u32,
    pub substep_id: RecordId,
    pub description: String,
    pub action_kind: ActionKind,
    pub is_final: bool,
    pub result: ExecResult,
}

/// How a step left the loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_index: usize,
    pub step_id: String,
    pub reason: AdvanceReason,
    pub substeps: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plan_parses_legacy_field_names_and_keeps_unknown_fields() {
        let raw = json!({
            "substep_description": "Click the login button",
            "action_type": "click",
            "target_element": {
                "primary_selector": "#login",
                "backup_selectors": ["text=Login"]
            },
            "verification": {"check_type": "url_contains", "expected": "/home"},
            "is_final_substep": true,
            "reasoning": "button is visible"
        });

        let plan: Plan = serde_json::from_value(raw).expect("parse plan");
        assert_eq!(plan.action_kind, ActionKind::Click);
        assert_eq!(plan.target.fallback_selectors, vec!["text=Login".to_string()]);
        assert_eq!(plan.verification.check_kind, CheckKind::UrlContains);
        assert_eq!(plan.verification.expected_value.as_deref(), Some("/home"));
        assert!(plan.is_final);
        assert_eq!(plan.extra.get("reasoning"), Some(&json!("button is visible")));
    }

    #[test]
    fn unknown_action_kind_round_trips_verbatim() {
        let raw = json!({"description": "drag it", "action_kind": "drag_and_drop"});
        let plan: Plan = serde_json::from_value(raw).expect("parse plan");
        assert_eq!(
            plan.action_kind,
            ActionKind::Other("drag_and_drop".to_string())
        );
        let back = serde_json::to_value(&plan).expect("serialize");
        assert_eq!(back["action_kind"], json!("drag_and_drop"));
    }

    #[test]
    fn snapshots_compare_by_url_and_fingerprint_only() {
        let a = PageSnapshot::from_content("/a", "<body>1</body>");
        let b = PageSnapshot::from_content("/a", "<body>1</body>");
        let c = PageSnapshot::from_content("/b", "<body>1</body>");
        assert!(a.same_page(&b));
        assert!(!a.same_page(&c));
    }

    #[test]
    fn credentials_debug_redacts_password() {
        let creds = Credentials {
            id: "c1".to_string(),
            username: "qa@example.com".to_string(),
            password: "hunter2".to_string(),
            web_url: "https://app.example.com".to_string(),
            name: None,
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("REDACTED"));
    }

    #[test]
    fn target_candidates_skip_blank_selectors() {
        let target = Target {
            primary_selector: " ".to_string(),
            fallback_selectors: vec!["#a".to_string(), String::new(), "#b".to_string()],
            description: None,
        };
        let got: Vec<&str> = target.candidates().collect();
        assert_eq!(got, vec!["#a", "#b"]);
    }
}
