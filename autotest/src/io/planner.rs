//! Planner port and the command-backed adapter.
//!
//! The [`Planner`] trait decouples the engine from the planning backend (an
//! LLM CLI in production). Tests use scripted planners that return
//! predetermined plans without spawning processes.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use jsonschema::Draft;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::duplicate::DuplicateCheck;
use crate::core::types::{
    LoginAction, LoginProgress, LoginVerdict, PageState, Plan, Step, SubstepResult,
    ValidationVerdict,
};
use crate::io::config::PlannerConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt::PromptBuilder;

const PLAN_SCHEMA: &str = include_str!("../../schemas/plan.schema.json");
const VERDICT_SCHEMA: &str = include_str!("../../schemas/verdict.schema.json");
const LOGIN_ACTION_SCHEMA: &str = include_str!("../../schemas/login_action.schema.json");
const LOGIN_VERDICT_SCHEMA: &str = include_str!("../../schemas/login_verdict.schema.json");

/// One prior substep as shown to the planner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub substep: u32,
    pub description: String,
    pub action_kind: String,
    pub success: bool,
    pub message: String,
    pub hint: Option<String>,
    pub intermediate_progress: Option<String>,
}

impl HistoryEntry {
    pub fn from_result(result: &SubstepResult) -> Self {
        let exec = &result.result;
        let message = exec
            .error
            .clone()
            .unwrap_or_else(|| exec.message.clone());
        Self {
            substep: result.substep_index + 1,
            description: result.description.clone(),
            action_kind: result.action_kind.to_string(),
            success: exec.success,
            hint: (!exec.success)
                .then(|| exec.error.as_deref().and_then(error_hint))
                .flatten()
                .map(str::to_string),
            message,
            intermediate_progress: exec.intermediate_progress.clone(),
        }
    }
}

/// Translate a driver error into advice the planner can act on.
pub fn error_hint(error: &str) -> Option<&'static str> {
    let lower = error.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        Some("element was not found in time; try another selector")
    } else if lower.contains("invalid selector") || lower.contains("syntaxerror") {
        Some("selector syntax was rejected; use a simpler CSS or text selector")
    } else if lower.contains("not visible") || lower.contains("hidden") {
        Some("element exists but is not visible; open its container or scroll to it first")
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub step: Step,
    pub step_index: usize,
    pub total_steps: usize,
    pub substep_index: u32,
    pub max_substeps: u32,
    pub page: PageState,
    pub history: Vec<HistoryEntry>,
    pub stuck: bool,
    pub duplicate: DuplicateCheck,
    pub last_validation: Option<ValidationVerdict>,
}

#[derive(Debug, Clone)]
pub struct ValidateRequest {
    pub step_goal: String,
    pub expected: String,
    pub page: PageState,
    pub history: Vec<HistoryEntry>,
    pub before_evidence: Option<String>,
    pub after_evidence: Option<String>,
}

/// Carries the username only. The engine types the password itself.
#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub username: String,
    pub progress: LoginProgress,
    pub max_attempts: u32,
    pub page: PageState,
}

#[derive(Debug, Clone)]
pub struct LoginCheckRequest {
    pub page: PageState,
    pub initial_url: String,
    pub current_url: String,
}

/// Planning and validation capability.
///
/// Every call is request/response. A malformed response is an error for that
/// call and is not retried here.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan>;

    async fn validate(&self, request: &ValidateRequest) -> Result<ValidationVerdict>;

    async fn plan_login(&self, request: &LoginRequest) -> Result<LoginAction>;

    async fn validate_login(&self, request: &LoginCheckRequest) -> Result<LoginVerdict>;
}

#[async_trait]
impl<P: Planner + ?Sized> Planner for Arc<P> {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        (**self).plan(request).await
    }

    async fn validate(&self, request: &ValidateRequest) -> Result<ValidationVerdict> {
        (**self).validate(request).await
    }

    async fn plan_login(&self, request: &LoginRequest) -> Result<LoginAction> {
        (**self).plan_login(request).await
    }

    async fn validate_login(&self, request: &LoginCheckRequest) -> Result<LoginVerdict> {
        (**self).validate_login(request).await
    }
}

/// Planner that pipes a rendered prompt into an external command and reads
/// one JSON object back from its stdout.
pub struct CommandPlanner {
    command: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    prompts: PromptBuilder,
}

impl CommandPlanner {
    pub fn new(config: &PlannerConfig) -> Result<Self> {
        if config.command.is_empty() {
            bail!("planner command must not be empty");
        }
        Ok(Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            output_limit_bytes: config.output_limit_bytes,
            prompts: PromptBuilder::new(config.prompt_budget_bytes)?,
        })
    }

    #[instrument(skip_all, fields(kind = kind, prompt_bytes = prompt.len()))]
    async fn call<T: DeserializeOwned>(
        &self,
        kind: &'static str,
        prompt: String,
        schema: &'static str,
    ) -> Result<T> {
        let command = self.command.clone();
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;

        let output = tokio::task::spawn_blocking(move || {
            let mut cmd = Command::new(&command[0]);
            cmd.args(&command[1..]);
            run_command_with_timeout(cmd, Some(prompt.as_bytes()), timeout, limit)
        })
        .await
        .context("planner worker panicked")?
        .with_context(|| format!("run planner for {kind}"))?;

        if output.timed_out {
            bail!("planner timed out after {timeout:?}");
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "planner command failed");
            bail!(
                "planner exited with status {:?}: {}",
                output.status.code(),
                output.stderr_tail()
            );
        }

        let value = last_json_object(&output.stdout_lossy())
            .ok_or_else(|| anyhow!("planner output for {kind} contained no JSON object"))?;
        validate_schema(&value, schema).with_context(|| format!("planner output for {kind}"))?;
        let parsed = serde_json::from_value(value)
            .with_context(|| format!("decode planner output for {kind}"))?;
        debug!(kind, "planner call succeeded");
        Ok(parsed)
    }
}

#[async_trait]
impl Planner for CommandPlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<Plan> {
        let prompt = self.prompts.plan(request)?;
        self.call("plan", prompt, PLAN_SCHEMA).await
    }

    async fn validate(&self, request: &ValidateRequest) -> Result<ValidationVerdict> {
        let prompt = self.prompts.validate(request)?;
        self.call("validate", prompt, VERDICT_SCHEMA).await
    }

    async fn plan_login(&self, request: &LoginRequest) -> Result<LoginAction> {
        let prompt = self.prompts.login(request)?;
        self.call("login", prompt, LOGIN_ACTION_SCHEMA).await
    }

    async fn validate_login(&self, request: &LoginCheckRequest) -> Result<LoginVerdict> {
        let prompt = self.prompts.login_check(request)?;
        self.call("login_validate", prompt, LOGIN_VERDICT_SCHEMA).await
    }
}

/// Find the last top-level JSON object in free-form text.
pub fn last_json_object(text: &str) -> Option<Value> {
    let mut found = None;
    let mut pos = 0;
    while let Some(offset) = text[pos..].find('{') {
        let start = pos + offset;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value @ Value::Object(_))) => {
                found = Some(value);
                pos = start + stream.byte_offset();
            }
            _ => pos = start + 1,
        }
    }
    found
}

/// Validate JSON against an embedded JSON Schema (Draft 2020-12).
fn validate_schema(instance: &Value, schema_raw: &str) -> Result<()> {
    let schema: Value = serde_json::from_str(schema_raw).context("parse json schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("schema validation failed:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
