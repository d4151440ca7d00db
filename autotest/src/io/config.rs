//! Engine configuration stored under `.autotest/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::decision::{DecisionPolicy, DuplicatePolicy};
use crate::core::duplicate::DuplicateRules;
use crate::core::guard::{DEFAULT_DESTRUCTIVE_KEYWORDS, KeywordPolicy};
use crate::core::state::WindowLimits;

/// Engine configuration (TOML).
///
/// Intended to be edited by humans. Missing fields default to the values the
/// engine was tuned with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Hard ceiling on substeps before a step is force-advanced.
    pub max_substeps_per_step: u32,

    /// Whole-run wall-clock budget in seconds.
    pub run_timeout_secs: u64,

    /// Take a screenshot after every substep.
    pub capture_evidence: bool,

    pub decision: DecisionConfig,
    pub stuck: StuckConfig,
    pub duplicates: DuplicateConfig,
    pub guard: GuardConfig,
    pub auth: AuthConfig,
    pub planner: PlannerConfig,
    pub driver: DriverConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionConfig {
    pub confidence_threshold: f64,
    pub low_confidence: f64,
    pub circuit_breaker_failures: u32,
    pub step_failure_limit: u32,
    pub low_confidence_failure_limit: u32,
    pub no_change_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StuckConfig {
    pub history_capacity: usize,
    pub threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DuplicateConfig {
    pub window: usize,
    pub similarity: f64,
    pub escalation: usize,
    pub policy: DuplicatePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GuardConfig {
    /// Plans mentioning any of these are treated as session teardown.
    pub destructive_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub max_attempts: u32,
    pub confidence_threshold: f64,
    /// Mark a login-like first step completed after a successful login.
    pub skip_login_step: bool,
    pub login_step_keywords: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Command that reads a prompt on stdin and prints JSON on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub prompt_budget_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Browser driver process speaking one JSON line per request.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    pub dir: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_substeps_per_step: 10,
            run_timeout_secs: 30 * 60,
            capture_evidence: true,
            decision: DecisionConfig::default(),
            stuck: StuckConfig::default(),
            duplicates: DuplicateConfig::default(),
            guard: GuardConfig::default(),
            auth: AuthConfig::default(),
            planner: PlannerConfig::default(),
            driver: DriverConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            low_confidence: 0.6,
            circuit_breaker_failures: 5,
            step_failure_limit: 3,
            low_confidence_failure_limit: 2,
            no_change_limit: 3,
        }
    }
}

impl Default for StuckConfig {
    fn default() -> Self {
        Self {
            history_capacity: 5,
            threshold: 3,
        }
    }
}

impl Default for DuplicateConfig {
    fn default() -> Self {
        Self {
            window: 3,
            similarity: 0.8,
            escalation: 2,
            policy: DuplicatePolicy::Annotate,
        }
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            destructive_keywords: DEFAULT_DESTRUCTIVE_KEYWORDS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            confidence_threshold: 0.7,
            skip_login_step: true,
            login_step_keywords: ["login", "log in", "sign in", "đăng nhập"]
                .iter()
                .map(|k| k.to_string())
                .collect(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 120,
            output_limit_bytes: 200_000,
            prompt_budget_bytes: 60_000,
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: vec!["autotest-driver".to_string()],
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: ".autotest".to_string(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_substeps_per_step == 0 {
            return Err(anyhow!("max_substeps_per_step must be > 0"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        let d = &self.decision;
        unit_interval("decision.confidence_threshold", d.confidence_threshold)?;
        unit_interval("decision.low_confidence", d.low_confidence)?;
        if d.circuit_breaker_failures == 0 || d.step_failure_limit == 0 || d.no_change_limit == 0 {
            return Err(anyhow!("decision limits must be > 0"));
        }
        if self.stuck.threshold < 2 {
            return Err(anyhow!("stuck.threshold must be >= 2"));
        }
        if self.stuck.history_capacity < self.stuck.threshold {
            return Err(anyhow!("stuck.history_capacity must be >= stuck.threshold"));
        }
        if self.duplicates.window == 0 {
            return Err(anyhow!("duplicates.window must be > 0"));
        }
        unit_interval("duplicates.similarity", self.duplicates.similarity)?;
        if self.auth.max_attempts == 0 {
            return Err(anyhow!("auth.max_attempts must be > 0"));
        }
        unit_interval("auth.confidence_threshold", self.auth.confidence_threshold)?;
        if self.planner.timeout_secs == 0 {
            return Err(anyhow!("planner.timeout_secs must be > 0"));
        }
        if self.planner.output_limit_bytes == 0 || self.planner.prompt_budget_bytes == 0 {
            return Err(anyhow!("planner byte limits must be > 0"));
        }
        non_empty_command("planner.command", &self.planner.command)?;
        non_empty_command("driver.command", &self.driver.command)?;
        if self.store.dir.trim().is_empty() {
            return Err(anyhow!("store.dir must not be empty"));
        }
        Ok(())
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        let d = &self.decision;
        DecisionPolicy {
            max_substeps_per_step: self.max_substeps_per_step,
            confidence_threshold: d.confidence_threshold,
            low_confidence: d.low_confidence,
            circuit_breaker_failures: d.circuit_breaker_failures,
            step_failure_limit: d.step_failure_limit,
            low_confidence_failure_limit: d.low_confidence_failure_limit,
            no_change_limit: d.no_change_limit,
            duplicate_policy: self.duplicates.policy,
        }
    }

    pub fn duplicate_rules(&self) -> DuplicateRules {
        DuplicateRules {
            window: self.duplicates.window,
            similarity: self.duplicates.similarity,
            escalation: self.duplicates.escalation,
        }
    }

    pub fn window_limits(&self) -> WindowLimits {
        WindowLimits {
            history_capacity: self.stuck.history_capacity,
            stuck_threshold: self.stuck.threshold,
        }
    }

    pub fn keyword_policy(&self) -> KeywordPolicy {
        KeywordPolicy::new(&self.guard.destructive_keywords)
    }
}

fn unit_interval(name: &str, value: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(anyhow!("{name} must be within [0, 1], got {value}"));
    }
    Ok(())
}

fn non_empty_command(name: &str, command: &[String]) -> Result<()> {
    match command.first() {
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("{name} must be a non-empty array")),
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn write_then_load_preserves_settings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = EngineConfig::default();
        cfg.duplicates.policy = DuplicatePolicy::ForceAdvance;
        cfg.guard.destructive_keywords = vec!["delete account".to_string()];
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_substeps_per_step = 4\n[duplicates]\npolicy = \"force_advance\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_substeps_per_step, 4);
        assert_eq!(cfg.duplicates.policy, DuplicatePolicy::ForceAdvance);
        assert_eq!(cfg.duplicates.window, 3);
        assert_eq!(cfg.decision_policy().max_substeps_per_step, 4);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = EngineConfig::default();
        cfg.decision.confidence_threshold = 1.5;
        let err = cfg.validate().expect_err("must reject");
        assert!(err.to_string().contains("decision.confidence_threshold"));
    }

    #[test]
    fn rejects_window_smaller_than_stuck_threshold() {
        let mut cfg = EngineConfig::default();
        cfg.stuck.history_capacity = 2;
        assert!(cfg.validate().is_err());
    }
}
