//! Store port and the file-backed adapter.
//!
//! Reads surface errors. Create calls never fail the caller: a write that does
//! not land returns `None`, and the engine substitutes an in-memory
//! placeholder so the run can continue without persistence.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{AdvanceReason, Credentials, Plan, RunStatus, Step, TestCase};
use crate::io::init::StorePaths;

/// A substep about to be executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubstepRecord {
    pub test_case_id: String,
    pub step_id: String,
    pub step_index: usize,
    pub substep_index: u32,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// What a result record is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ResultScope {
    Substep { substep_id: String },
    Step { step_id: String, reason: AdvanceReason },
    Run { status: RunStatus },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub test_case_id: String,
    #[serde(flatten)]
    pub scope: ResultScope,
    pub passed: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Durable record of test definitions and execution artifacts.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_test_case(&self, id: &str) -> Result<Option<TestCase>>;

    /// Steps of a test case ordered by `order`. Empty when the case is unknown.
    async fn get_steps(&self, test_case_id: &str) -> Result<Vec<Step>>;

    async fn get_credentials(&self, id: &str) -> Result<Option<Credentials>>;

    async fn create_substep(&self, record: &SubstepRecord) -> Option<String>;

    async fn create_action(&self, substep_id: &str, plan: &Plan) -> Option<String>;

    async fn create_screenshot(&self, substep_id: &str, png: &[u8]) -> Option<String>;

    async fn create_result(&self, record: &ResultRecord) -> Option<String>;

    async fn get_action(&self, substep_id: &str) -> Result<Option<Plan>>;
}

#[async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get_test_case(&self, id: &str) -> Result<Option<TestCase>> {
        (**self).get_test_case(id).await
    }

    async fn get_steps(&self, test_case_id: &str) -> Result<Vec<Step>> {
        (**self).get_steps(test_case_id).await
    }

    async fn get_credentials(&self, id: &str) -> Result<Option<Credentials>> {
        (**self).get_credentials(id).await
    }

    async fn create_substep(&self, record: &SubstepRecord) -> Option<String> {
        (**self).create_substep(record).await
    }

    async fn create_action(&self, substep_id: &str, plan: &Plan) -> Option<String> {
        (**self).create_action(substep_id, plan).await
    }

    async fn create_screenshot(&self, substep_id: &str, png: &[u8]) -> Option<String> {
        (**self).create_screenshot(substep_id, png).await
    }

    async fn create_result(&self, record: &ResultRecord) -> Option<String> {
        (**self).create_result(record).await
    }

    async fn get_action(&self, substep_id: &str) -> Result<Option<Plan>> {
        (**self).get_action(substep_id).await
    }
}

/// Random record identifier of the form `<kind>-<16 hex digits>`.
pub fn new_record_id(kind: &str) -> String {
    format!("{kind}-{:016x}", rand::random::<u64>())
}

/// Test case file: header fields plus `[[steps]]`.
#[derive(Debug, Deserialize)]
struct CaseFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    steps: Vec<Step>,
}

#[derive(Debug, Serialize)]
struct ActionFile<'a> {
    substep_id: &'a str,
    plan: &'a Plan,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct StoredAction {
    plan: Plan,
}

#[derive(Debug, Serialize)]
struct ScreenshotMeta<'a> {
    substep_id: &'a str,
    file: String,
    created_at: DateTime<Utc>,
}

/// Store backed by a directory of TOML definitions and JSON records.
#[derive(Debug, Clone)]
pub struct FileStore {
    paths: StorePaths,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: StorePaths::new(root),
        }
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    async fn read_case(&self, id: &str) -> Result<Option<CaseFile>> {
        let Some(raw) = read_optional(&self.paths.case_path(id)).await? else {
            return Ok(None);
        };
        let case: CaseFile =
            toml::from_str(&raw).with_context(|| format!("parse test case {id}"))?;
        Ok(Some(case))
    }

    async fn write_json<T: Serialize + ?Sized>(dir: &Path, id: &str, value: &T) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create directory {}", dir.display()))?;
        let mut buf = serde_json::to_string_pretty(value).context("serialize record")?;
        buf.push('\n');
        let path = dir.join(format!("{id}.json"));
        tokio::fs::write(&path, buf)
            .await
            .with_context(|| format!("write {}", path.display()))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn get_test_case(&self, id: &str) -> Result<Option<TestCase>> {
        Ok(self.read_case(id).await?.map(|case| TestCase {
            id: case.id,
            name: case.name,
            description: case.description,
        }))
    }

    async fn get_steps(&self, test_case_id: &str) -> Result<Vec<Step>> {
        let mut steps = self
            .read_case(test_case_id)
            .await?
            .map(|case| case.steps)
            .unwrap_or_default();
        steps.sort_by(|a, b| (a.order, &a.id).cmp(&(b.order, &b.id)));
        Ok(steps)
    }

    async fn get_credentials(&self, id: &str) -> Result<Option<Credentials>> {
        let Some(raw) = read_optional(&self.paths.credentials_path(id)).await? else {
            return Ok(None);
        };
        let creds = toml::from_str(&raw).with_context(|| format!("parse credentials {id}"))?;
        Ok(Some(creds))
    }

    async fn create_substep(&self, record: &SubstepRecord) -> Option<String> {
        let id = new_record_id("substep");
        let written = Self::write_json(&self.paths.substeps_dir, &id, record).await;
        settle("substep", id, written)
    }

    async fn create_action(&self, substep_id: &str, plan: &Plan) -> Option<String> {
        let file = ActionFile {
            substep_id,
            plan,
            created_at: Utc::now(),
        };
        // Actions are keyed by substep so `get_action` can find them.
        let written = Self::write_json(&self.paths.actions_dir, substep_id, &file).await;
        settle("action", format!("action-{substep_id}"), written)
    }

    async fn create_screenshot(&self, substep_id: &str, png: &[u8]) -> Option<String> {
        let id = new_record_id("screenshot");
        let dir = &self.paths.screenshots_dir;
        let written = async {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create directory {}", dir.display()))?;
            let file = format!("{id}.png");
            tokio::fs::write(dir.join(&file), png)
                .await
                .with_context(|| format!("write screenshot {file}"))?;
            let meta = ScreenshotMeta {
                substep_id,
                file,
                created_at: Utc::now(),
            };
            Self::write_json(dir, &id, &meta).await
        }
        .await;
        settle("screenshot", id, written)
    }

    async fn create_result(&self, record: &ResultRecord) -> Option<String> {
        let id = new_record_id("result");
        let written = Self::write_json(&self.paths.results_dir, &id, record).await;
        settle("result", id, written)
    }

    async fn get_action(&self, substep_id: &str) -> Result<Option<Plan>> {
        let path = self.paths.actions_dir.join(format!("{substep_id}.json"));
        let Some(raw) = read_optional(&path).await? else {
            return Ok(None);
        };
        let stored: StoredAction =
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(stored.plan))
    }
}

fn settle(kind: &str, id: String, written: Result<()>) -> Option<String> {
    match written {
        Ok(()) => {
            debug!(kind, id = %id, "record written");
            Some(id)
        }
        Err(err) => {
            warn!(kind, err = %format!("{err:#}"), "store write failed");
            None
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ActionKind, Target};
    use crate::io::init::{InitOptions, init_store};

    fn init(root: &Path) -> FileStore {
        init_store(root, &InitOptions { force: false }).expect("init");
        FileStore::new(root)
    }

    #[tokio::test]
    async fn reads_example_case_in_step_order() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = init(temp.path());

        let case = store
            .get_test_case("example")
            .await
            .expect("read")
            .expect("case exists");
        assert_eq!(case.name, "Update display name");

        let steps = store.get_steps("example").await.expect("steps");
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["example-1", "example-2"]);

        let creds = store
            .get_credentials("example")
            .await
            .expect("read")
            .expect("credentials exist");
        assert_eq!(creds.username, "qa@example.com");
    }

    #[tokio::test]
    async fn missing_records_read_as_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());
        assert!(store.get_test_case("nope").await.expect("read").is_none());
        assert!(store.get_steps("nope").await.expect("read").is_empty());
        assert!(store.get_credentials("nope").await.expect("read").is_none());
        assert!(store.get_action("nope").await.expect("read").is_none());
    }

    #[tokio::test]
    async fn stored_action_is_found_by_substep() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = init(temp.path());
        let record = SubstepRecord {
            test_case_id: "example".to_string(),
            step_id: "example-1".to_string(),
            step_index: 0,
            substep_index: 0,
            description: "Click login".to_string(),
            created_at: Utc::now(),
        };
        let substep_id = store.create_substep(&record).await.expect("substep id");
        assert!(substep_id.starts_with("substep-"));
        assert_eq!(substep_id.len(), "substep-".len() + 16);

        let plan = Plan::new("Click login", ActionKind::Click, Target::selector("#login"));
        store
            .create_action(&substep_id, &plan)
            .await
            .expect("action id");
        let loaded = store
            .get_action(&substep_id)
            .await
            .expect("read")
            .expect("action exists");
        assert_eq!(loaded, plan);
    }

    #[tokio::test]
    async fn failed_write_returns_no_handle() {
        let temp = tempfile::tempdir().expect("tempdir");
        // A regular file where the results directory should be.
        let root = temp.path();
        std::fs::write(root.join("results"), b"blocker").expect("write blocker");
        let store = FileStore::new(root);
        let record = ResultRecord {
            test_case_id: "c".to_string(),
            scope: ResultScope::Run {
                status: RunStatus::Passed,
            },
            passed: true,
            message: String::new(),
            screenshot_id: None,
            recorded_at: Utc::now(),
        };
        assert!(store.create_result(&record).await.is_none());
    }

    #[tokio::test]
    async fn screenshot_bytes_land_on_disk() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = init(temp.path());
        let id = store
            .create_screenshot("substep-1", b"\x89PNG")
            .await
            .expect("screenshot id");
        let png = store.paths().screenshots_dir.join(format!("{id}.png"));
        assert_eq!(std::fs::read(png).expect("read png"), b"\x89PNG");
    }
}
