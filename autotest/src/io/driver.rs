//! Browser driver backed by a long-lived helper process.
//!
//! One request line in, one response line out, over the child's stdin and
//! stdout:
//!
//! ```text
//! -> {"op":"execute","plan":{...}}
//! <- {"ok":true,"result":{"success":false,"message":"...","error":"..."}}
//! ```
//!
//! `ok: false` means the helper could not serve the request at all. Action
//! failures are `ok: true` with an unsuccessful result. Pages come back as raw
//! content; fingerprints are computed here. Screenshots are written by the
//! helper to a path we choose and read back.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{ExecResult, PageSnapshot, PageState, Plan, Verification};
use crate::io::actuator::Driver;
use crate::io::config::DriverConfig;
use crate::io::process::wait_or_kill;
use crate::io::store::new_record_id;

/// Grace period for the helper to exit after `stop`.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Start,
    Navigate { url: &'a str },
    Execute { plan: &'a Plan },
    Snapshot,
    PageState,
    Screenshot { path: &'a Path },
    Check { verification: &'a Verification },
    Stop,
}

impl Request<'_> {
    fn op(&self) -> &'static str {
        match self {
            Request::Start => "start",
            Request::Navigate { .. } => "navigate",
            Request::Execute { .. } => "execute",
            Request::Snapshot => "snapshot",
            Request::PageState => "page_state",
            Request::Screenshot { .. } => "screenshot",
            Request::Check { .. } => "check",
            Request::Stop => "stop",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Response {
    ok: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSnapshot {
    url: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct RawPage {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    context: Value,
}

struct Session {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// [`Driver`] speaking the line protocol to `driver.command`.
pub struct ProcessDriver {
    command: Vec<String>,
    scratch_dir: PathBuf,
    session: Option<Session>,
}

impl std::fmt::Debug for ProcessDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDriver")
            .field("command", &self.command)
            .field("session", &self.session.is_some())
            .finish()
    }
}

impl ProcessDriver {
    pub fn new(config: &DriverConfig) -> Self {
        Self {
            command: config.command.clone(),
            scratch_dir: std::env::temp_dir(),
            session: None,
        }
    }

    /// Directory for screenshot hand-off files.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    fn call<T: DeserializeOwned>(&mut self, request: &Request<'_>) -> Result<T> {
        let op = request.op();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("driver {op}: no open session"))?;

        let mut line = serde_json::to_string(request).context("serialize driver request")?;
        line.push('\n');
        session
            .stdin
            .write_all(line.as_bytes())
            .and_then(|()| session.stdin.flush())
            .with_context(|| format!("driver {op}: write request"))?;

        let mut reply = String::new();
        let n = session
            .stdout
            .read_line(&mut reply)
            .with_context(|| format!("driver {op}: read response"))?;
        if n == 0 {
            bail!("driver {op}: helper process closed its output");
        }
        let response: Response = serde_json::from_str(reply.trim())
            .with_context(|| format!("driver {op}: parse response"))?;
        if !response.ok {
            let error = response.error.unwrap_or_else(|| "unknown error".to_string());
            bail!("driver {op}: {error}");
        }
        debug!(op, "driver call ok");
        serde_json::from_value(response.result)
            .with_context(|| format!("driver {op}: unexpected result shape"))
    }
}

impl Driver for ProcessDriver {
    #[instrument(skip_all)]
    fn start_session(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("driver command is empty"))?;
        let program = program.clone();
        let mut child = Command::new(&program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn driver {program}"))?;
        let stdin = child.stdin.take().context("driver stdin not piped")?;
        let stdout = child.stdout.take().context("driver stdout not piped")?;
        self.session = Some(Session {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        });

        if let Err(err) = self.call::<()>(&Request::Start) {
            self.stop_session().ok();
            return Err(err);
        }
        info!(program = %program, "driver session started");
        Ok(())
    }

    fn stop_session(&mut self) -> Result<()> {
        if self.session.is_none() {
            return Ok(());
        }
        if let Err(err) = self.call::<()>(&Request::Stop) {
            debug!(err = %format!("{err:#}"), "driver did not acknowledge stop");
        }
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        let Session {
            mut child, stdin, ..
        } = session;
        drop(stdin);
        let (status, killed) = wait_or_kill(&mut child, STOP_TIMEOUT)?;
        if killed || !status.success() {
            warn!(%status, killed, "driver exited uncleanly");
        }
        Ok(())
    }

    fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn navigate(&mut self, url: &str) -> Result<ExecResult> {
        self.call(&Request::Navigate { url })
    }

    fn execute(&mut self, plan: &Plan) -> Result<ExecResult> {
        self.call(&Request::Execute { plan })
    }

    fn snapshot(&mut self) -> Result<PageSnapshot> {
        let raw: RawSnapshot = self.call(&Request::Snapshot)?;
        Ok(PageSnapshot::from_content(raw.url, &raw.content))
    }

    fn page_state(&mut self) -> Result<PageState> {
        let raw: RawPage = self.call(&Request::PageState)?;
        Ok(PageState {
            snapshot: PageSnapshot::from_content(raw.url, &raw.content),
            title: raw.title,
            context: raw.context,
        })
    }

    fn screenshot(&mut self) -> Result<Vec<u8>> {
        let path = self
            .scratch_dir
            .join(format!("{}.png", new_record_id("autotest-shot")));
        self.call::<()>(&Request::Screenshot { path: &path })?;
        let png = std::fs::read(&path)
            .with_context(|| format!("read screenshot {}", path.display()))?;
        if let Err(err) = std::fs::remove_file(&path) {
            debug!(err = %err, "could not remove screenshot hand-off file");
        }
        Ok(png)
    }

    fn check(&mut self, verification: &Verification) -> Result<bool> {
        self.call(&Request::Check { verification })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::types::{ActionKind, CheckKind, Target};

    /// A helper that answers by pattern-matching the request line.
    const FAKE_HELPER: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"op":"page_state"'*)
      echo '{"ok":true,"result":{"url":"https://a.test/","title":"A","content":"<p>hi</p>","context":{"n":1}}}' ;;
    *'"op":"snapshot"'*)
      echo '{"ok":true,"result":{"url":"https://a.test/","content":"<p>hi</p>"}}' ;;
    *'"op":"execute"'*)
      echo '{"ok":true,"result":{"success":false,"message":"no element","error":"Timeout 5000ms exceeded"}}' ;;
    *'"op":"check"'*)
      echo '{"ok":false,"error":"check not supported"}' ;;
    *'"op":"stop"'*)
      echo '{"ok":true,"result":null}'; exit 0 ;;
    *)
      echo '{"ok":true,"result":null}' ;;
  esac
done
"#;

    fn driver() -> ProcessDriver {
        ProcessDriver::new(&DriverConfig {
            command: vec!["sh".to_string(), "-c".to_string(), FAKE_HELPER.to_string()],
        })
    }

    #[test]
    fn session_round_trip_over_line_protocol() {
        let mut driver = driver();
        driver.start_session().expect("start");
        assert!(driver.has_session());

        let page = driver.page_state().expect("page state");
        assert_eq!(page.url(), "https://a.test/");
        assert_eq!(page.title.as_deref(), Some("A"));
        let snapshot = driver.snapshot().expect("snapshot");
        assert!(snapshot.same_page(&page.snapshot));

        let plan = Plan::new("Click save", ActionKind::Click, Target::selector("#save"));
        let result = driver.execute(&plan).expect("execute");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Timeout 5000ms exceeded"));

        driver.stop_session().expect("stop");
        assert!(!driver.has_session());
    }

    #[test]
    fn helper_errors_surface_as_err() {
        let mut driver = driver();
        driver.start_session().expect("start");
        let verification = Verification {
            check_kind: CheckKind::TextVisible,
            selector: None,
            expected_value: Some("Saved".to_string()),
        };
        let err = driver.check(&verification).expect_err("must fail");
        assert!(format!("{err:#}").contains("check not supported"));
        driver.stop_session().expect("stop");
    }

    #[test]
    fn calls_without_session_fail() {
        let mut driver = driver();
        let err = driver.page_state().expect_err("no session");
        assert!(err.to_string().contains("no open session"));
        driver.stop_session().expect("stop without session is a no-op");
    }
}
