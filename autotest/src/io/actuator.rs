//! Actuator port and the synchronous driver it wraps.
//!
//! [`Driver`] is the blocking browser-automation surface. It owns one OS-level
//! session and must never be called from two threads at once. [`Actuator`] is
//! the same surface as seen by the async engine; the production implementation
//! is [`ActuatorBridge`](crate::io::bridge::ActuatorBridge), which runs a
//! driver on its own worker thread.

use anyhow::Result;
use async_trait::async_trait;

use crate::core::types::{ExecResult, PageSnapshot, PageState, Plan, Verification};

/// Blocking browser driver.
///
/// Action failures (selector not found, timeouts) come back as
/// `Ok(ExecResult { success: false, .. })`. `Err` is reserved for the driver
/// itself being broken.
pub trait Driver: Send + 'static {
    fn start_session(&mut self) -> Result<()>;

    fn stop_session(&mut self) -> Result<()>;

    fn has_session(&self) -> bool;

    fn navigate(&mut self, url: &str) -> Result<ExecResult>;

    /// Resolve `primary_selector`, then each fallback in order, and act on the
    /// first element found.
    fn execute(&mut self, plan: &Plan) -> Result<ExecResult>;

    fn snapshot(&mut self) -> Result<PageSnapshot>;

    fn page_state(&mut self) -> Result<PageState>;

    /// PNG bytes of the current viewport.
    fn screenshot(&mut self) -> Result<Vec<u8>>;

    /// Evaluate a verification clause against the current page.
    fn check(&mut self, verification: &Verification) -> Result<bool>;
}

/// Async view of a driver session. Calls for one session are totally ordered.
#[async_trait]
pub trait Actuator: Send + Sync {
    async fn start_session(&self) -> Result<()>;

    async fn stop_session(&self) -> Result<()>;

    async fn navigate(&self, url: &str) -> Result<ExecResult>;

    async fn execute(&self, plan: &Plan) -> Result<ExecResult>;

    async fn snapshot(&self) -> Result<PageSnapshot>;

    async fn page_state(&self) -> Result<PageState>;

    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn check(&self, verification: &Verification) -> Result<bool>;
}
