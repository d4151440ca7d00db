//! Run-level error taxonomy.
//!
//! Only these errors stop a run. Transient action failures are values on
//! [`ExecResult`](crate::core::types::ExecResult) and never show up here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing test case, steps or credentials.
    #[error("setup failed: {0}")]
    Setup(String),

    /// Bookkeeping is inconsistent. Never retried.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("planner error: {0}")]
    Planner(String),

    /// The actuator worker is gone or the session could not be opened.
    #[error("actuator error: {0}")]
    Actuator(String),

    #[error("run timed out")]
    Timeout,
}

impl EngineError {
    pub fn setup(message: impl Into<String>) -> Self {
        EngineError::Setup(message.into())
    }

    pub fn planner(err: impl std::fmt::Display) -> Self {
        EngineError::Planner(format!("{err:#}"))
    }

    pub fn actuator(err: impl std::fmt::Display) -> Self {
        EngineError::Actuator(format!("{err:#}"))
    }
}
