//! Autonomous functional-test execution engine.
//!
//! A test case is a list of human-written steps. For each step the engine
//! repeatedly observes the browser, asks a planner for one atomic action,
//! executes it, asks the planner whether the step goal now holds, and lets a
//! pure decision function choose between another substep, the next step, or
//! the end of the run.
//!
//! - **[`core`]**: Pure, deterministic logic (run state, decision rules,
//!   detectors, guards). No I/O, fully testable in isolation.
//! - **[`io`]**: Ports and adapters (planner process, browser driver and its
//!   worker bridge, file store, config, prompts).
//!
//! [`engine`] sequences the two; [`auth`] runs the login sub-protocol and
//! [`report`] summarises a finished run.

pub mod auth;
pub mod core;
pub mod engine;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod report;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
