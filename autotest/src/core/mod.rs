//! Deterministic, pure logic for the execution engine.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! run state and return deterministic outputs suitable for tests.

pub mod budget;
pub mod decision;
pub mod duplicate;
pub mod guard;
pub mod invariants;
pub mod ledger;
pub mod state;
pub mod stuck;
pub mod types;
pub mod verify;
