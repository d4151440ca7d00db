//! Ports and their side-effecting adapters.

pub mod actuator;
pub mod bridge;
pub mod config;
pub mod driver;
pub mod init;
pub mod planner;
pub mod process;
pub mod prompt;
pub mod store;
