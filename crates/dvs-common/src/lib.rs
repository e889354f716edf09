//! Shared building blocks for the virtual-switch test harness.
//!
//! - **Polling**: the bounded-retry `poll` primitive every wait goes through
//! - **Execution**: the `CommandRunner` process boundary and its host implementation
//! - **Errors**: the `DvsError` taxonomy used across the workspace
//! - **Options**: fixture parameters resolved from TOML and the environment

pub mod config;
pub mod error;
pub mod exec;
pub mod logging;
pub mod poll;

pub mod test_util;

pub use config::FixtureOptions;
pub use error::{DvsError, Result};
pub use exec::{CmdOutput, CommandRunner, HostRunner};
pub use poll::{poll, wait_for_condition, wait_for_result, PollingConfig};
