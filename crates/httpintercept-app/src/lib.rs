//! HTTP Intercept - command-line service wrapper.
//!
//! This crate provides the pieces of the `httpintercept` binary that are worth
//! testing on their own:
//!
//! - Argument parsing and config file loading ([`cli`])
//! - Canned responses from a JSON file, reloaded on `SIGHUP` ([`scenario`])

pub mod cli;
pub mod scenario;

pub use cli::{load_config_file, Args, CaCommand, Command, ServeArgs};
pub use scenario::{CannedHandler, CannedResponse, ResponseFileScenario, ResponseSet};
