//! gattlink CLI library
//!
//! Command-line front-end for gattlink device sessions: argument parsing,
//! layered configuration, and the handlers that drive a session and render
//! its snapshots and events.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{AppConfig, CliOverrides};
pub use error::{CliError, Result};
