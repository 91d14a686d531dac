//! CLI interface module
//!
//! Command definitions and the handlers behind each subcommand.

pub mod commands;
pub mod types;

pub use types::{Cli, Commands, VaultCommands};
