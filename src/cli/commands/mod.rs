//! Subcommand handlers.

pub mod backup;
pub mod vault;
