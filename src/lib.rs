//! Praktor - chat gateway for containerized agent workers
//!
//! Multiplexes a single chat channel onto a fleet of isolated worker
//! containers, with:
//! - Per-agent worker lifecycle and message routing over an embedded bus
//! - Scheduled tasks (cron / interval / one-shot) injected as messages
//! - Swarms: transient DAGs of cooperating workers with collab chat
//! - A passphrase-derived AEAD vault for worker secrets
//! - Hot configuration reload with granular diff-and-apply

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use domain::{GatewayError, GatewayResult};
pub use services::Gateway;
