//! SQLite-backed keyed store.
//!
//! The core treats persistence as a keyed store with the minimum schema
//! it requires: agents, tasks, secrets, swarm runs, sessions, messages.

pub mod agent_repo;
pub mod connection;
pub mod message_repo;
pub mod secret_repo;
pub mod session_repo;
pub mod swarm_repo;
pub mod task_repo;

pub use agent_repo::AgentRepo;
pub use connection::StoreConnection;
pub use message_repo::MessageRepo;
pub use secret_repo::SecretRepo;
pub use session_repo::SessionRepo;
pub use swarm_repo::SwarmRepo;
pub use task_repo::TaskRepo;

use chrono::{DateTime, Utc};

use crate::domain::errors::{GatewayError, GatewayResult};

/// Parse an RFC3339 timestamp column.
pub(crate) fn parse_datetime(s: &str) -> GatewayResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GatewayError::Store(format!("bad timestamp '{s}': {e}")))
}

/// Render a timestamp for storage.
pub(crate) fn fmt_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
