//! Conversation sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maps an agent to its current conversation token.
///
/// Cleared by explicit reset or container stop; preserved in the store so
/// the next input re-spawns a fresh worker with the same memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub agent_id: String,
    pub session_id: String,
    pub last_seen: DateTime<Utc>,
}

impl Session {
    pub fn fresh(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_id: Uuid::new_v4().to_string(),
            last_seen: Utc::now(),
        }
    }
}
