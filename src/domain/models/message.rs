//! Chat log rows (contract consumed by the web control surface).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of a logged message relative to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// One logged chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub agent_id: String,
    pub direction: MessageDirection,
    pub content: String,
    /// Caller-supplied correlation metadata, stored verbatim.
    pub meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(
        agent_id: impl Into<String>,
        direction: MessageDirection,
        content: impl Into<String>,
        meta: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            direction,
            content: content.into(),
            meta,
            created_at: Utc::now(),
        }
    }
}
