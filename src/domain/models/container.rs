//! Runtime view of a worker container.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    Starting,
    Running,
    Stopping,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

/// A worker container owned by the container manager.
///
/// At most one exists per `agent_id`; the orchestrator holds exclusive
/// creation and teardown authority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub container_id: String,
    pub agent_id: String,
    /// Canonical Docker name (`praktor-agent-{agent_id}`).
    pub name: String,
    pub status: ContainerStatus,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Opaque conversation token the worker uses for memory.
    pub session_id: String,
}

impl ContainerInfo {
    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }

    /// Whether `last_activity_at + idle_timeout` has passed.
    pub fn is_idle(&self, idle_timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        let deadline = self.last_activity_at
            + chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::zero());
        deadline < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn info(last_activity_at: DateTime<Utc>) -> ContainerInfo {
        ContainerInfo {
            container_id: "c1".into(),
            agent_id: "a".into(),
            name: "praktor-agent-a".into(),
            status: ContainerStatus::Running,
            started_at: last_activity_at,
            last_activity_at,
            session_id: "s".into(),
        }
    }

    #[test]
    fn idle_when_past_deadline() {
        let now = Utc::now();
        let stale = info(now - chrono::Duration::minutes(20));
        assert!(stale.is_idle(Duration::from_secs(600), now));

        let fresh = info(now - chrono::Duration::minutes(5));
        assert!(!fresh.is_idle(Duration::from_secs(600), now));
    }
}
