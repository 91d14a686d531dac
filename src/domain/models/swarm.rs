//! Persisted swarm runs: a transient DAG of cooperating workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One agent slot in a swarm, addressed by role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmAgent {
    /// Registry agent id the worker is derived from.
    pub agent_id: String,
    /// Unique role within the swarm.
    pub role: String,
    #[serde(default)]
    pub workspace: Option<String>,
    /// Role-specific prompt appended to the swarm task.
    #[serde(default)]
    pub prompt: String,
}

/// A directed (or bidirectional) edge between two roles.
///
/// Bidirectional synapses form collab groups; members share a chat topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Synapse {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub bidirectional: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwarmStatus {
    Running,
    Completed,
    Failed,
}

impl SwarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleStatus {
    Success,
    Error,
}

/// Outcome of a single role's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleResult {
    pub role: String,
    pub status: RoleStatus,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RoleResult {
    pub fn success(role: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            status: RoleStatus::Success,
            output: output.into(),
            error: None,
        }
    }

    pub fn error(role: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            status: RoleStatus::Error,
            output: String::new(),
            error: Some(reason.into()),
        }
    }
}

/// A persisted swarm run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmRun {
    pub id: Uuid,
    pub name: String,
    /// Role whose output is the swarm's final answer; always placed in
    /// the last tier.
    pub lead_agent: Option<String>,
    /// The user task all roles work on.
    pub task: String,
    pub agents: Vec<SwarmAgent>,
    pub synapses: Vec<Synapse>,
    pub status: SwarmStatus,
    pub results: Vec<RoleResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SwarmRun {
    pub fn new(
        name: impl Into<String>,
        task: impl Into<String>,
        agents: Vec<SwarmAgent>,
        synapses: Vec<Synapse>,
        lead_agent: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            lead_agent,
            task: task.into(),
            agents,
            synapses,
            status: SwarmStatus::Running,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Short id used in worker names and event subjects.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }
}
