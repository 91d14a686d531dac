//! Persisted scheduled tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::Schedule;

/// Status of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Outcome of the most recent fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunStatus {
    Success,
    Error,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// A persisted scheduled task. The scheduler injects `prompt` as a
/// synthetic message for `agent_id` whenever `next_run_at` comes due.
///
/// Invariant: `next_run_at` is `None` iff the task is finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: Uuid,
    pub agent_id: String,
    pub name: String,
    pub schedule: Schedule,
    pub prompt: String,
    pub status: TaskStatus,
    pub last_status: Option<TaskRunStatus>,
    pub last_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Create a new active task with its first fire time computed.
    pub fn new(
        agent_id: impl Into<String>,
        name: impl Into<String>,
        schedule: Schedule,
        prompt: impl Into<String>,
    ) -> crate::domain::GatewayResult<Self> {
        let now = Utc::now();
        let next_run_at = schedule.next_run(now)?;
        Ok(Self {
            id: Uuid::new_v4(),
            agent_id: agent_id.into(),
            name: name.into(),
            schedule,
            prompt: prompt.into(),
            status: TaskStatus::Active,
            last_status: None,
            last_error: None,
            last_run_at: None,
            next_run_at,
            created_at: now,
            updated_at: now,
        })
    }
}
