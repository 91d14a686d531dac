//! Bus subject grammar and wire payloads.
//!
//! The subject set is stable; producers must not collide subjects across
//! agents. Every payload is a JSON object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `agent.{id}.input` — user→worker prompts.
pub fn agent_input(agent_id: &str) -> String {
    format!("agent.{agent_id}.input")
}

/// `agent.{id}.output` — worker→host streamed output.
pub fn agent_output(agent_id: &str) -> String {
    format!("agent.{agent_id}.output")
}

/// `agent.{id}.control` — cancel/reset.
pub fn agent_control(agent_id: &str) -> String {
    format!("agent.{agent_id}.control")
}

/// `agent.{id}.route` — routing hints (request/reply).
pub fn agent_route(agent_id: &str) -> String {
    format!("agent.{agent_id}.route")
}

/// `host.ipc.{id}` — worker→host request/reply (tools).
pub fn host_ipc(agent_id: &str) -> String {
    format!("host.ipc.{agent_id}")
}

/// `swarm.{id}.chat.{gid}` — intra-swarm collab chat.
pub fn swarm_chat(swarm_id: &str, group_id: &str) -> String {
    format!("swarm.{swarm_id}.chat.{group_id}")
}

/// `events.agent.{id}` — orchestrator lifecycle events.
pub fn events_agent(agent_id: &str) -> String {
    format!("events.agent.{agent_id}")
}

/// `events.task.executed` — scheduler events.
pub const EVENTS_TASK_EXECUTED: &str = "events.task.executed";

/// `events.swarm.{id}` — swarm events.
pub fn events_swarm(swarm_id: &str) -> String {
    format!("events.swarm.{swarm_id}")
}

/// `events.secret.{action}` — vault lifecycle events.
pub fn events_secret(action: &str) -> String {
    format!("events.secret.{action}")
}

/// Prompt published to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputPayload {
    pub text: String,
    pub session_id: String,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Kind of a worker output frame. `Result` is terminal for the current
/// input turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Text,
    Result,
    Error,
}

/// Streamed worker output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputPayload {
    #[serde(rename = "type")]
    pub kind: OutputKind,
    pub content: String,
}

/// Control actions sent to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Cancel,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: ControlAction,
}

/// Worker→host tool request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Event envelope published on `events.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventPayload {
    pub fn new(kind: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Intra-swarm chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatPayload {
    pub from: String,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subjects_embed_ids() {
        assert_eq!(agent_input("coder"), "agent.coder.input");
        assert_eq!(agent_output("coder"), "agent.coder.output");
        assert_eq!(agent_control("coder"), "agent.coder.control");
        assert_eq!(host_ipc("coder"), "host.ipc.coder");
        assert_eq!(swarm_chat("abc123", "group-0"), "swarm.abc123.chat.group-0");
        assert_eq!(events_swarm("abc123"), "events.swarm.abc123");
    }

    #[test]
    fn output_payload_wire_format() {
        let payload: OutputPayload =
            serde_json::from_value(json!({"type": "result", "content": "done"})).unwrap();
        assert_eq!(payload.kind, OutputKind::Result);

        let encoded = serde_json::to_value(&OutputPayload {
            kind: OutputKind::Text,
            content: "hi".into(),
        })
        .unwrap();
        assert_eq!(encoded, json!({"type": "text", "content": "hi"}));
    }

    #[test]
    fn control_payload_wire_format() {
        let encoded = serde_json::to_value(&ControlPayload {
            action: ControlAction::Reset,
        })
        .unwrap();
        assert_eq!(encoded, json!({"action": "reset"}));
    }
}
