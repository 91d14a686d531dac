//! Routing rules end to end against a real registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use praktor::domain::models::agent::AgentDefinition;
use praktor::domain::models::config::Defaults;
use praktor::domain::{GatewayError, GatewayResult};
use praktor::infrastructure::store::{AgentRepo, StoreConnection};
use praktor::services::{Registry, RoutePicker, Router, SWARM_SENTINEL};

/// Picker standing in for the default agent's LLM dispatch.
struct ScriptedPicker {
    answer: GatewayResult<&'static str>,
}

#[async_trait]
impl RoutePicker for ScriptedPicker {
    async fn pick_route(&self, _agent_id: &str, prompt: &str) -> GatewayResult<String> {
        // The dispatch prompt must carry the agent catalog.
        assert!(prompt.contains("general"));
        assert!(prompt.contains("coder"));
        match &self.answer {
            Ok(token) => Ok((*token).to_string()),
            Err(_) => Err(GatewayError::BusTimeout {
                subject: "agent.general.route".into(),
            }),
        }
    }
}

async fn build_router() -> Router {
    let db = StoreConnection::new("sqlite::memory:").await.unwrap();
    db.migrate().await.unwrap();
    let repo = Arc::new(AgentRepo::new(db.pool().clone()));

    let mut agents = HashMap::new();
    for (id, description) in [("general", "general assistant"), ("coder", "writes code")] {
        agents.insert(
            id.to_string(),
            AgentDefinition {
                id: id.to_string(),
                description: description.to_string(),
                ..Default::default()
            },
        );
    }
    let registry = Arc::new(Registry::new(
        agents,
        Defaults::default(),
        repo,
        tempfile::tempdir().unwrap().path(),
    ));
    Router::new(registry, Some("general".into()))
}

#[tokio::test]
async fn known_prefix_wins_and_strips() {
    let router = build_router().await;
    let picker = ScriptedPicker {
        answer: Err(GatewayError::NoDefault),
    };
    let route = router.route("@coder refactor main.go", &picker).await.unwrap();
    assert_eq!(route.agent_id, "coder");
    assert_eq!(route.text, "refactor main.go");
}

#[tokio::test]
async fn unknown_prefix_falls_through_to_default_with_original_text() {
    let router = build_router().await;
    // Smart route times out, so the default agent gets the message.
    let picker = ScriptedPicker {
        answer: Err(GatewayError::NoDefault),
    };
    let route = router.route("@unknown hi", &picker).await.unwrap();
    assert_eq!(route.agent_id, "general");
    assert_eq!(route.text, "@unknown hi");
}

#[tokio::test]
async fn smart_route_dispatches_to_picked_agent() {
    let router = build_router().await;
    let picker = ScriptedPicker { answer: Ok("coder") };
    let route = router.route("fix the build please", &picker).await.unwrap();
    assert_eq!(route.agent_id, "coder");
    assert_eq!(route.text, "fix the build please");
}

#[tokio::test]
async fn swarm_prefix_returns_sentinel() {
    let router = build_router().await;
    let picker = ScriptedPicker { answer: Ok("coder") };
    let route = router.route("@swarm plan a launch", &picker).await.unwrap();
    assert_eq!(route.agent_id, SWARM_SENTINEL);
    assert_eq!(route.text, "plan a launch");
}
