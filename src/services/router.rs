//! Maps an incoming message to an agent id.
//!
//! Rules, in order: explicit `@swarm` prefix, explicit `@agent` prefix,
//! LLM-based dispatch through the default agent, then the default agent
//! as fallback.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::registry::Registry;
use crate::domain::errors::{GatewayError, GatewayResult};

/// Reserved agent id that routes a message into the swarm coordinator.
pub const SWARM_SENTINEL: &str = "swarm";

/// Seam for the LLM-based dispatch: ask a running agent to pick a route.
/// Implemented by the orchestrator over `agent.{id}.route`.
#[async_trait]
pub trait RoutePicker: Send + Sync {
    /// Send `prompt` to `agent_id` and return its single-token answer.
    async fn pick_route(&self, agent_id: &str, prompt: &str) -> GatewayResult<String>;
}

/// A routing decision: the chosen agent and the text to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub agent_id: String,
    pub text: String,
}

pub struct Router {
    registry: Arc<Registry>,
    default_agent: RwLock<Option<String>>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, default_agent: Option<String>) -> Self {
        Self {
            registry,
            default_agent: RwLock::new(default_agent),
        }
    }

    /// Swap the default agent. Used by hot reload.
    pub async fn set_default_agent(&self, default_agent: Option<String>) {
        *self.default_agent.write().await = default_agent;
    }

    /// Route a message. `picker` performs the LLM dispatch when the
    /// prefix rules miss.
    pub async fn route(&self, text: &str, picker: &dyn RoutePicker) -> GatewayResult<Route> {
        if let Some((token, rest)) = split_prefix(text) {
            if token == SWARM_SENTINEL {
                return Ok(Route {
                    agent_id: SWARM_SENTINEL.to_string(),
                    text: rest.to_string(),
                });
            }
            if self.registry.contains(token).await {
                return Ok(Route {
                    agent_id: token.to_string(),
                    text: rest.to_string(),
                });
            }
            // Unknown @name is not an error; the full text falls through
            // to smart routing.
            debug!(token, "unknown @prefix, falling through");
        }

        let default_agent = self.default_agent.read().await.clone();
        let Some(default_agent) = default_agent else {
            return Err(GatewayError::NoDefault);
        };

        if self.registry.len().await > 1 {
            match self.smart_route(&default_agent, text, picker).await {
                Ok(Some(agent_id)) => {
                    return Ok(Route {
                        agent_id,
                        text: text.to_string(),
                    })
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "smart routing failed, using default agent");
                }
            }
        }

        Ok(Route {
            agent_id: default_agent,
            text: text.to_string(),
        })
    }

    async fn smart_route(
        &self,
        default_agent: &str,
        text: &str,
        picker: &dyn RoutePicker,
    ) -> GatewayResult<Option<String>> {
        let descriptions = self.registry.descriptions().await;
        let mut catalog: Vec<String> = descriptions
            .iter()
            .map(|(id, desc)| format!("- {id}: {desc}"))
            .collect();
        catalog.sort();

        let prompt = format!(
            "Pick the best agent for the user message below. Reply with \
             exactly one agent id from this list and nothing else.\n\n{}\n\nUser message:\n{}",
            catalog.join("\n"),
            text
        );

        let answer = picker.pick_route(default_agent, &prompt).await?;
        let token = answer.trim().trim_matches(['`', '"', '\'']);
        if descriptions.contains_key(token) {
            debug!(agent_id = token, "smart route selected");
            Ok(Some(token.to_string()))
        } else {
            debug!(answer = %answer, "smart route returned unknown token");
            Ok(None)
        }
    }
}

/// Split a leading `@name` prefix. Returns `(name, rest)` where rest is
/// the text after the prefix with leading whitespace removed; a bare
/// `@name` yields an empty rest.
fn split_prefix(text: &str) -> Option<(&str, &str)> {
    let stripped = text.strip_prefix('@')?;
    if stripped.is_empty() {
        return None;
    }
    match stripped.split_once(char::is_whitespace) {
        Some((token, rest)) => Some((token, rest.trim_start())),
        None => Some((stripped, "")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::agent::AgentDefinition;
    use crate::domain::models::config::Defaults;
    use crate::infrastructure::store::{AgentRepo, StoreConnection};
    use std::collections::HashMap;

    struct FixedPicker(Option<String>);

    #[async_trait]
    impl RoutePicker for FixedPicker {
        async fn pick_route(&self, _agent_id: &str, _prompt: &str) -> GatewayResult<String> {
            match &self.0 {
                Some(answer) => Ok(answer.clone()),
                None => Err(GatewayError::BusTimeout {
                    subject: "agent.general.route".into(),
                }),
            }
        }
    }

    async fn registry(ids: &[&str]) -> Arc<Registry> {
        let db = StoreConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let repo = Arc::new(AgentRepo::new(db.pool().clone()));
        let agents: HashMap<String, AgentDefinition> = ids
            .iter()
            .map(|id| {
                (
                    (*id).to_string(),
                    AgentDefinition {
                        id: (*id).to_string(),
                        description: format!("{id} agent"),
                        ..Default::default()
                    },
                )
            })
            .collect();
        Arc::new(Registry::new(
            agents,
            Defaults::default(),
            repo,
            tempfile::tempdir().unwrap().path(),
        ))
    }

    #[tokio::test]
    async fn known_prefix_strips_text() {
        let router = Router::new(registry(&["general", "coder"]).await, Some("general".into()));
        let route = router
            .route("@coder refactor main.go", &FixedPicker(None))
            .await
            .unwrap();
        assert_eq!(route.agent_id, "coder");
        assert_eq!(route.text, "refactor main.go");
    }

    #[tokio::test]
    async fn bare_prefix_yields_empty_text() {
        let router = Router::new(registry(&["general", "coder"]).await, Some("general".into()));
        let route = router.route("@coder", &FixedPicker(None)).await.unwrap();
        assert_eq!(route.agent_id, "coder");
        assert_eq!(route.text, "");
    }

    #[tokio::test]
    async fn swarm_sentinel_routes_to_swarm() {
        let router = Router::new(registry(&["general"]).await, Some("general".into()));
        let route = router
            .route("@swarm build me a website", &FixedPicker(None))
            .await
            .unwrap();
        assert_eq!(route.agent_id, SWARM_SENTINEL);
        assert_eq!(route.text, "build me a website");
    }

    #[tokio::test]
    async fn unknown_prefix_falls_back_with_original_text() {
        let router = Router::new(registry(&["general", "coder"]).await, Some("general".into()));
        let route = router
            .route("@unknown hi", &FixedPicker(None))
            .await
            .unwrap();
        assert_eq!(route.agent_id, "general");
        assert_eq!(route.text, "@unknown hi");
    }

    #[tokio::test]
    async fn smart_route_picks_registered_agent() {
        let router = Router::new(registry(&["general", "coder"]).await, Some("general".into()));
        let route = router
            .route("please fix this bug", &FixedPicker(Some("coder".into())))
            .await
            .unwrap();
        assert_eq!(route.agent_id, "coder");
        assert_eq!(route.text, "please fix this bug");
    }

    #[tokio::test]
    async fn smart_route_unknown_token_falls_back() {
        let router = Router::new(registry(&["general", "coder"]).await, Some("general".into()));
        let route = router
            .route("hello", &FixedPicker(Some("nobody".into())))
            .await
            .unwrap();
        assert_eq!(route.agent_id, "general");
    }

    #[tokio::test]
    async fn no_default_errors() {
        let router = Router::new(registry(&["general"]).await, None);
        let err = router.route("hello", &FixedPicker(None)).await.unwrap_err();
        assert!(matches!(err, GatewayError::NoDefault));
    }
}
