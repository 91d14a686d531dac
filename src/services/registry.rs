//! Read-only projection of the configured agents map.
//!
//! Resolves per-agent image/model against fleet defaults, owns the
//! agent workspace directories and the `CLAUDE.md`/`USER.md` blobs, and
//! keeps the derived store rows in sync with configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::domain::errors::GatewayResult;
use crate::domain::models::agent::AgentDefinition;
use crate::domain::models::config::Defaults;
use crate::infrastructure::store::AgentRepo;

const CLAUDE_MD: &str = "CLAUDE.md";
const USER_MD: &str = "USER.md";

const DEFAULT_CLAUDE_MD: &str = "# Agent memory\n\n\
    Notes this agent keeps across conversations. Edit freely; the worker\n\
    reads this file at the start of every session.\n";

const DEFAULT_USER_MD: &str = "# About the user\n\n\
    Facts the agents should know about the person they are talking to.\n";

struct View {
    agents: HashMap<String, AgentDefinition>,
    defaults: Defaults,
}

/// Registry of configured agents.
pub struct Registry {
    view: RwLock<View>,
    agent_repo: Arc<AgentRepo>,
    agents_dir: PathBuf,
}

impl Registry {
    pub fn new(
        agents: HashMap<String, AgentDefinition>,
        defaults: Defaults,
        agent_repo: Arc<AgentRepo>,
        data_dir: impl AsRef<Path>,
    ) -> Self {
        Self {
            view: RwLock::new(View { agents, defaults }),
            agent_repo,
            agents_dir: data_dir.as_ref().join("agents"),
        }
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentDefinition> {
        self.view.read().await.agents.get(agent_id).cloned()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.view.read().await.agents.contains_key(agent_id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.view.read().await.agents.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.view.read().await.agents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.view.read().await.agents.is_empty()
    }

    /// `agent_id → description` map for routing prompts.
    pub async fn descriptions(&self) -> HashMap<String, String> {
        self.view
            .read()
            .await
            .agents
            .iter()
            .map(|(id, def)| (id.clone(), def.description.clone()))
            .collect()
    }

    pub async fn defaults(&self) -> Defaults {
        self.view.read().await.defaults.clone()
    }

    /// Image for an agent, falling back to the fleet default.
    pub async fn resolve_image(&self, def: &AgentDefinition) -> String {
        match &def.image {
            Some(image) => image.clone(),
            None => self.view.read().await.defaults.image.clone(),
        }
    }

    /// Model for an agent, falling back to the fleet default.
    pub async fn resolve_model(&self, def: &AgentDefinition) -> String {
        match &def.model {
            Some(model) => model.clone(),
            None => self.view.read().await.defaults.model.clone(),
        }
    }

    /// Ids of agents with nix enabled.
    pub async fn nix_enabled_ids(&self) -> Vec<String> {
        self.view
            .read()
            .await
            .agents
            .values()
            .filter(|d| d.nix_enabled)
            .map(|d| d.id.clone())
            .collect()
    }

    /// Swap the in-memory view atomically. Used by hot reload.
    pub async fn update(
        &self,
        agents: HashMap<String, AgentDefinition>,
        defaults: Defaults,
    ) {
        let mut view = self.view.write().await;
        view.agents = agents;
        view.defaults = defaults;
    }

    /// Sync derived store rows and on-disk workspace layout with the
    /// configured agents.
    pub async fn sync(&self) -> GatewayResult<()> {
        let agents: Vec<AgentDefinition> =
            self.view.read().await.agents.values().cloned().collect();

        for def in &agents {
            self.agent_repo.upsert(def).await?;

            let workspace = self.agents_dir.join(def.workspace_name());
            std::fs::create_dir_all(&workspace)?;
            let claude_md = workspace.join(CLAUDE_MD);
            if !claude_md.exists() {
                let content = match &def.claude_md {
                    Some(path) => std::fs::read_to_string(path)
                        .unwrap_or_else(|_| DEFAULT_CLAUDE_MD.to_string()),
                    None => DEFAULT_CLAUDE_MD.to_string(),
                };
                std::fs::write(&claude_md, content)?;
            }
        }

        let keep: Vec<String> = agents.iter().map(|d| d.id.clone()).collect();
        let removed = self.agent_repo.retain(&keep).await?;
        if removed > 0 {
            info!(removed, "pruned store rows for removed agents");
        }

        let global = self.agents_dir.join("global");
        std::fs::create_dir_all(&global)?;
        for (file, content) in [(CLAUDE_MD, DEFAULT_CLAUDE_MD), (USER_MD, DEFAULT_USER_MD)] {
            let path = global.join(file);
            if !path.exists() {
                std::fs::write(&path, content)?;
            }
        }
        Ok(())
    }

    /// Per-agent memory prompt, if the workspace has one.
    pub async fn read_claude_md(&self, agent_id: &str) -> GatewayResult<Option<String>> {
        let Some(def) = self.get(agent_id).await else {
            return Ok(None);
        };
        let path = self
            .agents_dir
            .join(def.workspace_name())
            .join(CLAUDE_MD);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn read_user_md(&self) -> GatewayResult<String> {
        let path = self.agents_dir.join("global").join(USER_MD);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(DEFAULT_USER_MD.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn update_user_md(&self, content: &str) -> GatewayResult<()> {
        let global = self.agents_dir.join("global");
        std::fs::create_dir_all(&global)?;
        std::fs::write(global.join(USER_MD), content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::store::StoreConnection;
    use tempfile::TempDir;

    async fn registry(dir: &TempDir) -> Registry {
        let db = StoreConnection::new("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let repo = Arc::new(AgentRepo::new(db.pool().clone()));

        let mut agents = HashMap::new();
        agents.insert(
            "general".to_string(),
            AgentDefinition {
                id: "general".into(),
                description: "general assistant".into(),
                ..Default::default()
            },
        );
        agents.insert(
            "coder".to_string(),
            AgentDefinition {
                id: "coder".into(),
                description: "writes code".into(),
                model: Some("claude-opus-4-5".into()),
                ..Default::default()
            },
        );
        Registry::new(agents, Defaults::default(), repo, dir.path())
    }

    #[tokio::test]
    async fn sync_creates_workspaces_and_globals() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;
        registry.sync().await.unwrap();

        assert!(dir.path().join("agents/general/CLAUDE.md").exists());
        assert!(dir.path().join("agents/coder/CLAUDE.md").exists());
        assert!(dir.path().join("agents/global/CLAUDE.md").exists());
        assert!(dir.path().join("agents/global/USER.md").exists());
    }

    #[tokio::test]
    async fn model_resolution_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        let general = registry.get("general").await.unwrap();
        let coder = registry.get("coder").await.unwrap();
        assert_eq!(
            registry.resolve_model(&general).await,
            Defaults::default().model
        );
        assert_eq!(registry.resolve_model(&coder).await, "claude-opus-4-5");
    }

    #[tokio::test]
    async fn update_swaps_view() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;
        registry.update(HashMap::new(), Defaults::default()).await;
        assert!(registry.is_empty().await);
    }
}
