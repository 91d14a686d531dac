//! Hot configuration reload.
//!
//! Polls the config file mtime every 3 seconds, hashes the contents, and
//! applies a granular diff when it changes. `SIGHUP` forces a reload. A
//! config that fails validation is logged and the previous one remains
//! in effect.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::orchestrator::Orchestrator;
use super::registry::Registry;
use super::router::Router;
use super::scheduler::Scheduler;
use crate::domain::models::config::Config;
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::docker::{ContainerManager, ManagerDefaults};

const MTIME_POLL: Duration = Duration::from_secs(3);

/// What changed between two configurations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub agents_added: Vec<String>,
    pub agents_removed: Vec<String>,
    pub agents_changed: Vec<String>,
    pub defaults_changed: bool,
    pub router_changed: bool,
    pub scheduler_changed: bool,
    pub main_chat_changed: bool,
    /// Changed fields that require a restart; logged, never applied.
    pub non_reloadable: Vec<String>,
}

impl ConfigDiff {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Compute the granular diff between two configs.
pub fn diff(old: &Config, new: &Config) -> ConfigDiff {
    let mut result = ConfigDiff::default();

    let old_ids: HashSet<&String> = old.agents.keys().collect();
    let new_ids: HashSet<&String> = new.agents.keys().collect();
    for id in new_ids.difference(&old_ids) {
        result.agents_added.push((*id).clone());
    }
    for id in old_ids.difference(&new_ids) {
        result.agents_removed.push((*id).clone());
    }
    for id in new_ids.intersection(&old_ids) {
        if old.agents[*id] != new.agents[*id] {
            result.agents_changed.push((*id).clone());
        }
    }
    result.agents_added.sort();
    result.agents_removed.sort();
    result.agents_changed.sort();

    // Defaults, minus the non-reloadable credential fields.
    let mut old_defaults = old.defaults.clone();
    let mut new_defaults = new.defaults.clone();
    if old_defaults.anthropic_api_key != new_defaults.anthropic_api_key {
        result
            .non_reloadable
            .push("defaults.anthropic_api_key".into());
    }
    if old_defaults.oauth_token != new_defaults.oauth_token {
        result.non_reloadable.push("defaults.oauth_token".into());
    }
    old_defaults.anthropic_api_key = None;
    old_defaults.oauth_token = None;
    new_defaults.anthropic_api_key = None;
    new_defaults.oauth_token = None;
    result.defaults_changed = old_defaults != new_defaults;

    result.router_changed = old.router != new.router;
    result.scheduler_changed = old.scheduler != new.scheduler;
    result.main_chat_changed = old.telegram.main_chat_id != new.telegram.main_chat_id;

    if old.vault.passphrase != new.vault.passphrase {
        result.non_reloadable.push("vault.passphrase".into());
    }
    if old.nats.port != new.nats.port {
        result.non_reloadable.push("nats.port".into());
    }
    if old.nats.data_dir != new.nats.data_dir {
        result.non_reloadable.push("nats.data_dir".into());
    }
    if old.web.port != new.web.port {
        result.non_reloadable.push("web.port".into());
    }

    result
}

pub struct Reloader {
    path: PathBuf,
    current: Mutex<Config>,
    registry: Arc<Registry>,
    orchestrator: Arc<Orchestrator>,
    manager: Arc<ContainerManager>,
    router: Arc<Router>,
    scheduler: Arc<Scheduler>,
    cancel: CancellationToken,
}

impl Reloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: impl Into<PathBuf>,
        initial: Config,
        registry: Arc<Registry>,
        orchestrator: Arc<Orchestrator>,
        manager: Arc<ContainerManager>,
        router: Arc<Router>,
        scheduler: Arc<Scheduler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            path: path.into(),
            current: Mutex::new(initial),
            registry,
            orchestrator,
            manager,
            router,
            scheduler,
            cancel,
        }
    }

    /// Watch loop: mtime poll + content hash, plus SIGHUP.
    pub async fn run(self: Arc<Self>) {
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "failed to install SIGHUP handler");
                return;
            }
        };

        let mut last_mtime = self.mtime();
        let mut last_hash = self.content_hash();

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = sighup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    self.reload().await;
                    last_mtime = self.mtime();
                    last_hash = self.content_hash();
                }
                () = tokio::time::sleep(MTIME_POLL) => {
                    let mtime = self.mtime();
                    if mtime == last_mtime {
                        continue;
                    }
                    last_mtime = mtime;
                    let hash = self.content_hash();
                    if hash == last_hash {
                        continue;
                    }
                    last_hash = hash;
                    info!("config file changed, reloading");
                    self.reload().await;
                }
            }
        }
    }

    fn mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn content_hash(&self) -> Option<[u8; 32]> {
        std::fs::read(&self.path)
            .ok()
            .map(|bytes| Sha256::digest(&bytes).into())
    }

    /// Load, diff, and apply the configuration at `path`.
    pub async fn reload(&self) {
        let new = match ConfigLoader::load(&self.path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "reload rejected, keeping previous config");
                return;
            }
        };

        let mut current = self.current.lock().await;
        let changes = diff(&current, &new);
        if changes.is_empty() {
            return;
        }
        info!(?changes, "applying configuration changes");

        for field in &changes.non_reloadable {
            warn!(field, "changed field requires a restart, ignoring");
        }

        // Registry first so lazily restarted agents see new definitions.
        self.registry
            .update(new.agents_with_ids(), new.defaults.clone())
            .await;
        if let Err(e) = self.registry.sync().await {
            warn!(error = %e, "registry sync failed during reload");
        }

        if changes.defaults_changed {
            self.manager
                .update_defaults(ManagerDefaults {
                    max_running: new.defaults.max_running,
                    data_dir: new.data_dir.clone(),
                    // Credentials stay non-reloadable.
                    anthropic_api_key: current.defaults.anthropic_api_key.clone(),
                    oauth_token: current.defaults.oauth_token.clone(),
                    timezone: new.defaults.timezone.clone(),
                })
                .await;
            self.orchestrator
                .set_idle_timeout(new.defaults.idle_timeout())
                .await;
        }

        if changes.router_changed {
            self.router
                .set_default_agent(new.router.default_agent.clone())
                .await;
        }

        if changes.scheduler_changed || changes.main_chat_changed {
            self.scheduler
                .update_config(new.scheduler.poll_interval(), new.telegram.main_chat_id)
                .await;
        }

        // Changed definitions restart lazily on next input; removed
        // agents stop now.
        for agent_id in changes.agents_changed.iter().chain(&changes.agents_removed) {
            if let Err(e) = self.orchestrator.stop_agent(agent_id).await {
                warn!(agent_id, error = %e, "failed to stop reconfigured agent");
            }
        }
        for agent_id in &changes.agents_removed {
            self.orchestrator.forget_agent(agent_id).await;
        }

        let mut applied = new;
        applied.defaults.anthropic_api_key = current.defaults.anthropic_api_key.clone();
        applied.defaults.oauth_token = current.defaults.oauth_token.clone();
        applied.vault.passphrase = current.vault.passphrase.clone();
        applied.nats = current.nats.clone();
        applied.web.port = current.web.port;
        *current = applied;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::agent::AgentDefinition;

    fn config_with_agents(ids: &[&str]) -> Config {
        let mut config = Config::default();
        config.vault.passphrase = Some("p".into());
        for id in ids {
            config.agents.insert(
                (*id).to_string(),
                AgentDefinition {
                    id: (*id).to_string(),
                    ..Default::default()
                },
            );
        }
        config.router.default_agent = ids.first().map(|s| (*s).to_string());
        config
    }

    #[test]
    fn identical_configs_produce_empty_diff() {
        let config = config_with_agents(&["general"]);
        assert!(diff(&config, &config.clone()).is_empty());
    }

    #[test]
    fn agent_changes_are_classified() {
        let old = config_with_agents(&["general", "coder"]);
        let mut new = config_with_agents(&["general", "writer"]);
        new.agents.get_mut("general").unwrap().description = "updated".into();

        let changes = diff(&old, &new);
        assert_eq!(changes.agents_added, vec!["writer"]);
        assert_eq!(changes.agents_removed, vec!["coder"]);
        assert_eq!(changes.agents_changed, vec!["general"]);
    }

    #[test]
    fn router_only_change_is_isolated() {
        let old = config_with_agents(&["general", "coder"]);
        let mut new = old.clone();
        new.router.default_agent = Some("coder".into());

        let changes = diff(&old, &new);
        assert!(changes.router_changed);
        assert!(changes.agents_changed.is_empty());
        assert!(!changes.defaults_changed);
        assert!(!changes.scheduler_changed);
        assert!(changes.non_reloadable.is_empty());
    }

    #[test]
    fn credentials_and_ports_are_non_reloadable() {
        let old = config_with_agents(&["general"]);
        let mut new = old.clone();
        new.defaults.anthropic_api_key = Some("sk-new".into());
        new.vault.passphrase = Some("other".into());
        new.nats.port = 5222;
        new.web.port = 9999;

        let changes = diff(&old, &new);
        assert_eq!(
            changes.non_reloadable,
            vec![
                "defaults.anthropic_api_key",
                "vault.passphrase",
                "nats.port",
                "web.port"
            ]
        );
        // The credential change alone does not flag defaults.
        assert!(!changes.defaults_changed);
    }

    #[test]
    fn scheduler_and_chat_changes_flag() {
        let old = config_with_agents(&["general"]);
        let mut new = old.clone();
        new.scheduler.poll_interval_secs = 5;
        new.telegram.main_chat_id = Some(42);

        let changes = diff(&old, &new);
        assert!(changes.scheduler_changed);
        assert!(changes.main_chat_changed);
    }
}
