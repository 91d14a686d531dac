//! Gateway composition: wires the store, bus, vault, registry,
//! container manager, orchestrator, scheduler, swarm coordinator, and
//! config reloader together, and owns ordered shutdown.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::orchestrator::{Orchestrator, OutputListener, SwarmMembershipMap};
use super::provision::Provisioner;
use super::registry::Registry;
use super::reloader::Reloader;
use super::router::{Router, SWARM_SENTINEL};
use super::scheduler::Scheduler;
use super::swarm::SwarmCoordinator;
use crate::domain::errors::GatewayResult;
use crate::domain::models::config::Config;
use crate::infrastructure::bus::{Bus, BusServer};
use crate::infrastructure::config::ConfigLoader;
use crate::infrastructure::docker::{ContainerManager, ManagerDefaults};
use crate::infrastructure::store::{
    AgentRepo, MessageRepo, SecretRepo, SessionRepo, StoreConnection, SwarmRepo, TaskRepo,
};
use crate::infrastructure::vault::Vault;

/// The composed gateway core.
pub struct Gateway {
    config: Config,
    // Held so buffered log lines flush on drop.
    _log_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
    store: StoreConnection,
    bus_server: BusServer,
    bus: Bus,
    registry: Arc<Registry>,
    manager: Arc<ContainerManager>,
    orchestrator: Arc<Orchestrator>,
    router: Arc<Router>,
    scheduler: Arc<Scheduler>,
    swarm: Arc<SwarmCoordinator>,
    reloader: Arc<Reloader>,
    cancel: CancellationToken,
}

impl Gateway {
    /// Boot every subsystem from the config at `config_path`.
    pub async fn build(config_path: impl AsRef<Path>) -> Result<Self> {
        let config_path = config_path.as_ref();
        let config = ConfigLoader::load(config_path)?;
        let log_guard = crate::infrastructure::logging::init(&config.logging)?;
        let cancel = CancellationToken::new();

        std::fs::create_dir_all(&config.data_dir).context("failed to create data dir")?;

        let store = StoreConnection::open(Path::new(&config.data_dir).join("praktor.db"))
            .await
            .context("failed to open store")?;
        store.migrate().await?;

        let agent_repo = Arc::new(AgentRepo::new(store.pool().clone()));
        let task_repo = Arc::new(TaskRepo::new(store.pool().clone()));
        let secret_repo = Arc::new(SecretRepo::new(store.pool().clone()));
        let swarm_repo = Arc::new(SwarmRepo::new(store.pool().clone()));
        let session_repo = Arc::new(SessionRepo::new(store.pool().clone()));
        let message_repo = Arc::new(MessageRepo::new(store.pool().clone()));

        let passphrase = config
            .vault
            .passphrase
            .as_deref()
            .context("vault.passphrase is required")?;
        let vault = Vault::new(passphrase)?;

        let nats_data_dir = config
            .nats
            .data_dir
            .clone()
            .unwrap_or_else(|| format!("{}/nats", config.data_dir));
        let bus_server = BusServer::spawn(config.nats.port, &nats_data_dir)
            .await
            .context("failed to start bus broker")?;
        let bus = Bus::connect(bus_server.client_url(), bus_server.monitor_url())
            .await
            .context("failed to connect to bus")?;

        let registry = Arc::new(Registry::new(
            config.agents_with_ids(),
            config.defaults.clone(),
            agent_repo,
            &config.data_dir,
        ));
        registry.sync().await?;

        let manager = Arc::new(ContainerManager::new(ManagerDefaults {
            max_running: config.defaults.max_running,
            data_dir: config.data_dir.clone(),
            anthropic_api_key: config.defaults.anthropic_api_key.clone(),
            oauth_token: config.defaults.oauth_token.clone(),
            timezone: config.defaults.timezone.clone(),
        })?);
        match manager.cleanup_stale().await {
            Ok(0) => {}
            Ok(removed) => info!(removed, "removed stale worker containers"),
            Err(e) => warn!(error = %e, "stale container sweep failed"),
        }

        let provisioner = Arc::new(Provisioner::new(
            registry.clone(),
            secret_repo,
            vault,
            bus_server.worker_url(),
        ));

        let membership: SwarmMembershipMap = Arc::default();
        let orchestrator = Arc::new(Orchestrator::new(
            registry.clone(),
            manager.clone(),
            provisioner.clone(),
            bus.clone(),
            session_repo,
            task_repo.clone(),
            message_repo,
            membership.clone(),
            config.defaults.idle_timeout(),
            cancel.clone(),
        ));

        let router = Arc::new(Router::new(
            registry.clone(),
            config.router.default_agent.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            task_repo,
            orchestrator.clone(),
            bus.clone(),
            config.scheduler.poll_interval(),
            config.telegram.main_chat_id,
            cancel.clone(),
        ));

        let swarm = Arc::new(SwarmCoordinator::new(
            registry.clone(),
            manager.clone(),
            provisioner,
            bus.clone(),
            swarm_repo,
            membership,
            cancel.clone(),
        ));

        let reloader = Arc::new(Reloader::new(
            config_path,
            config.clone(),
            registry.clone(),
            orchestrator.clone(),
            manager.clone(),
            router.clone(),
            scheduler.clone(),
            cancel.clone(),
        ));

        Ok(Self {
            config,
            _log_guard: log_guard,
            store,
            bus_server,
            bus,
            registry,
            manager,
            orchestrator,
            router,
            scheduler,
            swarm,
            reloader,
            cancel,
        })
    }

    /// Entry point for chat adapters: route the message and hand it to
    /// the orchestrator (or the swarm coordinator for `@swarm`).
    pub async fn handle_chat(&self, text: &str, meta: Value) -> GatewayResult<()> {
        let route = self.router.route(text, &self.orchestrator).await?;
        if route.agent_id == SWARM_SENTINEL {
            if route.text.trim().is_empty() {
                return Ok(());
            }
            let lead = self
                .config
                .router
                .default_agent
                .clone()
                .ok_or(crate::domain::GatewayError::NoDefault)?;
            let swarm = self.swarm.clone();
            let task = route.text;
            tokio::spawn(async move {
                if let Err(e) = swarm.run_from_prompt(&task, &lead).await {
                    warn!(error = %e, "ad-hoc swarm failed");
                }
            });
            return Ok(());
        }
        self.orchestrator
            .handle_message(&route.agent_id, &route.text, meta)
            .await
    }

    /// Install the chat adapter's output sink.
    pub async fn set_output_listener(&self, listener: OutputListener) {
        self.orchestrator.set_output_listener(listener).await;
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn swarm(&self) -> &Arc<SwarmCoordinator> {
        &self.swarm
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Run the background loops until SIGINT/SIGTERM, then shut down in
    /// order: scheduler → reaper → workers (10 s grace) → bus → store.
    pub async fn run(self) -> Result<()> {
        tokio::spawn(self.scheduler.clone().run());
        tokio::spawn(self.orchestrator.clone().run_idle_reaper());
        {
            let orchestrator = self.orchestrator.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run_ipc_bridge().await {
                    warn!(error = %e, "ipc bridge exited");
                }
            });
        }
        if !self.registry.nix_enabled_ids().await.is_empty() {
            tokio::spawn(self.orchestrator.clone().run_nix_gc());
        }
        tokio::spawn(self.reloader.clone().run());

        // Fallback listener so worker replies are visible when no chat
        // adapter has attached its own sink.
        if !self.orchestrator.has_output_listener().await {
            let listener: OutputListener = Arc::new(|agent_id, payload, _meta| {
                info!(agent_id, content = %payload.content, "worker output");
            });
            self.orchestrator.set_output_listener(listener).await;
        }

        let mut sigint = signal(SignalKind::interrupt()).context("sigint handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("sigterm handler")?;
        info!("gateway running");
        tokio::select! {
            _ = sigint.recv() => info!("SIGINT received, shutting down"),
            _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        }

        self.cancel.cancel();
        self.manager.stop_all().await;
        let _ = self.bus.flush().await;
        self.bus_server.shutdown().await;
        self.store.close().await;
        info!("gateway stopped");
        Ok(())
    }
}
