//! Worker container lifecycle over the Docker socket.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::Docker;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::archive::{secret_file_tar, SecretFileContent};
use crate::domain::errors::{GatewayError, GatewayResult};
use crate::domain::models::agent::FileMount;
use crate::domain::models::container::{ContainerInfo, ContainerStatus};

/// Isolated bridge network all workers join.
pub const NETWORK_NAME: &str = "praktor-net";
/// Label marking containers the gateway owns.
pub const LABEL_MANAGED: &str = "sh.praktor.managed";
/// Label carrying the owning agent id.
pub const LABEL_AGENT: &str = "sh.praktor.agent";

const NAME_PREFIX: &str = "praktor-agent-";
const STALE_STOP_TIMEOUT_SECS: i64 = 5;
const GRACEFUL_STOP_TIMEOUT_SECS: i64 = 10;
const WORKSPACE_MOUNT: &str = "/workspace/agent";
const GLOBAL_MOUNT: &str = "/workspace/global";
const WORKER_UID: u64 = 1000;
const WORKER_GID: u64 = 1000;

/// Everything needed to start one worker container.
#[derive(Debug, Clone)]
pub struct AgentOpts {
    /// Agent id (or transient swarm worker id).
    pub id: String,
    /// Workspace directory name under `{data_dir}/agents/`.
    pub workspace: String,
    pub model: String,
    pub image: String,
    pub session_id: Option<String>,
    pub nats_url: String,
    /// User env, already secret-resolved.
    pub env: HashMap<String, String>,
    pub secret_files: Vec<SecretFileContent>,
    pub allowed_tools: Vec<String>,
    pub nix_enabled: bool,
    pub mounts: Vec<FileMount>,
}

/// Fleet-wide settings the manager needs; swapped on config reload.
#[derive(Debug, Clone)]
pub struct ManagerDefaults {
    pub max_running: usize,
    pub data_dir: String,
    pub anthropic_api_key: Option<String>,
    pub oauth_token: Option<String>,
    pub timezone: Option<String>,
}

/// Owns the set of worker containers and materializes their environment.
pub struct ContainerManager {
    docker: Docker,
    active: RwLock<HashMap<String, ContainerInfo>>,
    defaults: RwLock<ManagerDefaults>,
}

fn docker_err(stage: &str) -> impl Fn(bollard::errors::Error) -> GatewayError + '_ {
    move |e| GatewayError::DockerApi {
        stage: stage.to_string(),
        reason: e.to_string(),
    }
}

impl ContainerManager {
    pub fn new(defaults: ManagerDefaults) -> GatewayResult<Self> {
        let docker = Docker::connect_with_socket_defaults().map_err(docker_err("connect"))?;
        Ok(Self {
            docker,
            active: RwLock::new(HashMap::new()),
            defaults: RwLock::new(defaults),
        })
    }

    pub async fn update_defaults(&self, defaults: ManagerDefaults) {
        *self.defaults.write().await = defaults;
    }

    /// Canonical container name for an agent id.
    pub fn container_name(agent_id: &str) -> String {
        format!("{NAME_PREFIX}{agent_id}")
    }

    /// Create the isolated bridge network if it does not exist.
    pub async fn ensure_network(&self) -> GatewayResult<()> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![NETWORK_NAME.to_string()]);
        let existing = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(docker_err("list networks"))?;
        if existing
            .iter()
            .any(|n| n.name.as_deref() == Some(NETWORK_NAME))
        {
            return Ok(());
        }

        match self
            .docker
            .create_network(CreateNetworkOptions {
                name: NETWORK_NAME.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
        {
            Ok(_) => {
                info!(network = NETWORK_NAME, "created worker network");
                Ok(())
            }
            // Lost the creation race to a concurrent start.
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(docker_err("create network")(e)),
        }
    }

    /// Start a worker container for `opts.id`.
    ///
    /// Fails with `MaxRunningExceeded` when the fleet is full and
    /// `StartFailed` wrapping the offending stage otherwise. Partially
    /// created containers are removed before the error returns.
    pub async fn start_agent(&self, opts: AgentOpts) -> GatewayResult<ContainerInfo> {
        let defaults = self.defaults.read().await.clone();

        {
            let active = self.active.read().await;
            if active.len() >= defaults.max_running {
                return Err(GatewayError::MaxRunningExceeded(defaults.max_running));
            }
            if active.contains_key(&opts.id) {
                return Err(GatewayError::StartFailed {
                    agent_id: opts.id.clone(),
                    reason: "container already running".into(),
                });
            }
        }

        self.ensure_network().await?;

        let name = Self::container_name(&opts.id);
        self.remove_stale(&name).await;

        let info = match self.create_and_start(&name, &opts, &defaults).await {
            Ok(info) => info,
            Err(e) => {
                // Roll back whatever half-exists under the canonical name.
                self.force_remove(&name).await;
                return Err(GatewayError::StartFailed {
                    agent_id: opts.id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        self.active.write().await.insert(opts.id.clone(), info.clone());
        info!(agent_id = %opts.id, container_id = %info.container_id, "worker started");
        Ok(info)
    }

    async fn create_and_start(
        &self,
        name: &str,
        opts: &AgentOpts,
        defaults: &ManagerDefaults,
    ) -> GatewayResult<ContainerInfo> {
        let env = Self::build_env(opts, defaults);
        let binds = self.build_binds(opts, defaults)?;

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED.to_string(), "true".to_string());
        labels.insert(LABEL_AGENT.to_string(), opts.id.clone());

        let config = Config {
            image: Some(opts.image.clone()),
            env: Some(env),
            labels: Some(labels),
            working_dir: Some(WORKSPACE_MOUNT.to_string()),
            host_config: Some(HostConfig {
                binds: Some(binds),
                network_mode: Some(NETWORK_NAME.to_string()),
                // Workers dial the bus through the host gateway.
                extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(docker_err("create container"))?;

        for file in &opts.secret_files {
            let tar = secret_file_tar(file, WORKER_UID, WORKER_GID)?;
            self.docker
                .upload_to_container(
                    name,
                    Some(UploadToContainerOptions {
                        path: "/",
                        ..Default::default()
                    }),
                    Bytes::from(tar),
                )
                .await
                .map_err(docker_err("seed secret file"))?;
        }

        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(docker_err("start container"))?;

        if opts.nix_enabled {
            // Best effort; a missing daemon must not block the worker.
            if let Err(e) = self.exec_detached(name, vec!["nix-daemon"], Some("root")).await {
                warn!(agent_id = %opts.id, error = %e, "nix daemon exec failed");
            }
        }

        let now = Utc::now();
        Ok(ContainerInfo {
            container_id: created.id,
            agent_id: opts.id.clone(),
            name: name.to_string(),
            status: ContainerStatus::Running,
            started_at: now,
            last_activity_at: now,
            session_id: opts.session_id.clone().unwrap_or_default(),
        })
    }

    fn build_env(opts: &AgentOpts, defaults: &ManagerDefaults) -> Vec<String> {
        let mut env = vec![
            format!("NATS_URL={}", opts.nats_url),
            format!("AGENT_ID={}", opts.id),
        ];
        if let Some(session_id) = &opts.session_id {
            if !session_id.is_empty() {
                env.push(format!("SESSION_ID={session_id}"));
            }
        }
        if !opts.model.is_empty() {
            env.push(format!("AGENT_MODEL={}", opts.model));
        }
        if let Some(key) = &defaults.anthropic_api_key {
            env.push(format!("ANTHROPIC_API_KEY={key}"));
        }
        if let Some(token) = &defaults.oauth_token {
            env.push(format!("CLAUDE_CODE_OAUTH_TOKEN={token}"));
        }
        if let Some(tz) = &defaults.timezone {
            env.push(format!("TZ={tz}"));
        }
        for (k, v) in &opts.env {
            env.push(format!("{k}={v}"));
        }
        if !opts.allowed_tools.is_empty() {
            env.push(format!("ALLOWED_TOOLS={}", opts.allowed_tools.join(",")));
        }
        env
    }

    fn build_binds(&self, opts: &AgentOpts, defaults: &ManagerDefaults) -> GatewayResult<Vec<String>> {
        let agents_dir = Path::new(&defaults.data_dir).join("agents");
        let workspace = agents_dir.join(&opts.workspace);
        let global = agents_dir.join("global");
        std::fs::create_dir_all(&workspace)?;
        std::fs::create_dir_all(&global)?;

        let abs = |p: &Path| -> GatewayResult<PathBuf> { Ok(std::fs::canonicalize(p)?) };

        let mut binds = vec![
            format!("{}:{}", abs(&workspace)?.display(), WORKSPACE_MOUNT),
            format!("{}:{}:ro", abs(&global)?.display(), GLOBAL_MOUNT),
        ];
        for mount in &opts.mounts {
            let suffix = if mount.read_only { ":ro" } else { "" };
            binds.push(format!(
                "{}:{}{suffix}",
                mount.host_path, mount.container_path
            ));
        }
        Ok(binds)
    }

    /// Force-stop and remove any stale container holding the canonical
    /// name, with a bounded timeout.
    async fn remove_stale(&self, name: &str) {
        let _ = self
            .docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: STALE_STOP_TIMEOUT_SECS,
                }),
            )
            .await;
        self.force_remove(name).await;
    }

    async fn force_remove(&self, name: &str) {
        let _ = self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }

    /// Graceful stop (10 s), force remove, drop from the active map.
    /// Idempotent.
    pub async fn stop_agent(&self, agent_id: &str) -> GatewayResult<()> {
        let name = Self::container_name(agent_id);
        if let Err(e) = self
            .docker
            .stop_container(
                &name,
                Some(StopContainerOptions {
                    t: GRACEFUL_STOP_TIMEOUT_SECS,
                }),
            )
            .await
        {
            debug!(agent_id, error = %e, "stop container");
        }
        self.force_remove(&name).await;
        if self.active.write().await.remove(agent_id).is_some() {
            info!(agent_id, "worker stopped");
        }
        Ok(())
    }

    /// Stop every active worker. Used during ordered shutdown and fatal
    /// reconfiguration.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.active.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.stop_agent(&id).await;
        }
    }

    /// Run a command inside a live container and return combined
    /// stdout/stderr. Nonzero exit codes surface as errors.
    pub async fn exec(&self, agent_id: &str, cmd: Vec<&str>) -> GatewayResult<String> {
        let name = Self::container_name(agent_id);
        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(ToString::to_string).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(docker_err("create exec"))?;

        let mut combined = String::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(docker_err("start exec"))?
        {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(chunk) = output.next().await {
                    match chunk.map_err(docker_err("read exec output"))? {
                        LogOutput::StdOut { message }
                        | LogOutput::StdErr { message }
                        | LogOutput::Console { message } => {
                            combined.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {}
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(docker_err("inspect exec"))?;
        match inspect.exit_code {
            Some(0) | None => Ok(combined),
            Some(code) => Err(GatewayError::DockerApi {
                stage: "exec".to_string(),
                reason: format!("exit code {code}: {}", tail(&combined, 512)),
            }),
        }
    }

    async fn exec_detached(
        &self,
        name: &str,
        cmd: Vec<&str>,
        user: Option<&str>,
    ) -> GatewayResult<()> {
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(cmd.iter().map(ToString::to_string).collect()),
                    user: user.map(ToString::to_string),
                    ..Default::default()
                },
            )
            .await
            .map_err(docker_err("create exec"))?;
        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(docker_err("start exec"))?;
        Ok(())
    }

    /// Remove every labelled container whose agent id is not in the
    /// in-memory active map. Run at boot and periodically after
    /// restarts.
    pub async fn cleanup_stale(&self) -> GatewayResult<usize> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_MANAGED}=true")],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(docker_err("list containers"))?;

        let active = self.active.read().await;
        let known: Vec<String> = active.values().map(|c| c.container_id.clone()).collect();
        drop(active);

        let mut removed = 0;
        for container in containers {
            let Some(id) = container.id else { continue };
            if known.contains(&id) {
                continue;
            }
            warn!(container_id = %id, "removing stale worker container");
            let _ = self
                .docker
                .remove_container(
                    &id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            removed += 1;
        }
        Ok(removed)
    }

    pub async fn get(&self, agent_id: &str) -> Option<ContainerInfo> {
        self.active.read().await.get(agent_id).cloned()
    }

    pub async fn list_active(&self) -> Vec<ContainerInfo> {
        self.active.read().await.values().cloned().collect()
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Stamp activity on an agent's container.
    pub async fn touch(&self, agent_id: &str) {
        if let Some(info) = self.active.write().await.get_mut(agent_id) {
            info.touch();
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        &s[s.len() - max..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_canonical() {
        assert_eq!(
            ContainerManager::container_name("coder"),
            "praktor-agent-coder"
        );
    }

    #[test]
    fn env_includes_mandatory_and_conditional_vars() {
        let opts = AgentOpts {
            id: "coder".into(),
            workspace: "coder".into(),
            model: "claude-sonnet-4-5".into(),
            image: "worker:latest".into(),
            session_id: Some("sess-1".into()),
            nats_url: "nats://127.0.0.1:4222".into(),
            env: HashMap::from([("EXTRA".to_string(), "1".to_string())]),
            secret_files: Vec::new(),
            allowed_tools: vec!["Bash".into(), "Read".into()],
            nix_enabled: false,
            mounts: Vec::new(),
        };
        let defaults = ManagerDefaults {
            max_running: 5,
            data_dir: "data".into(),
            anthropic_api_key: Some("sk-test".into()),
            oauth_token: None,
            timezone: Some("UTC".into()),
        };
        let env = ContainerManager::build_env(&opts, &defaults);
        assert!(env.contains(&"NATS_URL=nats://127.0.0.1:4222".to_string()));
        assert!(env.contains(&"AGENT_ID=coder".to_string()));
        assert!(env.contains(&"SESSION_ID=sess-1".to_string()));
        assert!(env.contains(&"ANTHROPIC_API_KEY=sk-test".to_string()));
        assert!(env.contains(&"TZ=UTC".to_string()));
        assert!(env.contains(&"EXTRA=1".to_string()));
        assert!(env.contains(&"ALLOWED_TOOLS=Bash,Read".to_string()));
    }

    #[test]
    fn tail_bounds_output() {
        let long = "x".repeat(1000);
        assert_eq!(tail(&long, 512).len(), 512);
        assert_eq!(tail("short", 512), "short");
    }

    #[tokio::test]
    async fn full_fleet_rejects_the_next_start() {
        // The cap check precedes any Docker API call, so this runs
        // without a daemon.
        let manager = ContainerManager::new(ManagerDefaults {
            max_running: 0,
            data_dir: "data".into(),
            anthropic_api_key: None,
            oauth_token: None,
            timezone: None,
        })
        .unwrap();

        let opts = AgentOpts {
            id: "coder".into(),
            workspace: "coder".into(),
            model: String::new(),
            image: "worker:latest".into(),
            session_id: None,
            nats_url: String::new(),
            env: HashMap::new(),
            secret_files: Vec::new(),
            allowed_tools: Vec::new(),
            nix_enabled: false,
            mounts: Vec::new(),
        };
        assert!(matches!(
            manager.start_agent(opts).await.unwrap_err(),
            GatewayError::MaxRunningExceeded(0)
        ));
    }
}
