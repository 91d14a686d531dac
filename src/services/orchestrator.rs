//! Maps chat messages onto live worker containers.
//!
//! One in-memory entry per agent id serializes container creation and
//! input publication; worker output is pumped through a process-wide
//! listener callback set once at composition time.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::provision::Provisioner;
use super::registry::Registry;
use super::router::RoutePicker;
use crate::domain::errors::{GatewayError, GatewayResult};
use crate::domain::models::message::{MessageDirection, StoredMessage};
use crate::domain::models::schedule::Schedule;
use crate::domain::models::session::Session;
use crate::domain::models::task::ScheduledTask;
use crate::infrastructure::bus::topics::{
    self, ChatPayload, ControlAction, ControlPayload, EventPayload, InputPayload, IpcRequest,
    OutputKind, OutputPayload,
};
use crate::infrastructure::bus::Bus;
use crate::infrastructure::docker::ContainerManager;
use crate::infrastructure::store::{MessageRepo, SessionRepo, TaskRepo};

/// Process-wide sink for worker output. Must be cheap and non-blocking.
pub type OutputListener = Arc<dyn Fn(&str, &OutputPayload, &Value) + Send + Sync>;

/// Handler for an IPC tool registered by an external adapter.
pub type IpcToolHandler =
    Arc<dyn Fn(Value) -> futures::future::BoxFuture<'static, Value> + Send + Sync>;

/// A live swarm worker's collab-chat membership.
#[derive(Debug, Clone)]
pub struct CollabMembership {
    pub swarm_id: String,
    pub group_id: String,
    pub chat_topic: String,
}

/// Worker id → membership, shared between the orchestrator's IPC
/// dispatcher and the swarm coordinator.
pub type SwarmMembershipMap = Arc<RwLock<HashMap<String, CollabMembership>>>;

const CLIENT_WAIT_POLL: Duration = Duration::from_millis(250);
const CLIENT_WAIT_DEADLINE: Duration = Duration::from_secs(30);
const IDLE_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const NIX_GC_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
const IPC_HANDLER_DEADLINE: Duration = Duration::from_secs(10);

/// Transient swarm workers carry this prefix and are reaped by the
/// coordinator, not the idle loop.
const SWARM_WORKER_PREFIX: &str = "swarm-";

#[derive(Default)]
struct AgentState {
    session_id: String,
    last_meta: Value,
    output_subscribed: bool,
}

struct AgentEntry {
    input_mutex: Mutex<()>,
    state: Mutex<AgentState>,
}

impl AgentEntry {
    fn new() -> Self {
        Self {
            input_mutex: Mutex::new(()),
            state: Mutex::new(AgentState::default()),
        }
    }
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    manager: Arc<ContainerManager>,
    provisioner: Arc<Provisioner>,
    bus: Bus,
    session_repo: Arc<SessionRepo>,
    task_repo: Arc<TaskRepo>,
    message_repo: Arc<MessageRepo>,
    agents: RwLock<HashMap<String, Arc<AgentEntry>>>,
    listener: RwLock<Option<OutputListener>>,
    ipc_tools: RwLock<HashMap<String, IpcToolHandler>>,
    extension_status: RwLock<Value>,
    swarm_membership: SwarmMembershipMap,
    idle_timeout: RwLock<Duration>,
    cancel: CancellationToken,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        manager: Arc<ContainerManager>,
        provisioner: Arc<Provisioner>,
        bus: Bus,
        session_repo: Arc<SessionRepo>,
        task_repo: Arc<TaskRepo>,
        message_repo: Arc<MessageRepo>,
        swarm_membership: SwarmMembershipMap,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            manager,
            provisioner,
            bus,
            session_repo,
            task_repo,
            message_repo,
            agents: RwLock::new(HashMap::new()),
            listener: RwLock::new(None),
            ipc_tools: RwLock::new(HashMap::new()),
            extension_status: RwLock::new(json!({})),
            swarm_membership,
            idle_timeout: RwLock::new(idle_timeout),
            cancel,
        }
    }

    /// Set the single output sink. Called once at composition time by
    /// the chat adapter.
    pub async fn set_output_listener(&self, listener: OutputListener) {
        *self.listener.write().await = Some(listener);
    }

    pub async fn has_output_listener(&self) -> bool {
        self.listener.read().await.is_some()
    }

    /// Register an additional IPC tool (chat-adapter extension point).
    pub async fn register_ipc_tool(&self, name: impl Into<String>, handler: IpcToolHandler) {
        self.ipc_tools.write().await.insert(name.into(), handler);
    }

    /// Update the cached `extension_status` IPC answer.
    pub async fn set_extension_status(&self, status: Value) {
        *self.extension_status.write().await = status;
    }

    pub async fn set_idle_timeout(&self, idle_timeout: Duration) {
        *self.idle_timeout.write().await = idle_timeout;
    }

    async fn entry(&self, agent_id: &str) -> Arc<AgentEntry> {
        if let Some(entry) = self.agents.read().await.get(agent_id) {
            return entry.clone();
        }
        let mut agents = self.agents.write().await;
        agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(AgentEntry::new()))
            .clone()
    }

    /// Route a user message to the agent's worker. The reply is
    /// asynchronous: it arrives through the output listener.
    pub async fn handle_message(
        self: &Arc<Self>,
        agent_id: &str,
        text: &str,
        meta: Value,
    ) -> GatewayResult<()> {
        let Some(_def) = self.registry.get(agent_id).await else {
            return Err(GatewayError::UnknownAgent(agent_id.to_string()));
        };
        // An empty prompt (bare "@name") is a no-op, not a greeting.
        if text.trim().is_empty() {
            return Ok(());
        }

        let entry = self.entry(agent_id).await;
        let _input_guard = entry.input_mutex.lock().await;

        let session_id = self.ensure_worker(agent_id, &entry).await?;

        {
            let mut state = entry.state.lock().await;
            state.last_meta = meta.clone();
        }

        let payload = InputPayload {
            text: text.to_string(),
            session_id,
            meta: meta.clone(),
        };
        self.bus
            .publish_retry(&topics::agent_input(agent_id), &payload)
            .await?;

        self.manager.touch(agent_id).await;
        let mut session = self
            .session_repo
            .get(agent_id)
            .await?
            .unwrap_or_else(|| Session::fresh(agent_id));
        session.last_seen = chrono::Utc::now();
        self.session_repo.put(&session).await?;

        if let Err(e) = self
            .message_repo
            .append(&StoredMessage::new(
                agent_id,
                MessageDirection::Inbound,
                text,
                meta,
            ))
            .await
        {
            warn!(agent_id, error = %e, "failed to log inbound message");
        }
        Ok(())
    }

    /// Make sure a worker container is live and its pumps are running;
    /// returns the current session id.
    async fn ensure_worker(
        self: &Arc<Self>,
        agent_id: &str,
        entry: &Arc<AgentEntry>,
    ) -> GatewayResult<String> {
        let session_id = {
            let mut state = entry.state.lock().await;
            if state.session_id.is_empty() {
                let session = match self.session_repo.get(agent_id).await? {
                    Some(session) => session,
                    None => {
                        let session = Session::fresh(agent_id);
                        self.session_repo.put(&session).await?;
                        session
                    }
                };
                state.session_id = session.session_id;
            }
            state.session_id.clone()
        };

        if self.manager.get(agent_id).await.is_none() {
            let def = self
                .registry
                .get(agent_id)
                .await
                .ok_or_else(|| GatewayError::UnknownAgent(agent_id.to_string()))?;
            let opts = self
                .provisioner
                .agent_opts(&def, agent_id, Some(session_id.clone()), HashMap::new(), None)
                .await?;

            let baseline = self.bus.num_clients().await.unwrap_or(0);
            match self.manager.start_agent(opts).await {
                Ok(_) => {}
                Err(e) => {
                    self.publish_agent_event(
                        agent_id,
                        "start_failed",
                        json!({"error": e.to_string()}),
                    )
                    .await;
                    return Err(e);
                }
            }
            self.wait_for_new_client(baseline).await;
            self.publish_agent_event(agent_id, "started", json!({"session_id": session_id}))
                .await;
        }

        let needs_subscription = {
            let mut state = entry.state.lock().await;
            if state.output_subscribed {
                false
            } else {
                state.output_subscribed = true;
                true
            }
        };
        if needs_subscription {
            self.spawn_output_pump(agent_id.to_string(), entry.clone())
                .await?;
        }
        Ok(session_id)
    }

    /// Best-effort wait for the worker to connect to the bus: poll the
    /// client count until it exceeds the pre-start baseline. Proceeds on
    /// deadline; never used as a correctness gate.
    async fn wait_for_new_client(&self, baseline: u64) {
        let deadline = tokio::time::Instant::now() + CLIENT_WAIT_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            if let Ok(count) = self.bus.num_clients().await {
                if count > baseline {
                    return;
                }
            }
            tokio::time::sleep(CLIENT_WAIT_POLL).await;
        }
        debug!("worker did not register on the bus before the deadline, proceeding");
    }

    async fn spawn_output_pump(
        self: &Arc<Self>,
        agent_id: String,
        entry: Arc<AgentEntry>,
    ) -> GatewayResult<()> {
        let mut subscription = self.bus.subscribe(&topics::agent_output(&agent_id)).await?;
        let orchestrator = Arc::clone(self);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    message = subscription.next() => {
                        let Some(message) = message else { break };
                        let payload: OutputPayload = match serde_json::from_slice(&message.payload) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(agent_id = %agent_id, error = %e, "undecodable output payload");
                                continue;
                            }
                        };
                        let meta = entry.state.lock().await.last_meta.clone();
                        orchestrator.dispatch_output(&agent_id, payload, meta).await;
                    }
                }
            }
            debug!(agent_id = %agent_id, "output pump stopped");
        });
        Ok(())
    }

    async fn dispatch_output(&self, agent_id: &str, payload: OutputPayload, meta: Value) {
        self.manager.touch(agent_id).await;

        let listener_payload = if payload.kind == OutputKind::Error {
            // Operators get the raw error; chat users get the apology.
            self.publish_agent_event(agent_id, "worker_error", json!({"error": payload.content}))
                .await;
            OutputPayload {
                kind: OutputKind::Error,
                content: GatewayError::CHAT_APOLOGY.to_string(),
            }
        } else {
            if let Err(e) = self
                .message_repo
                .append(&StoredMessage::new(
                    agent_id,
                    MessageDirection::Outbound,
                    &payload.content,
                    meta.clone(),
                ))
                .await
            {
                warn!(agent_id, error = %e, "failed to log outbound message");
            }
            payload
        };

        let listener = self.listener.read().await.clone();
        if let Some(listener) = listener {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
                listener(agent_id, &listener_payload, &meta);
            }));
            if result.is_err() {
                error!(agent_id, "output listener panicked");
            }
        }
    }

    /// Serve `host.ipc.*` request/reply for every worker, including
    /// transient swarm workers. One wildcard subscription; the worker id
    /// comes from the subject. Each request is answered within the
    /// 10-second deadline.
    pub async fn run_ipc_bridge(self: Arc<Self>) -> GatewayResult<()> {
        let mut subscription = self.bus.subscribe("host.ipc.>").await?;
        loop {
            let message = tokio::select! {
                () = self.cancel.cancelled() => break,
                message = subscription.next() => {
                    let Some(message) = message else { break };
                    message
                }
            };
            let Some(worker_id) = message.subject.as_str().strip_prefix("host.ipc.") else {
                continue;
            };
            let worker_id = worker_id.to_string();
            let Some(reply_to) = message.reply.clone() else {
                warn!(worker_id, "ipc request without reply subject");
                continue;
            };
            let reply = match serde_json::from_slice::<IpcRequest>(&message.payload) {
                Ok(request) => {
                    match tokio::time::timeout(
                        IPC_HANDLER_DEADLINE,
                        self.dispatch_ipc(&worker_id, request),
                    )
                    .await
                    {
                        Ok(reply) => reply,
                        Err(_) => json!({"ok": false, "error": "handler timed out"}),
                    }
                }
                Err(e) => json!({"ok": false, "error": format!("bad request: {e}")}),
            };
            let bytes = serde_json::to_vec(&reply).unwrap_or_else(|_| b"{}".to_vec());
            if let Err(e) = self.bus.publish_bytes(reply_to.as_str(), bytes.into()).await {
                warn!(worker_id, error = %e, "failed to answer ipc request");
            }
        }
        debug!("ipc bridge stopped");
        Ok(())
    }

    async fn dispatch_ipc(&self, agent_id: &str, request: IpcRequest) -> Value {
        match request.kind.as_str() {
            "create_task" => self.ipc_create_task(agent_id, request.payload).await,
            "list_tasks" => self.ipc_list_tasks(agent_id).await,
            "delete_task" => self.ipc_delete_task(request.payload).await,
            "read_user_md" => match self.registry.read_user_md() {
                Ok(content) => json!({"ok": true, "content": content}),
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            },
            "update_user_md" => {
                let content = request.payload["content"].as_str().unwrap_or_default();
                match self.registry.update_user_md(content) {
                    Ok(()) => json!({"ok": true}),
                    Err(e) => json!({"ok": false, "error": e.to_string()}),
                }
            }
            "extension_status" => {
                json!({"ok": true, "status": self.extension_status.read().await.clone()})
            }
            "swarm_chat" => self.ipc_swarm_chat(agent_id, request.payload).await,
            other => {
                let handler = self.ipc_tools.read().await.get(other).cloned();
                match handler {
                    Some(handler) => handler(request.payload).await,
                    None => json!({"error": "unknown type"}),
                }
            }
        }
    }

    async fn ipc_create_task(&self, agent_id: &str, payload: Value) -> Value {
        let name = payload["name"].as_str().unwrap_or("unnamed").to_string();
        let prompt = payload["prompt"].as_str().unwrap_or_default().to_string();
        let target = payload["agent_id"].as_str().unwrap_or(agent_id).to_string();
        let schedule = match Schedule::normalize(&payload["schedule"]) {
            Ok(schedule) => schedule,
            Err(e) => return json!({"ok": false, "error": e.to_string()}),
        };
        let task = match ScheduledTask::new(target, name, schedule, prompt) {
            Ok(task) => task,
            Err(e) => return json!({"ok": false, "error": e.to_string()}),
        };
        match self.task_repo.insert(&task).await {
            Ok(()) => json!({"ok": true, "id": task.id}),
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        }
    }

    async fn ipc_list_tasks(&self, agent_id: &str) -> Value {
        match self.task_repo.list(Some(agent_id)).await {
            Ok(tasks) => {
                let tasks: Vec<Value> = tasks
                    .iter()
                    .map(|t| {
                        json!({
                            "id": t.id,
                            "name": t.name,
                            "schedule": t.schedule,
                            "status": t.status,
                            "next_run_at": t.next_run_at,
                        })
                    })
                    .collect();
                json!({"ok": true, "tasks": tasks})
            }
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        }
    }

    async fn ipc_delete_task(&self, payload: Value) -> Value {
        let Some(id) = payload["id"].as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
            return json!({"ok": false, "error": "missing or invalid task id"});
        };
        match self.task_repo.delete(id).await {
            Ok(deleted) => json!({"ok": true, "deleted": deleted}),
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        }
    }

    /// Let a swarm worker post into its collab group's chat topic.
    async fn ipc_swarm_chat(&self, worker_id: &str, payload: Value) -> Value {
        let membership = self.swarm_membership.read().await.get(worker_id).cloned();
        let Some(membership) = membership else {
            return json!({"ok": false, "error": "not a collab group member"});
        };
        let content = payload["content"].as_str().unwrap_or_default().to_string();
        let chat = ChatPayload {
            from: worker_id.to_string(),
            content,
        };
        match self.bus.publish(&membership.chat_topic, &chat).await {
            Ok(()) => json!({"ok": true}),
            Err(e) => json!({"ok": false, "error": e.to_string()}),
        }
    }

    /// Rotate the session token and tell the worker to reset its
    /// conversation.
    pub async fn clear_session(&self, agent_id: &str) -> GatewayResult<()> {
        if !self.registry.contains(agent_id).await {
            return Err(GatewayError::UnknownAgent(agent_id.to_string()));
        }
        let entry = self.entry(agent_id).await;
        let session = Session::fresh(agent_id);
        {
            let mut state = entry.state.lock().await;
            state.session_id = session.session_id.clone();
        }
        self.session_repo.put(&session).await?;
        self.bus
            .publish_retry(
                &topics::agent_control(agent_id),
                &ControlPayload {
                    action: ControlAction::Reset,
                },
            )
            .await?;
        self.publish_agent_event(agent_id, "session_cleared", json!({})).await;
        Ok(())
    }

    /// Cancel the in-flight turn without stopping the container.
    pub async fn abort_session(&self, agent_id: &str) -> GatewayResult<()> {
        if !self.registry.contains(agent_id).await {
            return Err(GatewayError::UnknownAgent(agent_id.to_string()));
        }
        self.bus
            .publish_retry(
                &topics::agent_control(agent_id),
                &ControlPayload {
                    action: ControlAction::Cancel,
                },
            )
            .await
    }

    /// Stop an agent's container (config reload, removal). Session
    /// state stays in the store for a lazy respawn.
    pub async fn stop_agent(&self, agent_id: &str) -> GatewayResult<()> {
        self.manager.stop_agent(agent_id).await?;
        let entry = self.entry(agent_id).await;
        entry.state.lock().await.session_id.clear();
        self.publish_agent_event(agent_id, "stopped", json!({})).await;
        Ok(())
    }

    /// Drop the in-memory entry for a removed agent.
    pub async fn forget_agent(&self, agent_id: &str) {
        self.agents.write().await.remove(agent_id);
    }

    async fn publish_agent_event(&self, agent_id: &str, kind: &str, data: Value) {
        let event = EventPayload::new(kind, data);
        if let Err(e) = self.bus.publish(&topics::events_agent(agent_id), &event).await {
            debug!(agent_id, error = %e, "failed to publish agent event");
        }
    }

    /// Stop containers whose last activity predates the idle timeout.
    /// One pass per minute; a container is stopped at most one tick
    /// after it crosses the threshold.
    pub async fn run_idle_reaper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(IDLE_SCAN_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let idle_timeout = *self.idle_timeout.read().await;
            let now = chrono::Utc::now();
            for info in self.manager.list_active().await {
                if info.agent_id.starts_with(SWARM_WORKER_PREFIX) {
                    continue;
                }
                if info.is_idle(idle_timeout, now) {
                    info!(agent_id = %info.agent_id, "stopping idle worker");
                    if let Err(e) = self.stop_agent(&info.agent_id).await {
                        warn!(agent_id = %info.agent_id, error = %e, "idle stop failed");
                    }
                }
            }
        }
        debug!("idle reaper stopped");
    }

    /// Daily garbage collection inside nix-enabled workers. Best
    /// effort; failures only log.
    pub async fn run_nix_gc(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(NIX_GC_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so boot stays quiet.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            for agent_id in self.registry.nix_enabled_ids().await {
                if self.manager.get(&agent_id).await.is_none() {
                    continue;
                }
                match self
                    .manager
                    .exec(&agent_id, vec!["nix-collect-garbage", "-d"])
                    .await
                {
                    Ok(_) => info!(agent_id = %agent_id, "nix gc completed"),
                    Err(e) => warn!(agent_id = %agent_id, error = %e, "nix gc failed"),
                }
            }
        }
    }
}

#[async_trait]
impl RoutePicker for Arc<Orchestrator> {
    /// LLM dispatch over `agent.{id}.route` with the bus request
    /// deadline. Spawns the routing agent's worker when necessary.
    async fn pick_route(&self, agent_id: &str, prompt: &str) -> GatewayResult<String> {
        {
            let entry = self.entry(agent_id).await;
            let _input_guard = entry.input_mutex.lock().await;
            self.ensure_worker(agent_id, &entry).await?;
        }
        let answer: Value = self
            .bus
            .request(&topics::agent_route(agent_id), &json!({"text": prompt}))
            .await?;
        match answer {
            Value::String(token) => Ok(token),
            Value::Object(map) => map
                .get("agent")
                .and_then(Value::as_str)
                .map(ToString::to_string)
                .ok_or_else(|| GatewayError::ResultError {
                    agent_id: agent_id.to_string(),
                    reason: "route reply missing agent field".into(),
                }),
            other => Err(GatewayError::ResultError {
                agent_id: agent_id.to_string(),
                reason: format!("unexpected route reply: {other}"),
            }),
        }
    }
}
