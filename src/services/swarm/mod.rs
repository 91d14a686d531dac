//! Short-lived DAGs of cooperating workers.

pub mod plan;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use self::plan::{build_plan, SwarmPlan};
use super::orchestrator::{CollabMembership, SwarmMembershipMap};
use super::provision::Provisioner;
use super::registry::Registry;
use crate::domain::errors::{GatewayError, GatewayResult};
use crate::domain::models::swarm::{RoleResult, SwarmAgent, SwarmRun, SwarmStatus, Synapse};
use crate::infrastructure::bus::topics::{self, EventPayload, InputPayload, OutputKind, OutputPayload};
use crate::infrastructure::bus::Bus;
use crate::infrastructure::docker::ContainerManager;
use crate::infrastructure::store::SwarmRepo;

const ROLE_DEADLINE: Duration = Duration::from_secs(15 * 60);
const TIER_DEADLINE: Duration = Duration::from_secs(30 * 60);
const CLIENT_WAIT_POLL: Duration = Duration::from_millis(250);
const CLIENT_WAIT_DEADLINE: Duration = Duration::from_secs(30);

pub struct SwarmCoordinator {
    registry: Arc<Registry>,
    manager: Arc<ContainerManager>,
    provisioner: Arc<Provisioner>,
    bus: Bus,
    swarm_repo: Arc<SwarmRepo>,
    membership: SwarmMembershipMap,
    cancel: CancellationToken,
}

impl SwarmCoordinator {
    pub fn new(
        registry: Arc<Registry>,
        manager: Arc<ContainerManager>,
        provisioner: Arc<Provisioner>,
        bus: Bus,
        swarm_repo: Arc<SwarmRepo>,
        membership: SwarmMembershipMap,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            manager,
            provisioner,
            bus,
            swarm_repo,
            membership,
            cancel,
        }
    }

    /// Ad-hoc swarm for a bare `@swarm <task>` chat message: every
    /// registered agent fans out in one tier and the default agent
    /// synthesizes.
    pub async fn run_from_prompt(
        self: &Arc<Self>,
        task: &str,
        lead_agent_id: &str,
    ) -> GatewayResult<SwarmRun> {
        let agents: Vec<SwarmAgent> = self
            .registry
            .ids()
            .await
            .into_iter()
            .map(|id| SwarmAgent {
                agent_id: id.clone(),
                role: id,
                workspace: None,
                prompt: String::new(),
            })
            .collect();
        if agents.is_empty() {
            return Err(GatewayError::NoDefault);
        }
        let run = SwarmRun::new("ad-hoc", task, agents, Vec::<Synapse>::new(), Some(lead_agent_id.to_string()));
        self.execute(run).await
    }

    /// Compile and execute a swarm run to completion, persisting the
    /// outcome. Returns the finished run.
    pub async fn execute(self: &Arc<Self>, mut run: SwarmRun) -> GatewayResult<SwarmRun> {
        // Validate roles against the registry before compiling.
        for agent in &run.agents {
            if !self.registry.contains(&agent.agent_id).await {
                return Err(GatewayError::UnknownAgent(agent.agent_id.clone()));
            }
        }
        let plan = build_plan(&run.agents, &run.synapses, run.lead_agent.as_deref())?;

        self.swarm_repo.insert(&run).await?;
        let swarm_id = run.id.to_string();
        self.publish_event(
            &swarm_id,
            "started",
            json!({"name": run.name, "tiers": plan.tiers}),
        )
        .await;

        let agents_by_role: HashMap<&str, &SwarmAgent> =
            run.agents.iter().map(|a| (a.role.as_str(), a)).collect();

        let mut outputs: HashMap<String, String> = HashMap::new();
        let mut results: Vec<RoleResult> = Vec::new();
        let mut failed = false;

        for (tier_index, tier) in plan.tiers.iter().enumerate() {
            let role_futures = tier.iter().map(|role| {
                let agent = agents_by_role[role.as_str()];
                let prompt = build_role_prompt(&run, agent, &plan, &outputs);
                self.execute_role(&run, agent, &plan, prompt)
            });

            let tier_run = futures::future::join_all(role_futures);
            let tier_results = tokio::select! {
                () = self.cancel.cancelled() => {
                    warn!(swarm_id = %swarm_id, "swarm cancelled mid-tier");
                    failed = true;
                    break;
                }
                outcome = tokio::time::timeout(TIER_DEADLINE, tier_run) => match outcome {
                    Ok(tier_results) => tier_results,
                    Err(_) => {
                        warn!(swarm_id = %swarm_id, tier = tier_index, "tier deadline exceeded");
                        failed = true;
                        break;
                    }
                }
            };

            for result in tier_results {
                self.publish_event(
                    &swarm_id,
                    "role_completed",
                    json!({"role": result.role, "status": result.status}),
                )
                .await;
                if result.status == crate::domain::models::swarm::RoleStatus::Success {
                    outputs.insert(result.role.clone(), result.output.clone());
                }
                results.push(result);
            }
            self.publish_event(&swarm_id, "tier_completed", json!({"tier": tier_index}))
                .await;
        }

        run.status = if failed {
            SwarmStatus::Failed
        } else {
            SwarmStatus::Completed
        };
        run.results = results;
        self.swarm_repo
            .finish(run.id, run.status, &run.results)
            .await?;
        self.publish_event(&swarm_id, "completed", json!({"status": run.status}))
            .await;
        info!(swarm_id = %swarm_id, status = run.status.as_str(), "swarm finished");
        Ok(run)
    }

    /// Run one role: transient worker up, prompt in, single result out,
    /// worker down.
    async fn execute_role(
        &self,
        run: &SwarmRun,
        agent: &SwarmAgent,
        plan: &SwarmPlan,
        prompt: String,
    ) -> RoleResult {
        let worker_id = format!("swarm-{}-{}", run.short_id(), agent.role);
        match self.run_worker(run, agent, plan, &worker_id, &prompt).await {
            Ok(output) => RoleResult::success(&agent.role, output),
            Err(e) => {
                warn!(worker_id = %worker_id, error = %e, "swarm role failed");
                RoleResult::error(&agent.role, e.to_string())
            }
        }
    }

    async fn run_worker(
        &self,
        run: &SwarmRun,
        agent: &SwarmAgent,
        plan: &SwarmPlan,
        worker_id: &str,
        prompt: &str,
    ) -> GatewayResult<String> {
        let swarm_id = run.id.to_string();
        let mut extra_env = HashMap::from([
            ("SWARM_ID".to_string(), swarm_id.clone()),
            ("SWARM_ROLE".to_string(), agent.role.clone()),
        ]);

        // Collab members get a shared chat topic and a membership entry
        // the orchestrator's IPC dispatcher consults.
        let membership = plan.group_of(&agent.role).map(|index| {
            let group_id = SwarmPlan::group_id(index);
            CollabMembership {
                swarm_id: swarm_id.clone(),
                chat_topic: topics::swarm_chat(&swarm_id, &group_id),
                group_id,
            }
        });
        if let Some(membership) = &membership {
            extra_env.insert(
                "SWARM_CHAT_TOPIC".to_string(),
                membership.chat_topic.clone(),
            );
            self.membership
                .write()
                .await
                .insert(worker_id.to_string(), membership.clone());
        }

        let result = self
            .run_worker_inner(agent, worker_id, prompt, extra_env)
            .await;

        // Teardown happens on every exit path.
        if membership.is_some() {
            self.membership.write().await.remove(worker_id);
        }
        if let Err(e) = self.manager.stop_agent(worker_id).await {
            debug!(worker_id, error = %e, "swarm worker stop failed");
        }
        result
    }

    async fn run_worker_inner(
        &self,
        agent: &SwarmAgent,
        worker_id: &str,
        prompt: &str,
        extra_env: HashMap<String, String>,
    ) -> GatewayResult<String> {
        let def = self
            .registry
            .get(&agent.agent_id)
            .await
            .ok_or_else(|| GatewayError::UnknownAgent(agent.agent_id.clone()))?;
        let opts = self
            .provisioner
            .agent_opts(
                &def,
                worker_id,
                None,
                extra_env,
                agent.workspace.clone().or_else(|| Some(worker_id.to_string())),
            )
            .await?;

        let baseline = self.bus.num_clients().await.unwrap_or(0);
        self.manager.start_agent(opts).await?;
        self.wait_for_new_client(baseline).await;

        // Subscribe before publishing so the result cannot slip past.
        let mut subscription = self.bus.subscribe(&topics::agent_output(worker_id)).await?;
        let payload = InputPayload {
            text: prompt.to_string(),
            session_id: String::new(),
            meta: json!({"sender": "swarm", "role": agent.role}),
        };
        self.bus
            .publish_retry(&topics::agent_input(worker_id), &payload)
            .await?;

        let await_result = async {
            while let Some(message) = subscription.next().await {
                let Ok(output) = serde_json::from_slice::<OutputPayload>(&message.payload) else {
                    continue;
                };
                match output.kind {
                    OutputKind::Result => return Ok(output.content),
                    OutputKind::Error => {
                        return Err(GatewayError::ResultError {
                            agent_id: worker_id.to_string(),
                            reason: output.content,
                        })
                    }
                    OutputKind::Text => {}
                }
            }
            Err(GatewayError::ResultError {
                agent_id: worker_id.to_string(),
                reason: "output stream closed".into(),
            })
        };

        match tokio::time::timeout(ROLE_DEADLINE, await_result).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::WorkerTimeout {
                agent_id: worker_id.to_string(),
            }),
        }
    }

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
    }

    async fn publish_event(&self, swarm_id: &str, kind: &str, data: Value) {
        let event = EventPayload::new(kind, data);
        if let Err(e) = self
            .bus
            .publish(&topics::events_swarm(swarm_id), &event)
            .await
        {
            debug!(swarm_id, error = %e, "failed to publish swarm event");
        }
    }
}

/// Assemble a role's prompt: the task, its own prompt, the outputs of
/// its pipeline predecessors, and for the lead a synthesis preamble
/// with every other role's output.
fn build_role_prompt(
    run: &SwarmRun,
    agent: &SwarmAgent,
    plan: &SwarmPlan,
    outputs: &HashMap<String, String>,
) -> String {
    let mut prompt = format!("# Task\n{}\n", run.task);

    if !agent.prompt.is_empty() {
        prompt.push_str(&format!("\n# Your role: {}\n{}\n", agent.role, agent.prompt));
    } else {
        prompt.push_str(&format!("\n# Your role: {}\n", agent.role));
    }

    if let Some(inputs) = plan.pipeline_inputs.get(&agent.role) {
        for predecessor in inputs {
            if let Some(output) = outputs.get(predecessor) {
                prompt.push_str(&format!("\n# Output from {predecessor}\n{output}\n"));
            }
        }
    }

    if run.lead_agent.as_deref() == Some(agent.role.as_str()) {
        prompt.push_str(
            "\n# Synthesis\nYou are the lead agent. Combine the outputs below \
             into the final answer for the task.\n",
        );
        let mut roles: Vec<&String> = outputs.keys().collect();
        roles.sort();
        for role in roles {
            if role != &agent.role {
                prompt.push_str(&format!("\n## {role}\n{}\n", outputs[role]));
            }
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(agents: Vec<SwarmAgent>, synapses: Vec<Synapse>, lead: Option<&str>) -> SwarmRun {
        SwarmRun::new("t", "solve it", agents, synapses, lead.map(String::from))
    }

    fn agent(role: &str, prompt: &str) -> SwarmAgent {
        SwarmAgent {
            agent_id: "general".into(),
            role: role.into(),
            workspace: None,
            prompt: prompt.into(),
        }
    }

    #[test]
    fn role_prompt_includes_pipeline_outputs() {
        let run = run_with(
            vec![agent("a", ""), agent("b", "review the draft")],
            vec![Synapse {
                from: "a".into(),
                to: "b".into(),
                bidirectional: false,
            }],
            None,
        );
        let plan = build_plan(&run.agents, &run.synapses, None).unwrap();
        let outputs = HashMap::from([("a".to_string(), "the draft".to_string())]);

        let prompt = build_role_prompt(&run, &run.agents[1], &plan, &outputs);
        assert!(prompt.contains("# Task\nsolve it"));
        assert!(prompt.contains("review the draft"));
        assert!(prompt.contains("# Output from a\nthe draft"));
    }

    #[test]
    fn lead_prompt_synthesizes_all_outputs() {
        let run = run_with(
            vec![agent("a", ""), agent("b", ""), agent("lead", "")],
            Vec::new(),
            Some("lead"),
        );
        let plan = build_plan(&run.agents, &run.synapses, Some("lead")).unwrap();
        let outputs = HashMap::from([
            ("a".to_string(), "alpha out".to_string()),
            ("b".to_string(), "beta out".to_string()),
        ]);

        let prompt = build_role_prompt(&run, &run.agents[2], &plan, &outputs);
        assert!(prompt.contains("# Synthesis"));
        assert!(prompt.contains("## a\nalpha out"));
        assert!(prompt.contains("## b\nbeta out"));
    }

    #[test]
    fn non_lead_gets_no_synthesis() {
        let run = run_with(vec![agent("a", ""), agent("lead", "")], Vec::new(), Some("lead"));
        let plan = build_plan(&run.agents, &run.synapses, Some("lead")).unwrap();
        let prompt = build_role_prompt(&run, &run.agents[0], &plan, &HashMap::new());
        assert!(!prompt.contains("# Synthesis"));
    }
}
