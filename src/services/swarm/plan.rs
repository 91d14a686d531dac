//! Swarm graph compilation.
//!
//! Bidirectional synapses are collapsed into collab groups with a
//! union-find; the collapsed graph is Kahn-sorted into parallel tiers
//! where a node's depth is its longest path from any source.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::domain::errors::{GatewayError, GatewayResult};
use crate::domain::models::swarm::{SwarmAgent, Synapse};

/// A compiled execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmPlan {
    /// Roles per tier, ascending depth. Tier members run in parallel.
    pub tiers: Vec<Vec<String>>,
    /// Directed-edge predecessors per role; their outputs feed the
    /// role's prompt.
    pub pipeline_inputs: HashMap<String, Vec<String>>,
    /// Collab groups (connected components of the bidirectional
    /// subgraph with at least two members), indexed by group number.
    pub collab_groups: Vec<Vec<String>>,
}

impl SwarmPlan {
    /// Chat group id for a role, when it belongs to a collab group.
    pub fn group_of(&self, role: &str) -> Option<usize> {
        self.collab_groups
            .iter()
            .position(|group| group.iter().any(|r| r == role))
    }

    /// Stable topic segment for a collab group.
    pub fn group_id(index: usize) -> String {
        format!("group-{index}")
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

/// Compile agents + synapses into tiers.
pub fn build_plan(
    agents: &[SwarmAgent],
    synapses: &[Synapse],
    lead_agent: Option<&str>,
) -> GatewayResult<SwarmPlan> {
    let roles: Vec<&str> = agents.iter().map(|a| a.role.as_str()).collect();
    let index_of: HashMap<&str, usize> = roles.iter().enumerate().map(|(i, r)| (*r, i)).collect();

    for synapse in synapses {
        for endpoint in [&synapse.from, &synapse.to] {
            if !index_of.contains_key(endpoint.as_str()) {
                return Err(GatewayError::UnknownRole(endpoint.clone()));
            }
        }
    }
    if let Some(lead) = lead_agent {
        if !index_of.contains_key(lead) {
            return Err(GatewayError::UnknownRole(lead.to_string()));
        }
    }

    // Collab groups: connected components of the bidirectional subgraph.
    let mut uf = UnionFind::new(roles.len());
    for synapse in synapses {
        if synapse.bidirectional {
            uf.union(index_of[synapse.from.as_str()], index_of[synapse.to.as_str()]);
        }
    }

    // Map every role to its component representative.
    let rep_of: Vec<usize> = (0..roles.len()).map(|i| uf.find(i)).collect();

    // Collapse directed synapses between representatives; dedup and drop
    // self-loops.
    let mut edges: HashSet<(usize, usize)> = HashSet::new();
    for synapse in synapses {
        if synapse.bidirectional {
            continue;
        }
        let from = rep_of[index_of[synapse.from.as_str()]];
        let to = rep_of[index_of[synapse.to.as_str()]];
        if from != to {
            edges.insert((from, to));
        }
    }

    let nodes: HashSet<usize> = rep_of.iter().copied().collect();
    let mut adjacency: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut in_degree: HashMap<usize, usize> = nodes.iter().map(|&n| (n, 0)).collect();
    for &(from, to) in &edges {
        adjacency.entry(from).or_default().push(to);
        *in_degree.entry(to).or_default() += 1;
    }

    // Kahn with longest-path depth propagation.
    let mut depth: HashMap<usize, usize> = HashMap::new();
    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&n, _)| n)
        .collect();
    for &n in &queue {
        depth.insert(n, 0);
    }

    let mut processed = 0;
    while let Some(node) = queue.pop_front() {
        processed += 1;
        let node_depth = depth[&node];
        for &next in adjacency.get(&node).into_iter().flatten() {
            let entry = depth.entry(next).or_insert(0);
            *entry = (*entry).max(node_depth + 1);
            if let Some(remaining) = in_degree.get_mut(&next) {
                *remaining -= 1;
                if *remaining == 0 {
                    queue.push_back(next);
                }
            }
        }
    }
    if processed != nodes.len() {
        return Err(GatewayError::CycleDetected);
    }

    // A role inherits its group's depth.
    let mut role_depth: HashMap<&str, usize> = roles
        .iter()
        .enumerate()
        .map(|(i, role)| (*role, depth[&rep_of[i]]))
        .collect();

    // The lead runs alone in the final tier.
    if let Some(lead) = lead_agent {
        let max_depth = role_depth
            .iter()
            .filter(|(role, _)| **role != lead)
            .map(|(_, d)| *d)
            .max()
            .unwrap_or(0);
        role_depth.insert(lead, max_depth + 1);
    }

    let max_depth = role_depth.values().copied().max().unwrap_or(0);
    let mut tiers: Vec<Vec<String>> = vec![Vec::new(); max_depth + 1];
    for role in &roles {
        tiers[role_depth[role]].push((*role).to_string());
    }
    for tier in &mut tiers {
        tier.sort();
    }
    tiers.retain(|tier| !tier.is_empty());

    // Pipeline inputs: directed-edge predecessors per role.
    let mut pipeline_inputs: HashMap<String, Vec<String>> = roles
        .iter()
        .map(|r| ((*r).to_string(), Vec::new()))
        .collect();
    for synapse in synapses {
        if synapse.bidirectional || synapse.from == synapse.to {
            continue;
        }
        if let Some(inputs) = pipeline_inputs.get_mut(synapse.to.as_str()) {
            if !inputs.contains(&synapse.from) {
                inputs.push(synapse.from.clone());
            }
        }
    }
    for inputs in pipeline_inputs.values_mut() {
        inputs.sort();
    }

    // Collab groups with at least two members, in first-seen role order.
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut group_index: HashMap<usize, usize> = HashMap::new();
    for (i, role) in roles.iter().enumerate() {
        let rep = rep_of[i];
        match group_index.get(&rep) {
            Some(&g) => groups[g].push((*role).to_string()),
            None => {
                group_index.insert(rep, groups.len());
                groups.push(vec![(*role).to_string()]);
            }
        }
    }
    let collab_groups: Vec<Vec<String>> = groups
        .into_iter()
        .filter(|g| g.len() >= 2)
        .collect();

    Ok(SwarmPlan {
        tiers,
        pipeline_inputs,
        collab_groups,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(role: &str) -> SwarmAgent {
        SwarmAgent {
            agent_id: "general".into(),
            role: role.into(),
            workspace: None,
            prompt: String::new(),
        }
    }

    fn synapse(from: &str, to: &str, bidirectional: bool) -> Synapse {
        Synapse {
            from: from.into(),
            to: to.into(),
            bidirectional,
        }
    }

    #[test]
    fn fan_out_with_lead() {
        let agents = vec![agent("a"), agent("b"), agent("c"), agent("lead")];
        let plan = build_plan(&agents, &[], Some("lead")).unwrap();
        assert_eq!(plan.tiers, vec![vec!["a", "b", "c"], vec!["lead"]]);
        assert!(plan.collab_groups.is_empty());
        assert!(plan.pipeline_inputs.values().all(Vec::is_empty));
    }

    #[test]
    fn pipeline_chain() {
        let agents = vec![agent("a"), agent("b"), agent("c")];
        let synapses = vec![synapse("a", "b", false), synapse("b", "c", false)];
        let plan = build_plan(&agents, &synapses, Some("c")).unwrap();
        assert_eq!(plan.tiers, vec![vec!["a"], vec!["b"], vec!["c"]]);
        assert_eq!(plan.pipeline_inputs["b"], vec!["a"]);
        assert_eq!(plan.pipeline_inputs["c"], vec!["b"]);
    }

    #[test]
    fn collab_plus_pipeline() {
        let agents = vec![agent("a"), agent("b"), agent("c"), agent("lead")];
        let synapses = vec![
            synapse("a", "b", false),
            synapse("b", "c", true),
            synapse("c", "lead", false),
        ];
        let plan = build_plan(&agents, &synapses, Some("lead")).unwrap();
        assert_eq!(plan.tiers, vec![vec!["a"], vec!["b", "c"], vec!["lead"]]);
        assert_eq!(plan.collab_groups, vec![vec!["b", "c"]]);
        assert_eq!(plan.group_of("b"), Some(0));
        assert_eq!(plan.group_of("c"), Some(0));
        assert_eq!(plan.group_of("a"), None);
        assert_eq!(plan.pipeline_inputs["lead"], vec!["c"]);
    }

    #[test]
    fn cycle_is_detected() {
        let agents = vec![agent("a"), agent("b"), agent("c")];
        let synapses = vec![
            synapse("a", "b", false),
            synapse("b", "c", false),
            synapse("c", "a", false),
        ];
        let err = build_plan(&agents, &synapses, None).unwrap_err();
        assert!(matches!(err, GatewayError::CycleDetected));
    }

    #[test]
    fn unknown_role_is_rejected() {
        let agents = vec![agent("a")];
        let synapses = vec![synapse("a", "ghost", false)];
        assert!(matches!(
            build_plan(&agents, &synapses, None).unwrap_err(),
            GatewayError::UnknownRole(role) if role == "ghost"
        ));
        assert!(matches!(
            build_plan(&agents, &[], Some("ghost")).unwrap_err(),
            GatewayError::UnknownRole(_)
        ));
    }

    #[test]
    fn duplicate_and_self_edges_are_collapsed() {
        let agents = vec![agent("a"), agent("b")];
        let synapses = vec![
            synapse("a", "b", false),
            synapse("a", "b", false),
            synapse("a", "a", false),
        ];
        let plan = build_plan(&agents, &synapses, None).unwrap();
        assert_eq!(plan.tiers, vec![vec!["a"], vec!["b"]]);
        assert_eq!(plan.pipeline_inputs["b"], vec!["a"]);
    }

    #[test]
    fn bidirectional_cycle_inside_group_is_fine() {
        // a <-> b plus a -> b directed collapses to a single node with a
        // dropped self-loop, not a cycle.
        let agents = vec![agent("a"), agent("b")];
        let synapses = vec![synapse("a", "b", true), synapse("a", "b", false)];
        let plan = build_plan(&agents, &synapses, None).unwrap();
        assert_eq!(plan.tiers, vec![vec!["a", "b"]]);
    }

    #[test]
    fn diamond_longest_path_sets_depth() {
        // a -> b -> d, a -> d: d lands at depth 2, not 1.
        let agents = vec![agent("a"), agent("b"), agent("d")];
        let synapses = vec![
            synapse("a", "b", false),
            synapse("b", "d", false),
            synapse("a", "d", false),
        ];
        let plan = build_plan(&agents, &synapses, None).unwrap();
        assert_eq!(plan.tiers, vec![vec!["a"], vec!["b"], vec!["d"]]);
        assert_eq!(plan.pipeline_inputs["d"], vec!["a", "b"]);
    }
}
