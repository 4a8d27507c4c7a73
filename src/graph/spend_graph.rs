//! The live in-memory spend graph: per-agent nodes plus bilateral flow edges,
//! guarded by a single graph-wide readers-writer lock.
//!
//! A single lock is simpler than per-node sharding at this scale and keeps
//! every invariant trivially provable under the write lock; reads (`get_node`,
//! `get_edge`, `has_cyclic_flow`) take the read lock only.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::amount::UsdcAmount;
use crate::graph::edge::{edge_key, FlowEdge, FlowEdgeSnapshot};
use crate::graph::node::{AgentNode, AgentNodeSnapshot};

type EdgeKey = (String, String);

#[derive(Default)]
struct GraphState {
    nodes: HashMap<String, AgentNode>,
    edges: HashMap<EdgeKey, FlowEdge>,
}

/// Owns all per-agent nodes and bilateral edges. All addresses are
/// lower-cased on entry so callers never need to normalize themselves.
pub struct SpendGraph {
    state: RwLock<GraphState>,
}

impl SpendGraph {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::default()),
        }
    }

    /// Record velocity-window and edge activity for a settled or reserved spend.
    pub fn record_event(&self, agent: &str, counterparty: &str, amount: UsdcAmount, now: DateTime<Utc>) {
        let agent = agent.to_lowercase();
        let mut state = self.state.write();
        state
            .nodes
            .entry(agent.clone())
            .or_default()
            .record_spend(amount, now);

        if !counterparty.is_empty() {
            Self::touch_edge(&mut state, &agent, counterparty, amount, now);
        }
    }

    /// Like `record_event` but touches only the edge, not velocity windows —
    /// used by settlement paths where the spend was already counted toward
    /// velocity at acquire time, to avoid double-counting.
    pub fn record_edge_only(&self, agent: &str, counterparty: &str, amount: UsdcAmount, now: DateTime<Utc>) {
        if counterparty.is_empty() {
            return;
        }
        let agent = agent.to_lowercase();
        let mut state = self.state.write();
        Self::touch_edge(&mut state, &agent, counterparty, amount, now);
    }

    fn touch_edge(state: &mut GraphState, agent: &str, counterparty: &str, amount: UsdcAmount, now: DateTime<Utc>) {
        let key = edge_key(agent, counterparty);
        state
            .edges
            .entry(key)
            .and_modify(|edge| edge.update(amount, now))
            .or_insert_with(|| FlowEdge::new(amount, now));
    }

    pub fn get_node(&self, agent: &str, now: DateTime<Utc>) -> Option<AgentNodeSnapshot> {
        let agent = agent.to_lowercase();
        let state = self.state.read();
        state.nodes.get(&agent).map(|node| AgentNodeSnapshot::from_node(node, now))
    }

    pub fn get_edge(&self, from: &str, to: &str) -> Option<FlowEdgeSnapshot> {
        let key = edge_key(from, to);
        let state = self.state.read();
        state.edges.get(&key).map(FlowEdgeSnapshot::from)
    }

    pub fn try_acquire_hold(&self, agent: &str, limit: u32) -> bool {
        let agent = agent.to_lowercase();
        let mut state = self.state.write();
        state.nodes.entry(agent).or_default().try_acquire_hold(limit)
    }

    pub fn try_acquire_escrow(&self, agent: &str, limit: u32) -> bool {
        let agent = agent.to_lowercase();
        let mut state = self.state.write();
        state.nodes.entry(agent).or_default().try_acquire_escrow(limit)
    }

    /// Returns false (an underflow signal) iff the counter was already zero.
    /// The caller is responsible for logging the underflow as a bug.
    pub fn release_active_hold(&self, agent: &str) -> bool {
        let agent = agent.to_lowercase();
        let mut state = self.state.write();
        match state.nodes.get_mut(&agent) {
            Some(node) => node.release_active_hold(),
            None => false,
        }
    }

    pub fn release_active_escrow(&self, agent: &str) -> bool {
        let agent = agent.to_lowercase();
        let mut state = self.state.write();
        match state.nodes.get_mut(&agent) {
            Some(node) => node.release_active_escrow(),
            None => false,
        }
    }

    /// DFS from `start` over edges with at least one event newer than
    /// `now - window`, looking for a path of length >= 2 that returns to
    /// `start`. Returns the first cycle found, in path order.
    pub fn has_cyclic_flow(&self, start: &str, window: Duration, now: DateTime<Utc>) -> Option<Vec<String>> {
        let start = start.to_lowercase();
        let state = self.state.read();

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for ((from, to), edge) in &state.edges {
            if edge.has_recent_event(now, window) {
                adjacency.entry(from.as_str()).or_default().push(to.as_str());
            }
        }

        let mut path = vec![start.as_str()];
        let mut visited = HashSet::new();
        visited.insert(start.as_str());

        Self::dfs_cycle(&adjacency, &start, &mut path, &mut visited)
            .map(|p| p.into_iter().map(str::to_string).collect())
    }

    fn dfs_cycle<'a>(
        adjacency: &HashMap<&'a str, Vec<&'a str>>,
        start: &str,
        path: &mut Vec<&'a str>,
        visited: &mut HashSet<&'a str>,
    ) -> Option<Vec<&'a str>> {
        let current = *path.last().unwrap();
        let Some(neighbors) = adjacency.get(current) else {
            return None;
        };
        for &next in neighbors {
            if next == start && path.len() >= 2 {
                let mut cycle = path.clone();
                cycle.push(next);
                return Some(cycle);
            }
            if visited.contains(next) {
                continue;
            }
            visited.insert(next);
            path.push(next);
            if let Some(cycle) = Self::dfs_cycle(adjacency, start, path, visited) {
                return Some(cycle);
            }
            path.pop();
        }
        None
    }

    pub fn node_count(&self) -> usize {
        self.state.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.state.read().edges.len()
    }
}

impl Default for SpendGraph {
    fn default() -> Self {
        Self::new()
    }
}
