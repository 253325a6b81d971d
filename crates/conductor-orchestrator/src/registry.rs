use chrono::{DateTime, Utc};
use conductor_core::clock::elapsed_since;
use conductor_core::{Agent, AgentId, AgentStatus, ConductorError, ConductorResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

/// Shared handle to one agent record; the mutex is the per-agent lock.
pub type AgentHandle = Arc<Mutex<Agent>>;

/// Liveness, capability and load table for every registered agent.
///
/// The map is sharded; each record sits behind its own lock so unrelated
/// agents never contend. The registry only stores and answers queries; state
/// changes go through the coordination manager.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<AgentId, AgentHandle>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new agent. `on_insert` runs while the id is reserved and its
    /// return value is handed back once the record is visible.
    pub fn insert_with<T>(
        &self,
        agent: Agent,
        on_insert: impl FnOnce(&Agent) -> T,
    ) -> ConductorResult<T> {
        match self.agents.entry(agent.id.clone()) {
            Entry::Occupied(_) => Err(ConductorError::AgentRegistration(format!(
                "agent '{}' is already registered",
                agent.id
            ))),
            Entry::Vacant(slot) => {
                let out = on_insert(&agent);
                slot.insert(Arc::new(Mutex::new(agent)));
                Ok(out)
            }
        }
    }

    pub fn get(&self, id: &AgentId) -> Option<AgentHandle> {
        self.agents.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &AgentId) -> bool {
        self.agents.contains_key(id)
    }

    pub fn remove(&self, id: &AgentId) -> Option<AgentHandle> {
        self.agents.remove(id).map(|(_, handle)| handle)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Handles of every agent. Shard locks are released before returning.
    pub fn handles(&self) -> Vec<AgentHandle> {
        self.agents.iter().map(|e| e.value().clone()).collect()
    }

    /// Copies of every agent record, ordered by id.
    pub fn snapshot(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.handles().iter().map(|h| h.lock().clone()).collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Agents able to take a task needing `required`, best first: lowest
    /// load, then least recently heard from.
    ///
    /// Each agent is locked only long enough to read it, so the answer can be
    /// stale by the time the caller acts on it; re-check under the agent lock.
    pub fn candidates(&self, required: &BTreeSet<String>, max_load: usize) -> Vec<AgentId> {
        let mut eligible: Vec<(f64, DateTime<Utc>, AgentId)> = self
            .handles()
            .iter()
            .filter_map(|handle| {
                let agent = handle.lock();
                is_eligible(&agent, required, max_load).then(|| {
                    (agent.load_factor, agent.last_heartbeat, agent.id.clone())
                })
            })
            .collect();
        eligible.sort_by(|a, b| {
            a.0.total_cmp(&b.0)
                .then_with(|| a.1.cmp(&b.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        eligible.into_iter().map(|(_, _, id)| id).collect()
    }
}

/// Active, capable and below capacity.
pub fn is_eligible(agent: &Agent, required: &BTreeSet<String>, max_load: usize) -> bool {
    agent.status == AgentStatus::Active
        && agent.can_run(required)
        && agent.current_tasks.len() < max_load
}

/// The status an agent should move to given how long it has been silent,
/// or `None` if it stays where it is.
pub fn liveness_verdict(
    agent: &Agent,
    now: DateTime<Utc>,
    stale_after: Duration,
    offline_after: Duration,
) -> Option<AgentStatus> {
    let silent = elapsed_since(now, agent.last_heartbeat);
    match agent.status {
        AgentStatus::Active if silent > stale_after => Some(AgentStatus::Stale),
        AgentStatus::Stale if silent > offline_after => Some(AgentStatus::Offline),
        _ => None,
    }
}
