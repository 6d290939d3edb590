//! In-memory discovery agents for tests/dev.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use keyline_core::{DiscoveryError, Endpoint};

use super::DiscoveryClient;

/// Most recent queries kept for [`InMemoryDiscovery::queries`].
const QUERY_LOG_LIMIT: usize = 256;

#[derive(Debug, Default)]
struct DiscoveryState {
    agents: HashSet<Endpoint>,
    down: HashSet<Endpoint>,
    primaries: HashMap<String, Endpoint>,
    queries: VecDeque<Endpoint>,
}

/// A set of simulated agents that all agree on one primary per name.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDiscovery {
    state: Arc<Mutex<DiscoveryState>>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_agent(&self, agent: Endpoint) {
        self.lock().agents.insert(agent);
    }

    pub fn set_agent_down(&self, agent: &Endpoint, down: bool) {
        let mut state = self.lock();
        if down {
            state.down.insert(agent.clone());
        } else {
            state.down.remove(agent);
        }
    }

    /// Point `logical_name` at a new primary (a failover).
    pub fn set_primary(&self, logical_name: impl Into<String>, addr: Endpoint) {
        self.lock().primaries.insert(logical_name.into(), addr);
    }

    pub fn clear_primary(&self, logical_name: &str) {
        self.lock().primaries.remove(logical_name);
    }

    /// Agents queried since the last reset, in call order. Only the most
    /// recent queries are kept, so a long-lived instance stays bounded.
    pub fn queries(&self) -> Vec<Endpoint> {
        self.lock().queries.iter().cloned().collect()
    }

    pub fn reset_queries(&self) {
        self.lock().queries.clear();
    }

    fn lock(&self) -> MutexGuard<'_, DiscoveryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DiscoveryClient for InMemoryDiscovery {
    fn query(&self, agent: &Endpoint, logical_name: &str) -> Result<Endpoint, DiscoveryError> {
        let mut state = self.lock();
        if state.queries.len() == QUERY_LOG_LIMIT {
            state.queries.pop_front();
        }
        state.queries.push_back(agent.clone());

        if !state.agents.contains(agent) || state.down.contains(agent) {
            return Err(DiscoveryError::Unreachable {
                agent: agent.clone(),
                reason: "connection refused".to_string(),
            });
        }

        state
            .primaries
            .get(logical_name)
            .cloned()
            .ok_or_else(|| DiscoveryError::UnknownName {
                agent: agent.clone(),
                name: logical_name.to_string(),
            })
    }
}
