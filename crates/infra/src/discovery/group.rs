//! Sequential failover across discovery agents.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use keyline_core::{DiscoveryError, Endpoint};

use super::DiscoveryClient;

/// An ordered set of discovery agents.
///
/// Agents are queried strictly one after another (never in parallel, so a
/// struggling agent set is not stampeded). The agent that answers is swapped
/// into the first slot so the next resolution tries it first. Order only
/// affects latency, never the answer.
pub struct DiscoveryGroup {
    order: Mutex<Vec<Endpoint>>,
    client: Arc<dyn DiscoveryClient>,
}

impl core::fmt::Debug for DiscoveryGroup {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DiscoveryGroup")
            .field("order", &self.endpoints())
            .finish_non_exhaustive()
    }
}

impl DiscoveryGroup {
    /// Build a group; duplicate endpoints keep their first position.
    pub fn new(
        endpoints: impl IntoIterator<Item = Endpoint>,
        client: Arc<dyn DiscoveryClient>,
    ) -> Self {
        let mut order: Vec<Endpoint> = Vec::new();
        for endpoint in endpoints {
            if !order.contains(&endpoint) {
                order.push(endpoint);
            }
        }

        Self {
            order: Mutex::new(order),
            client,
        }
    }

    /// Snapshot of the current query order.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Ask agents in order until one reports the primary for `logical_name`.
    ///
    /// On total failure the order is left untouched and the last agent's
    /// error is carried in [`DiscoveryError::Exhausted`].
    pub fn resolve(&self, logical_name: &str) -> Result<Endpoint, DiscoveryError> {
        let candidates = self.endpoints();
        let mut last = None;

        for (index, agent) in candidates.iter().enumerate() {
            let answer = self
                .client
                .query(agent, logical_name)
                .and_then(|addr| {
                    if addr.is_routable() {
                        Ok(addr)
                    } else {
                        Err(DiscoveryError::Malformed {
                            agent: agent.clone(),
                            reason: format!("unusable address {addr}"),
                        })
                    }
                });

            match answer {
                Ok(addr) => {
                    if index > 0 {
                        self.promote(agent);
                    }
                    debug!(
                        logical_name,
                        agent = %agent,
                        primary = %addr,
                        index,
                        "resolved primary"
                    );
                    return Ok(addr);
                }
                Err(err) => {
                    debug!(logical_name, agent = %agent, error = %err, "discovery agent failed");
                    last = Some(err);
                }
            }
        }

        let Some(last) = last else {
            return Err(DiscoveryError::NoEndpoints);
        };

        warn!(
            logical_name,
            attempted = candidates.len(),
            error = %last,
            "every discovery agent failed"
        );
        Err(DiscoveryError::Exhausted {
            name: logical_name.to_string(),
            attempted: candidates.len(),
            last: Box::new(last),
        })
    }

    /// Swap `agent` with whatever sits in slot 0.
    fn promote(&self, agent: &Endpoint) {
        let mut order = self.lock();
        if let Some(position) = order.iter().position(|e| e == agent) {
            order.swap(0, position);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Endpoint>> {
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
