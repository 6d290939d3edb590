//! Redis Sentinel discovery client.
//!
//! Each query opens a short-lived connection to one sentinel, issues
//! `SENTINEL get-master-addr-by-name <name>` once, and drops the connection.
//! The query runs on its own thread so connect + command share one deadline;
//! a [`Completion`] guarantees the caller sees exactly one outcome even when a
//! late reply races the timeout.

use std::thread;
use std::time::Duration;

use tracing::debug;

use keyline_core::{DiscoveryError, Endpoint};

use super::{Completion, DiscoveryClient, parse_primary_reply};
use crate::store::redis::{open_bounded, reply_from_value};

/// Queries Redis Sentinel agents.
#[derive(Debug, Clone)]
pub struct SentinelClient {
    timeout: Duration,
}

impl SentinelClient {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DiscoveryClient for SentinelClient {
    fn query(&self, agent: &Endpoint, logical_name: &str) -> Result<Endpoint, DiscoveryError> {
        let (done, result) = Completion::new();

        let spawned = {
            let done = done.clone();
            let agent = agent.clone();
            let logical_name = logical_name.to_string();
            let timeout = self.timeout;

            thread::Builder::new()
                .name("keyline-sentinel-query".to_string())
                .spawn(move || {
                    done.complete(query_sentinel(&agent, &logical_name, timeout));
                })
        };

        if let Err(err) = spawned {
            return Err(DiscoveryError::Unreachable {
                agent: agent.clone(),
                reason: format!("failed to spawn query thread: {err}"),
            });
        }

        match result.recv_timeout(self.timeout) {
            Ok(outcome) => outcome,
            Err(_) => {
                let timed_out = DiscoveryError::Timeout {
                    agent: agent.clone(),
                    timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                };
                if !done.complete(Err(timed_out.clone())) {
                    // The query finished between the timeout and now; it
                    // already won, take its answer.
                    if let Ok(outcome) = result.try_recv() {
                        return outcome;
                    }
                }
                debug!(agent = %agent, logical_name, "sentinel query timed out");
                Err(timed_out)
            }
        }
    }
}

fn query_sentinel(
    agent: &Endpoint,
    logical_name: &str,
    timeout: Duration,
) -> Result<Endpoint, DiscoveryError> {
    let unreachable = |err: redis::RedisError| DiscoveryError::Unreachable {
        agent: agent.clone(),
        reason: err.to_string(),
    };

    let mut conn = open_bounded(agent, timeout).map_err(unreachable)?;

    let reply = redis::cmd("SENTINEL")
        .arg("get-master-addr-by-name")
        .arg(logical_name)
        .query::<redis::Value>(&mut conn)
        .map_err(|err| {
            if err.is_io_error() || err.is_timeout() || err.is_connection_dropped() {
                unreachable(err)
            } else {
                DiscoveryError::Rejected {
                    agent: agent.clone(),
                    reason: err.to_string(),
                }
            }
        })?;

    parse_primary_reply(agent, logical_name, reply_from_value(reply))
}
