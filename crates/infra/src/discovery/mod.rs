//! Primary discovery through a group of discovery agents.
//!
//! - [`DiscoveryClient`]: one query against one agent, no retry
//! - [`DiscoveryGroup`]: sequential failover across agents with a sticky
//!   preference for the last agent that answered

use std::sync::{Arc, Mutex, PoisonError, mpsc};

use keyline_core::{DiscoveryError, Endpoint, Reply};

pub mod group;
pub mod memory;
#[cfg(feature = "redis")]
pub mod sentinel;

pub use group::DiscoveryGroup;
pub use memory::InMemoryDiscovery;
#[cfg(feature = "redis")]
pub use sentinel::SentinelClient;

/// Asks one discovery agent for the current primary of a logical name.
pub trait DiscoveryClient: Send + Sync {
    fn query(&self, agent: &Endpoint, logical_name: &str) -> Result<Endpoint, DiscoveryError>;
}

impl<C> DiscoveryClient for Arc<C>
where
    C: DiscoveryClient + ?Sized,
{
    fn query(&self, agent: &Endpoint, logical_name: &str) -> Result<Endpoint, DiscoveryError> {
        (**self).query(agent, logical_name)
    }
}

/// Completes at most once; later completions are dropped.
///
/// Several paths can race to finish one query (transport error, reply,
/// timeout). Each path calls [`Completion::complete`]; only the first value
/// reaches the receiver.
#[derive(Debug)]
pub struct Completion<T> {
    sender: Mutex<Option<mpsc::SyncSender<T>>>,
}

impl<T> Completion<T> {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::sync_channel(1);
        let completion = Arc::new(Self {
            sender: Mutex::new(Some(tx)),
        });
        (completion, rx)
    }

    /// Returns `true` if this call won.
    pub fn complete(&self, value: T) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match sender {
            Some(tx) => {
                // The receiver may already be gone (caller timed out); the
                // completion still counts as taken.
                let _ = tx.try_send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Interpret a `get-master-addr-by-name` style reply: `[host, port]`, or nil
/// when the agent does not know the name.
pub fn parse_primary_reply(
    agent: &Endpoint,
    logical_name: &str,
    reply: Reply,
) -> Result<Endpoint, DiscoveryError> {
    let malformed = |reason: String| DiscoveryError::Malformed {
        agent: agent.clone(),
        reason,
    };

    let items = match reply {
        Reply::Nil => Vec::new(),
        Reply::Array(items) => items,
        other => return Err(malformed(format!("expected [host, port], got {other}"))),
    };

    match items.as_slice() {
        [] => Err(DiscoveryError::UnknownName {
            agent: agent.clone(),
            name: logical_name.to_string(),
        }),
        [host, port] => {
            let host = host
                .as_bytes()
                .and_then(|h| std::str::from_utf8(h).ok())
                .ok_or_else(|| malformed(format!("host is not a string: {host}")))?;
            let port = port
                .as_int()
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| malformed(format!("port is not a valid port: {port}")))?;

            let addr = Endpoint::new(host, port);
            if !addr.is_routable() {
                return Err(malformed(format!("unusable address {addr}")));
            }
            Ok(addr)
        }
        other => Err(malformed(format!("expected 2 elements, got {}", other.len()))),
    }
}
