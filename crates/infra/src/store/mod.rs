//! Store client seam.
//!
//! The resilience layer never talks to a client library directly; it asks a
//! [`StoreConnector`] for a connection to an address and sends [`Request`]s
//! over the returned [`StoreConnection`]. Adapters classify failures into
//! [`StoreError`] so the connection manager can tell a dead or demoted node
//! apart from an ordinary command error.

use std::sync::Arc;

use keyline_core::{Endpoint, Reply, Request, StoreError};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryCluster;
#[cfg(feature = "redis")]
pub use self::redis::RedisConnector;

/// One open connection to one store node.
pub trait StoreConnection: Send {
    fn execute(&mut self, request: &Request) -> Result<Reply, StoreError>;
}

/// Opens store connections; the client library's own reconnect logic must be
/// disabled (a failed connection is reported, never retried here).
pub trait StoreConnector: Send + Sync {
    fn connect(&self, addr: &Endpoint) -> Result<Box<dyn StoreConnection>, StoreError>;
}

impl<C> StoreConnector for Arc<C>
where
    C: StoreConnector + ?Sized,
{
    fn connect(&self, addr: &Endpoint) -> Result<Box<dyn StoreConnection>, StoreError> {
        (**self).connect(addr)
    }
}
