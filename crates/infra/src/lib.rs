//! Infrastructure layer: store and discovery adapters, the resilient
//! connection, and the work queue built on it.

pub mod connection;
pub mod discovery;
pub mod queue;
pub mod store;

mod integration_tests;

pub use connection::{ConnectionState, ResilientConnection};
pub use discovery::{DiscoveryClient, DiscoveryGroup, InMemoryDiscovery};
pub use queue::{ConnectionFactory, ConnectionSource, Job, WorkFn, WorkQueue, create_queue};
pub use store::{InMemoryCluster, StoreConnection, StoreConnector};

#[cfg(feature = "redis")]
pub use discovery::SentinelClient;
#[cfg(feature = "redis")]
pub use store::RedisConnector;

/// Connect to the primary of `logical_name` as reported by the given
/// Sentinel agents.
///
/// Returns immediately; the first resolution and connect run in the
/// background.
#[cfg(feature = "redis")]
pub fn create_resilient_client(
    endpoints: impl IntoIterator<Item = keyline_core::Endpoint>,
    logical_name: impl Into<String>,
    options: keyline_core::ClientOptions,
) -> keyline_core::ConnectionResult<ResilientConnection> {
    use std::sync::Arc;

    let group = Arc::new(DiscoveryGroup::new(
        endpoints,
        Arc::new(SentinelClient::new(options.discovery_timeout())),
    ));
    let connector = Arc::new(RedisConnector::new(options.connect_timeout()));
    ResilientConnection::open(group, connector, logical_name, options)
}
