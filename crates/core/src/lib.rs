//! `keyline-core`: building blocks shared by the resilience layer.
//!
//! This crate contains **pure** primitives (no IO): endpoints, the store's
//! request/reply values, the reconnect backoff policy, typed options and the
//! error taxonomy.

pub mod backoff;
pub mod endpoint;
pub mod error;
pub mod id;
pub mod options;
pub mod wire;

pub use backoff::{Backoff, BackoffStep};
pub use endpoint::{Endpoint, EndpointParseError};
pub use error::{ConnectionError, ConnectionResult, DiscoveryError, QueueError, StoreError};
pub use id::ConnectionId;
pub use options::{ClientOptions, Escalation, QueueOptions};
pub use wire::{Reply, Request, is_read_only_reply};
