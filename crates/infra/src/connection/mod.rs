//! Resilient connection to the current primary.
//!
//! A [`ResilientConnection`] is one logical connection to "whatever node is
//! primary for name N right now". It resolves the primary through a
//! [`DiscoveryGroup`](crate::discovery::DiscoveryGroup), connects, and on any
//! disconnect (including a demoted primary answering `READONLY`) backs off
//! and starts over with a fresh resolution, until it is closed or its retry
//! budget runs out.

pub mod resilient;
pub mod state;

pub use resilient::ResilientConnection;
pub use state::ConnectionState;
