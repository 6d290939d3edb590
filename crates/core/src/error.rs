//! Error taxonomy for discovery, store access, connections and queues.

use thiserror::Error;

use crate::endpoint::Endpoint;

/// Failure to learn the current primary from discovery agents.
///
/// Individual agent failures are recovered by the group (next agent); only
/// [`DiscoveryError::Exhausted`] reaches connection code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery agent {agent} unreachable: {reason}")]
    Unreachable { agent: Endpoint, reason: String },

    #[error("discovery agent {agent} rejected the query: {reason}")]
    Rejected { agent: Endpoint, reason: String },

    #[error("discovery agent {agent} does not know logical name `{name}`")]
    UnknownName { agent: Endpoint, name: String },

    #[error("malformed reply from discovery agent {agent}: {reason}")]
    Malformed { agent: Endpoint, reason: String },

    #[error("discovery agent {agent} timed out after {timeout_ms} ms")]
    Timeout { agent: Endpoint, timeout_ms: u64 },

    #[error("all {attempted} discovery agents failed for `{name}`; last error: {last}")]
    Exhausted {
        name: String,
        attempted: usize,
        last: Box<DiscoveryError>,
    },

    #[error("no discovery agents configured")]
    NoEndpoints,
}

/// Raw failure classification produced by store adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The socket failed (refused, reset, timed out, closed).
    #[error("transport error: {0}")]
    Transport(String),

    /// The node answered that it no longer accepts writes (demoted primary).
    #[error("node is read-only: {0}")]
    ReadOnly(String),

    /// Any other error reply; the connection itself is fine.
    #[error("command error: {0}")]
    Command(String),
}

impl StoreError {
    /// Errors that invalidate the current connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, StoreError::Transport(_) | StoreError::ReadOnly(_))
    }
}

/// Result type for operations on a resilient connection.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Error surfaced by a resilient connection to its callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The command in flight observed a disconnect; a reconnect is underway.
    #[error("connection to `{name}` lost: {reason}")]
    ConnectionLost { name: String, reason: String },

    /// The store rejected this command; connection state is unaffected.
    #[error("command failed: {0}")]
    Command(String),

    /// Terminal: reconnecting took longer than the configured budget.
    #[error("connection to `{name}` gone: gave up after {total_ms} ms of retries")]
    RetryBudgetExceeded { name: String, total_ms: u64 },

    /// Terminal: the connection was closed by its owner.
    #[error("connection to `{name}` is closed")]
    Closed { name: String },

    #[error("timed out waiting for connection to `{name}`")]
    NotReady { name: String },

    #[error("failed to start connection supervisor: {0}")]
    Spawn(String),
}

impl ConnectionError {
    /// Terminal errors: the connection will never serve another command.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionError::RetryBudgetExceeded { .. } | ConnectionError::Closed { .. }
        )
    }
}

/// Work queue error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("worker failed on queue `{queue}`: {message}")]
    Worker { queue: String, message: String },

    #[error("worker panicked on queue `{queue}`: {message}")]
    WorkerPanicked { queue: String, message: String },

    #[error("queue `{0}` has no open connection")]
    NotOpen(String),

    #[error("unexpected reply to {command} on queue `{queue}`: {reply}")]
    UnexpectedReply {
        queue: String,
        command: String,
        reply: String,
    },

    #[error("failed to start consumer for queue `{queue}`: {reason}")]
    Spawn { queue: String, reason: String },
}
