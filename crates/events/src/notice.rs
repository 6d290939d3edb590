//! Lifecycle notifications published by connections and queues.

use chrono::{DateTime, Utc};
use serde::Serialize;

use keyline_core::Endpoint;

/// A timestamped notification from one source (logical connection name or
/// queue key).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice<E> {
    source: String,
    at: DateTime<Utc>,
    event: E,
}

impl<E> Notice<E> {
    pub fn new(source: impl Into<String>, event: E) -> Self {
        Self {
            source: source.into(),
            at: Utc::now(),
            event,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn at(&self) -> DateTime<Utc> {
        self.at
    }

    pub fn event(&self) -> &E {
        &self.event
    }

    pub fn into_event(self) -> E {
        self.event
    }
}

impl<E: Serialize> Notice<E> {
    /// JSON rendering for log shipping.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Lifecycle of a resilient connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// A store connection to the current primary is up.
    Connected { addr: Endpoint },
    /// The live connection was dropped (transport error or read-only primary).
    Disconnected { reason: String },
    /// A reconnect is scheduled after `delay_ms`.
    Retrying {
        delay_ms: u64,
        attempt: u32,
        reason: String,
    },
    /// The retry budget ran out; the connection is terminal.
    Failed { total_ms: u64 },
    /// Closed by its owner.
    Closed,
}

/// Lifecycle of a work queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// `open()` completed; `consuming` is true when a worker loop started.
    Ready { consuming: bool },
    /// The worker function failed on a job.
    WorkerError { message: String },
    /// The consumer loop exited.
    Stopped,
}
