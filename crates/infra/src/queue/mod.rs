//! Work queue over a store list.
//!
//! Producers append with `RPUSH` (or prepend urgent work with `LPUSH`); one
//! consumer thread per queue pops with a bounded `BLPOP` and runs the worker
//! function on each item, strictly one at a time.

use keyline_core::{ConnectionResult, QueueOptions};

use crate::connection::ResilientConnection;

pub mod work_queue;

pub use work_queue::WorkQueue;

/// One item popped from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    queue: String,
    payload: Vec<u8>,
}

impl Job {
    pub fn new(queue: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            queue: queue.into(),
            payload: payload.into(),
        }
    }

    /// Key of the list the job came from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}

/// Worker function invoked for every popped job.
pub type WorkFn = Box<dyn FnMut(Job) -> anyhow::Result<()> + Send>;

/// Builds a fresh connection each time the queue is opened.
pub type ConnectionFactory = Box<dyn Fn() -> ConnectionResult<ResilientConnection> + Send + Sync>;

/// Where a queue gets its connection from.
pub enum ConnectionSource {
    /// Use this connection (possibly shared with other queues).
    Shared(ResilientConnection),
    /// Call the factory on every `open()`, closing the previous connection.
    Factory(ConnectionFactory),
}

impl From<ResilientConnection> for ConnectionSource {
    fn from(connection: ResilientConnection) -> Self {
        ConnectionSource::Shared(connection)
    }
}

impl core::fmt::Debug for ConnectionSource {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionSource::Shared(connection) => {
                f.debug_tuple("Shared").field(connection).finish()
            }
            ConnectionSource::Factory(_) => f.write_str("Factory(..)"),
        }
    }
}

/// Create a queue on `key`. Nothing is consumed until [`WorkQueue::open`].
pub fn create_queue(
    source: impl Into<ConnectionSource>,
    key: impl Into<String>,
    worker: Option<WorkFn>,
    options: QueueOptions,
) -> WorkQueue {
    WorkQueue::new(source.into(), key, worker, options)
}
