//! Advisory notification mechanics.
//!
//! Connections and queues announce lifecycle changes (connected, retrying,
//! worker failed, ...) through a [`Notifier`]. Notifications are advisory:
//! nothing in the resilience layer waits for them or depends on them being
//! read. The one exception is that a notifier reports how many observers
//! received a message, so a queue can tell an unobserved worker error apart
//! from an observed one.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to a notification stream.
///
/// Each subscription gets its own copy of every notification published after
/// it was created, up to the notifier's buffer size; a subscription that is
/// never read misses notifications past that point. Dropping the
/// subscription unsubscribes.
///
/// ```ignore
/// let notices = connection.subscribe();
/// loop {
///     match notices.recv_timeout(Duration::from_secs(1)) {
///         Ok(notice) => tracing::info!(?notice, "lifecycle"),
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything received so far.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Fan-out of advisory notifications to any number of observers.
pub trait Notifier<M>: Send + Sync {
    /// Deliver `message` to every live subscription; returns how many got it.
    fn notify(&self, message: M) -> usize;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, N> Notifier<M> for Arc<N>
where
    N: Notifier<M> + ?Sized,
{
    fn notify(&self, message: M) -> usize {
        (**self).notify(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
