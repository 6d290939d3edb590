//! In-process notifier backed by channels.

use std::sync::mpsc::{self, TrySendError};
use std::sync::Mutex;

use crate::bus::{Notifier, Subscription};

/// Notices buffered per subscription before newer ones are dropped.
pub const DEFAULT_CAPACITY: usize = 1024;

/// In-memory fan-out notifier.
///
/// - No IO, never blocks the publisher
/// - Each subscription buffers at most `capacity` messages; a full one
///   misses newer messages until drained, but still counts as an observer
/// - Dead subscriptions are pruned on the next publish
#[derive(Debug)]
pub struct InMemoryNotifier<M> {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::SyncSender<M>>>,
}

impl<M> InMemoryNotifier<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// A capacity of 0 is raised to 1.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Number of subscriptions registered (including ones dropped since the
    /// last publish).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryNotifier<M> {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl<M> Notifier<M> for InMemoryNotifier<M>
where
    M: Clone + Send + 'static,
{
    fn notify(&self, message: M) -> usize {
        // A poisoned lock means a subscriber list we can no longer trust;
        // report nobody observed the message.
        let Ok(mut subs) = self.subscribers.lock() else {
            return 0;
        };

        subs.retain(|tx| match tx.try_send(message.clone()) {
            Ok(()) | Err(TrySendError::Full(_)) => true,
            Err(TrySendError::Disconnected(_)) => false,
        });
        subs.len()
    }

    fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::sync_channel(self.capacity);

        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }

        Subscription::new(rx)
    }
}
