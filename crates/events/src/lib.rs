//! Advisory lifecycle notifications (connections and queues).

pub mod bus;
pub mod in_memory_bus;
pub mod notice;

pub use bus::{Notifier, Subscription};
pub use in_memory_bus::InMemoryNotifier;
pub use notice::{ConnectionEvent, Notice, QueueEvent};
