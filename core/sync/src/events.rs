//! Explicit publish/subscribe channel for engine notifications.
//!
//! Subscribers are notified in subscription order; there is no replay of
//! past events to late subscribers.

use std::sync::Mutex;
use tokio::sync::mpsc;

/// A broadcast bus over unbounded channels.
///
/// `publish` is synchronous and never blocks; subscribers that dropped
/// their receiver are pruned on the next publish.
pub struct EventBus<T> {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber. Only events published after this call
    /// are delivered to it.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver an event to all live subscribers, in subscription order.
    pub fn publish(&self, event: T) {
        self.subscribers
            .lock()
            .unwrap()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers at the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
