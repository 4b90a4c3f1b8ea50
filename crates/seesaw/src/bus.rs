//! In-memory fan-out of events. At-most-once delivery: slow receivers miss
//! events rather than block the emitter, per the module-level guarantees.

use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// A broadcast channel of events of type `E`. Cheap to clone; every clone
/// shares the same underlying channel.
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Emits an event to every current subscriber. Returns the number of
    /// subscribers it reached; zero is not an error, just nobody listening.
    pub fn emit(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}
