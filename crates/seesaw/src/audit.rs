//! Debug-only recording of every event crossing the bus, for inspection in
//! tests and local development. Compiled out of release builds.

use std::sync::Mutex;

use crate::core::EventEnvelope;

pub struct AuditLog<E> {
    entries: Mutex<Vec<EventEnvelope<E>>>,
}

impl<E: Clone> AuditLog<E> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, envelope: EventEnvelope<E>) {
        self.entries.lock().unwrap().push(envelope);
    }

    pub fn snapshot(&self) -> Vec<EventEnvelope<E>> {
        self.entries.lock().unwrap().clone()
    }
}

impl<E: Clone> Default for AuditLog<E> {
    fn default() -> Self {
        Self::new()
    }
}
