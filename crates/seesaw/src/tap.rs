//! Read-only observation of events flowing through the system, for metrics
//! and debugging. Taps never decide or execute; they only watch.

use crate::core::{CorrelationId, EventEnvelope};

/// Context handed to a tap alongside the envelope it is observing.
pub struct TapContext {
    pub correlation_id: CorrelationId,
}

/// Observes every envelope matching whatever selection the caller wired up
/// (see `EnvelopeMatch`/`MatchChain` in `core`).
pub trait EventTap<E>: Send + Sync {
    fn observe(&self, envelope: &EventEnvelope<E>, ctx: &TapContext);
}
