//! Effects: the only place IO happens. One command in, one transaction, one
//! event out.

use async_trait::async_trait;
use std::sync::Arc;

use crate::core::{CorrelationId, Event};

/// Dependencies and tracing context handed to an effect at execution time.
pub struct EffectContext<D> {
    deps: Arc<D>,
    correlation_id: CorrelationId,
}

impl<D> EffectContext<D> {
    pub fn new(deps: Arc<D>, correlation_id: CorrelationId) -> Self {
        Self {
            deps,
            correlation_id,
        }
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }
}

/// Alias for call sites that invoke a command as a one-off tool rather than
/// through the full dispatcher; carries the same dependencies and tracing.
pub type ToolContext<D> = EffectContext<D>;

/// Executes one command as one transaction, returning the fact that
/// resulted. Effects are stateless — commands must carry all needed data.
#[async_trait]
pub trait Effect<C, D>: Send + Sync {
    type Event: Event;

    async fn execute(&self, cmd: C, ctx: EffectContext<D>) -> anyhow::Result<Self::Event>;
}
