//! Wires one `Machine` to one `Effect`, forming the decide → execute →
//! re-emit loop described in the crate-level docs.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::core::{AnyCommand, Command, CorrelationId, ExecutionMode};
use crate::dispatch::Dispatcher;
use crate::effect_impl::{Effect, EffectContext};
use crate::machine::Machine;

/// A running decide/execute loop. Spawn with `tokio::spawn(runtime.run())`.
pub struct Runtime<M: Machine, Ef, D> {
    machine: M,
    effect: Ef,
    deps: Arc<D>,
    bus: EventBus<M::Event>,
    dispatcher: Option<Arc<Dispatcher<D>>>,
}

impl<M, Ef, D> Runtime<M, Ef, D>
where
    M: Machine,
    M::Event: Clone + Send + 'static,
    M::Command: Command,
    Ef: Effect<M::Command, D, Event = M::Event>,
    D: Send + Sync,
{
    /// Consumes events from the bus until every sender is dropped.
    pub async fn run(mut self) {
        let mut rx = self.bus.subscribe();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "runtime lagged behind the event bus, dropping events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };

            let Some(command) = self.machine.decide(&event) else {
                continue;
            };

            match command.execution_mode() {
                ExecutionMode::Inline => {
                    let ctx = EffectContext::new(self.deps.clone(), CorrelationId::new());
                    match self.effect.execute(command, ctx).await {
                        Ok(event) => {
                            self.bus.emit(event);
                        }
                        Err(err) => tracing::error!(error = %err, "inline effect failed"),
                    }
                }
                ExecutionMode::Background | ExecutionMode::Scheduled { .. } => {
                    if let Some(dispatcher) = &self.dispatcher {
                        let boxed: Box<dyn AnyCommand> = Box::new(command);
                        if let Err(err) = dispatcher.dispatch_one(boxed).await {
                            tracing::error!(error = %err, "failed to dispatch background command");
                        }
                    } else {
                        tracing::warn!("background command decided with no dispatcher configured");
                    }
                }
            }
        }
    }
}

/// Builds a `Runtime` from its dependencies, machine and effect in sequence.
pub struct RuntimeBuilder<D> {
    deps: Arc<D>,
}

impl<D> RuntimeBuilder<D> {
    pub fn new(deps: D) -> Self {
        Self {
            deps: Arc::new(deps),
        }
    }

    pub fn with_machine<M: Machine>(self, machine: M) -> MachineBuilder<D, M> {
        MachineBuilder {
            deps: self.deps,
            machine,
        }
    }
}

/// Builder state once a machine has been supplied.
pub struct MachineBuilder<D, M> {
    deps: Arc<D>,
    machine: M,
}

impl<D, M: Machine> MachineBuilder<D, M> {
    pub fn with_effect<Ef>(self, effect: Ef) -> EffectBuilder<D, M, Ef>
    where
        Ef: Effect<M::Command, D, Event = M::Event>,
    {
        EffectBuilder {
            deps: self.deps,
            machine: self.machine,
            effect,
            dispatcher: None,
        }
    }
}

/// Builder state with a machine and an effect; ready for an optional
/// dispatcher and `build()`.
pub struct EffectBuilder<D, M: Machine, Ef> {
    deps: Arc<D>,
    machine: M,
    effect: Ef,
    dispatcher: Option<Arc<Dispatcher<D>>>,
}

impl<D, M, Ef> EffectBuilder<D, M, Ef>
where
    M: Machine,
    M::Event: Clone + Send + 'static,
{
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher<D>>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn build(self) -> (Runtime<M, Ef, D>, EventBus<M::Event>) {
        let bus = EventBus::new();
        let runtime = Runtime {
            machine: self.machine,
            effect: self.effect,
            deps: self.deps,
            bus: bus.clone(),
            dispatcher: self.dispatcher,
        };
        (runtime, bus)
    }
}
