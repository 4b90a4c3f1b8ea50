//! The worker pool's handler map: tasks arrive on the wire as
//! `(handler_id, args)`; this registry is where `handler_id` resolves to an
//! actual callable, supplied once at worker pool construction (spec §9).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// A registered handler: JSON args in, JSON result out.
pub type TaskFn =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>> + Send + Sync>;

#[derive(Debug, Error)]
pub enum DeserializationError {
    #[error("no handler registered for task {0:?}")]
    UnknownHandler(String),
}

/// Maps a task's `handler_id` to the function that runs it.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    handlers: HashMap<String, TaskFn>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an async handler under `handler_id`.
    pub fn register<F, Fut>(&mut self, handler_id: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handlers
            .insert(handler_id.into(), Arc::new(move |args| Box::pin(handler(args))));
        self
    }

    /// Looks up `handler_id` and invokes it with `args`.
    pub fn dispatch(
        &self,
        handler_id: &str,
        args: Value,
    ) -> Result<Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>, DeserializationError>
    {
        let handler = self
            .handlers
            .get(handler_id)
            .ok_or_else(|| DeserializationError::UnknownHandler(handler_id.to_string()))?;
        Ok(handler(args))
    }
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
