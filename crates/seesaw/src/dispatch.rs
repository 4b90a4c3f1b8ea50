//! Routes a decided command to wherever its `ExecutionMode` says it belongs:
//! run inline, or hand to a `JobQueue` as a durable background/scheduled job.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::core::{AnyCommand, ExecutionMode, JobSpec};

/// Durable storage for background/scheduled work. Implemented by
/// `seesaw-job-postgres::EctoSource` for the lock-column backend, and by any
/// other backend (in-memory, replicated table) behind the same interface.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, payload: Value, spec: JobSpec) -> anyhow::Result<Uuid>;
    async fn schedule(
        &self,
        payload: Value,
        spec: JobSpec,
        run_at: DateTime<Utc>,
    ) -> anyhow::Result<Uuid>;
}

/// A `JobQueue` that drops everything handed to it, logging a warning. Used
/// where a dispatcher is needed but no durable backend has been wired up
/// yet (e.g. a dev harness exercising only inline commands).
pub struct NoOpJobQueue;

#[async_trait]
impl JobQueue for NoOpJobQueue {
    async fn enqueue(&self, _payload: Value, spec: JobSpec) -> anyhow::Result<Uuid> {
        tracing::warn!(job_type = %spec.job_type, "no job queue configured, dropping background command");
        Ok(Uuid::nil())
    }

    async fn schedule(
        &self,
        _payload: Value,
        spec: JobSpec,
        _run_at: DateTime<Utc>,
    ) -> anyhow::Result<Uuid> {
        tracing::warn!(job_type = %spec.job_type, "no job queue configured, dropping scheduled command");
        Ok(Uuid::nil())
    }
}

/// Routes commands per `ExecutionMode`. `Inline` commands are the caller's
/// responsibility (typically run by an `Effect` inside a `Runtime`);
/// `Background`/`Scheduled` commands are serialized and handed to the
/// configured `JobQueue`.
pub struct Dispatcher<D> {
    deps: D,
    bus: EventBus<Arc<dyn AnyCommand>>,
    job_queue: Arc<dyn JobQueue>,
}

impl<D: Send + Sync> Dispatcher<D> {
    pub fn with_job_queue(
        deps: D,
        bus: EventBus<Arc<dyn AnyCommand>>,
        job_queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            deps,
            bus,
            job_queue,
        }
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }

    pub fn bus(&self) -> &EventBus<Arc<dyn AnyCommand>> {
        &self.bus
    }

    /// Dispatches one erased command according to its execution mode.
    pub async fn dispatch_one(&self, command: Box<dyn AnyCommand>) -> anyhow::Result<()> {
        let command: Arc<dyn AnyCommand> = Arc::from(command);
        self.bus.emit(command.clone());

        match command.get_execution_mode() {
            ExecutionMode::Inline => Ok(()),
            ExecutionMode::Background => {
                let spec = command
                    .get_job_spec()
                    .ok_or_else(|| anyhow::anyhow!("background command is missing a JobSpec"))?;
                let payload = command
                    .serialize()
                    .ok_or_else(|| anyhow::anyhow!("background command has no payload"))?;
                self.job_queue.enqueue(payload, spec).await?;
                Ok(())
            }
            ExecutionMode::Scheduled { run_at } => {
                let spec = command
                    .get_job_spec()
                    .ok_or_else(|| anyhow::anyhow!("scheduled command is missing a JobSpec"))?;
                let payload = command
                    .serialize()
                    .ok_or_else(|| anyhow::anyhow!("scheduled command has no payload"))?;
                self.job_queue.schedule(payload, spec, run_at).await?;
                Ok(())
            }
        }
    }
}
