//! Executes a reserved job through a worker and routes the outcome: success
//! acks (after the optional success mode runs); failure hands the job to the
//! configured failure mode (C5); a worker crash never produces a message at
//! all — recovery is the store's `reset_stale` sweep (spec §4.4).

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::failure::{FailureContext, FailureMode};
use crate::job::{CommandRegistry, FailureKind, Job, JobResult, ReplyAddress};
use crate::poll::PollQueueHandle;

/// Holds the oneshot sender for every in-flight `yield_for` caller, keyed by
/// the reply address its job was dispatched with. A second delivery is
/// possible and intentional (at-least-once); the second `notify` is just a
/// no-op once the first has drained the entry.
#[derive(Clone, Default)]
pub struct ReplyRegistry {
    inflight: Arc<DashMap<ReplyAddress, oneshot::Sender<JobResult>>>,
}

impl ReplyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, address: ReplyAddress, reply: oneshot::Sender<JobResult>) {
        self.inflight.insert(address, reply);
    }

    pub fn notify(&self, address: &ReplyAddress, result: JobResult) {
        if let Some((_, sender)) = self.inflight.remove(address) {
            let _ = sender.send(result);
        }
    }
}

/// An optional hook run after a successful job, before acking (spec §6
/// `success_mode`).
#[async_trait]
pub trait SuccessMode: Send + Sync {
    async fn handle_success(&self, job: &Job, result: &serde_json::Value);
}

/// Runs reserved jobs against a `CommandRegistry`, routing ack/nack/failure
/// back through the owning queue's `PollQueueHandle` so its `outstanding`
/// count stays correct.
pub struct JobPipeline {
    queue: PollQueueHandle,
    registry: Arc<CommandRegistry>,
    failure_mode: Arc<dyn FailureMode>,
    success_mode: Option<Arc<dyn SuccessMode>>,
    replies: ReplyRegistry,
}

impl JobPipeline {
    pub fn new(
        queue: PollQueueHandle,
        registry: Arc<CommandRegistry>,
        failure_mode: Arc<dyn FailureMode>,
        success_mode: Option<Arc<dyn SuccessMode>>,
        replies: ReplyRegistry,
    ) -> Self {
        Self {
            queue,
            registry,
            failure_mode,
            success_mode,
            replies,
        }
    }

    /// Runs one worker: advertises itself free, executes whatever job it's
    /// handed, then loops. Spawn `pool_size` of these to make a pool.
    pub async fn run_worker(self: Arc<Self>) {
        loop {
            let rx = self.queue.worker_ready().await;
            match rx.await {
                Ok(job) => self.execute(job).await,
                Err(_) => continue,
            }
        }
    }

    async fn execute(&self, job: Job) {
        let outcome = match self.registry.dispatch(&job.task.handler_id, job.task.args.clone()) {
            Ok(fut) => fut.await,
            Err(err) => Err(anyhow::anyhow!(err)),
        };

        match outcome {
            Ok(value) => {
                if let Some(success_mode) = &self.success_mode {
                    success_mode.handle_success(&job, &value).await;
                }
                if let Some(from) = &job.from {
                    self.replies.notify(from, JobResult::Ok(value));
                }
                let mut finished = job;
                finished.completed_at = Some(chrono::Utc::now());
                self.queue.ack(finished).await;
            }
            Err(err) => {
                let ctx = FailureContext {
                    queue: &self.queue,
                    replies: &self.replies,
                };
                self.failure_mode
                    .handle_failure(job, err.to_string(), FailureKind::Retryable, &ctx)
                    .await;
            }
        }
    }
}
