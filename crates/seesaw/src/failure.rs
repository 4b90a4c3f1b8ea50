//! Pluggable strategies invoked when a reserved job's execution raises
//! (spec §4.5). All three built-ins must be safe to call repeatedly — a
//! redelivered monitor message is expected under at-least-once execution.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use serde_json::json;

use crate::core::JobSpec;
use crate::dispatch::JobQueue;
use crate::job::{FailureKind, Job, JobResult};
use crate::pipeline::ReplyRegistry;
use crate::poll::PollQueueHandle;

/// Everything a failure mode needs besides its own configuration: where to
/// ack/nack through (keeps the poll loop's `outstanding` count correct) and
/// where to deliver a reply if the job was dispatched with one.
pub struct FailureContext<'a> {
    pub queue: &'a PollQueueHandle,
    pub replies: &'a ReplyRegistry,
}

/// A pluggable strategy invoked when a reserved job's execution raises.
#[async_trait]
pub trait FailureMode: Send + Sync {
    /// Called once at queue construction; return an error for malformed
    /// configuration instead of failing later, mid-run.
    fn validate_args(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn handle_failure(
        &self,
        job: Job,
        reason: String,
        kind: FailureKind,
        ctx: &FailureContext<'_>,
    );
}

/// Finalizes the job as permanently failed. `Job::completed_at` stays
/// `None`: an ack without completion is the signal the store reads as
/// abandon rather than finish (spec §9, open question 1).
#[derive(Default)]
pub struct Abandon;

#[async_trait]
impl FailureMode for Abandon {
    async fn handle_failure(&self, job: Job, reason: String, _kind: FailureKind, ctx: &FailureContext<'_>) {
        if let Some(from) = &job.from {
            ctx.replies.notify(from, JobResult::Exit(reason));
        }
        ctx.queue.ack(job).await;
    }
}

/// Retries up to `times` more attempts with a caller-specified or
/// exponential-by-default backoff, then delegates to `Abandon`.
pub struct Retry {
    pub times: u32,
    backoff: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
}

impl Retry {
    pub fn new(times: u32) -> Self {
        Self {
            times,
            backoff: Arc::new(|attempt| Duration::seconds(2i64.saturating_pow(attempt.min(12)))),
        }
    }

    pub fn with_backoff(mut self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    fn attempt(job: &Job) -> u32 {
        job.failure_private
            .as_ref()
            .and_then(|v| v.get("attempt"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}

#[async_trait]
impl FailureMode for Retry {
    async fn handle_failure(
        &self,
        mut job: Job,
        reason: String,
        kind: FailureKind,
        ctx: &FailureContext<'_>,
    ) {
        let attempt = Self::attempt(&job);

        if kind == FailureKind::NonRetryable || attempt >= self.times {
            Abandon.handle_failure(job, reason, kind, ctx).await;
            return;
        }

        job.failure_private = Some(json!({ "attempt": attempt + 1, "last_error": reason }));
        let delay = (self.backoff)(attempt);
        ctx.queue.nack(job, delay).await;
    }
}

/// Acks the original job as abandoned, enqueues a copy against `target` via
/// the generic cross-backend `JobQueue` front-end (spec: "reusing the
/// generic enqueue API — i.e. whatever backend Q uses"), and notifies the
/// reply channel with `{:moved, reason}`.
pub struct Move {
    pub target: Arc<dyn JobQueue>,
    pub job_type: String,
}

impl Move {
    pub fn new(target: Arc<dyn JobQueue>, job_type: impl Into<String>) -> Self {
        Self {
            target,
            job_type: job_type.into(),
        }
    }
}

#[async_trait]
impl FailureMode for Move {
    async fn handle_failure(&self, job: Job, reason: String, _kind: FailureKind, ctx: &FailureContext<'_>) {
        let payload = job.task.args.clone();
        if let Err(err) = self
            .target
            .enqueue(payload, JobSpec::new(self.job_type.clone()))
            .await
        {
            tracing::error!(error = %err, "move failure mode could not enqueue on the target queue");
        }

        if let Some(from) = &job.from {
            ctx.replies.notify(from, JobResult::Moved(reason));
        }

        ctx.queue.ack(job).await;
    }
}
