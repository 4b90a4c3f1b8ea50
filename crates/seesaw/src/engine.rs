//! The primary entry point: wires one or more queues (each a `JobStore` plus
//! a worker pool) into a running system, and exposes the external queue API
//! of spec §6 (suspend/resume/status/filter/cancel, plus the generic
//! enqueue/yield front-end) as one handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::core::JobSpec;
use crate::dispatch::JobQueue;
use crate::failure::FailureMode;
use crate::job::{CommandRegistry, FilterSelector, Job, JobResult, JobStore, PrimaryKey, QueueStatus, ReplyAddress, TaskRef};
use crate::pipeline::{JobPipeline, ReplyRegistry, SuccessMode};
use crate::poll::{PollQueueHandle, PollQueueLoop};

/// Everything needed to stand up one queue: its lock-column source, its
/// worker pool's handler map, and its pluggable policies.
pub struct QueueConfig {
    pub name: String,
    pub source: Arc<dyn JobStore>,
    /// The generic cross-backend enqueue front-end for this queue, used by
    /// `EngineHandle::async_dispatch` and by `Move` failure modes targeting
    /// this queue. `None` if this queue is only ever polled, never
    /// dispatched into by the framework itself.
    pub job_queue: Option<Arc<dyn JobQueue>>,
    pub registry: Arc<CommandRegistry>,
    pub pool_size: usize,
    pub poll_interval: StdDuration,
    pub failure_mode: Arc<dyn FailureMode>,
    pub success_mode: Option<Arc<dyn SuccessMode>>,
    pub suspended: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, source: Arc<dyn JobStore>, registry: Arc<CommandRegistry>) -> Self {
        Self {
            name: name.into(),
            source,
            job_queue: None,
            registry,
            pool_size: 1,
            poll_interval: StdDuration::from_secs(10),
            failure_mode: Arc::new(crate::failure::Abandon),
            success_mode: None,
            suspended: false,
        }
    }
}

/// Accumulates `QueueConfig`s and builds the running `Engine` plus its
/// `EngineHandle`.
#[derive(Default)]
pub struct EngineBuilder {
    queues: Vec<QueueConfig>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_queue(mut self, config: QueueConfig) -> Self {
        self.queues.push(config);
        self
    }

    pub fn build(self) -> (Engine, EngineHandle) {
        let replies = ReplyRegistry::new();
        let mut loops = Vec::new();
        let mut poll_handles = HashMap::new();
        let mut job_queues = HashMap::new();
        let mut pipelines = Vec::new();

        for config in self.queues {
            let (poll_loop, handle) =
                PollQueueLoop::new(config.name.clone(), config.source, config.poll_interval, config.suspended);

            if let Some(job_queue) = config.job_queue {
                job_queues.insert(config.name.clone(), job_queue);
            }

            let pipeline = Arc::new(JobPipeline::new(
                handle.clone(),
                config.registry,
                config.failure_mode,
                config.success_mode,
                replies.clone(),
            ));

            poll_handles.insert(config.name.clone(), handle);
            pipelines.push((pipeline, config.pool_size));
            loops.push(poll_loop);
        }

        let engine_handle = EngineHandle {
            queues: Arc::new(poll_handles),
            job_queues: Arc::new(job_queues),
            replies,
        };

        (Engine { loops, pipelines }, engine_handle)
    }
}

/// The set of spawned tasks backing every configured queue. Consumed by
/// `run`, which never returns under normal operation.
pub struct Engine {
    loops: Vec<PollQueueLoop>,
    pipelines: Vec<(Arc<JobPipeline>, usize)>,
}

impl Engine {
    /// Spawns every queue's poll loop and worker pool and waits for them.
    /// Workers and poll loops only exit if every `EngineHandle` is dropped;
    /// a panic inside one worker does not bring down the others.
    pub async fn run(self) {
        let mut handles = Vec::new();

        for poll_loop in self.loops {
            handles.push(tokio::spawn(poll_loop.run()));
        }

        for (pipeline, pool_size) in self.pipelines {
            for _ in 0..pool_size {
                let pipeline = pipeline.clone();
                handles.push(tokio::spawn(pipeline.run_worker()));
            }
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// External handle to a running `Engine`. Cheap to clone.
#[derive(Clone)]
pub struct EngineHandle {
    queues: Arc<HashMap<String, PollQueueHandle>>,
    job_queues: Arc<HashMap<String, Arc<dyn JobQueue>>>,
    replies: ReplyRegistry,
}

impl EngineHandle {
    pub fn queue_names(&self) -> Vec<String> {
        self.queues.keys().cloned().collect()
    }

    fn handle(&self, queue: &str) -> anyhow::Result<&PollQueueHandle> {
        self.queues
            .get(queue)
            .ok_or_else(|| anyhow::anyhow!("no queue process running for {queue:?}"))
    }

    pub async fn suspend(&self, queue: &str) -> anyhow::Result<()> {
        self.handle(queue)?.suspend().await;
        Ok(())
    }

    pub async fn resume(&self, queue: &str) -> anyhow::Result<()> {
        self.handle(queue)?.resume().await;
        Ok(())
    }

    pub async fn status(&self, queue: &str) -> anyhow::Result<QueueStatus> {
        self.handle(queue)?
            .status()
            .await
            .ok_or_else(|| anyhow::anyhow!("queue {queue:?} failed to report status"))
    }

    pub async fn filter(&self, queue: &str, selector: FilterSelector) -> anyhow::Result<Vec<Job>> {
        Ok(self.handle(queue)?.filter(selector).await)
    }

    /// Never waits (spec §6); returns `:ok`/`:in_progress`/`:not_found` as
    /// `CancelOutcome`.
    pub async fn cancel(&self, queue: &str, primary_key: PrimaryKey) -> anyhow::Result<crate::job::CancelOutcome> {
        Ok(self.handle(queue)?.cancel(primary_key).await)
    }

    /// User-callable move (spec §6 `move`): acks `job` as abandoned on its
    /// own queue and enqueues a copy of its task onto `to_queue`'s generic
    /// `JobQueue` front-end under `job_type`. Distinct from the `Move`
    /// failure mode (`failure.rs`), which does the same thing automatically
    /// when a handler raises; this is the operator-invoked counterpart on a
    /// job the caller already holds, e.g. one returned by `filter`.
    pub async fn move_to(&self, job: Job, to_queue: &str, job_type: impl Into<String>) -> anyhow::Result<()> {
        let target = self
            .job_queues
            .get(to_queue)
            .ok_or_else(|| anyhow::anyhow!("no queue process running for {to_queue:?}"))?;

        target.enqueue(job.task.args.clone(), JobSpec::new(job_type.into())).await?;

        let source = self.handle(&job.queue)?.clone();
        source.ack(job).await;
        Ok(())
    }

    /// Dispatches a task against `queue`'s generic `JobQueue` front-end
    /// (spec §6 `async`). When `reply` is true, the returned receiver can be
    /// passed to `yield_for`.
    pub async fn async_dispatch(
        &self,
        queue: &str,
        task: TaskRef,
        reply: bool,
    ) -> anyhow::Result<(Uuid, Option<oneshot::Receiver<JobResult>>)> {
        let job_queue = self
            .job_queues
            .get(queue)
            .ok_or_else(|| anyhow::anyhow!("no queue process running for {queue:?}"))?;

        let job_type = task.handler_id.clone();
        let id = job_queue.enqueue(task.args, JobSpec::new(job_type)).await?;

        let rx = if reply {
            let address = ReplyAddress {
                caller_id: Uuid::new_v4(),
                request_id: id,
            };
            let (tx, rx) = oneshot::channel();
            self.replies.register(address, tx);
            Some(rx)
        } else {
            None
        };

        Ok((id, rx))
    }

    /// Blocks up to `timeout` for a reply registered via `async_dispatch`;
    /// `None` on timeout without disturbing the in-flight job (spec §6).
    pub async fn yield_for(&self, rx: oneshot::Receiver<JobResult>, timeout: StdDuration) -> Option<JobResult> {
        crate::request::dispatch_request_timeout(rx, timeout).await
    }
}

/// A snapshot of one queue's in-progress count, used to decide whether it is
/// safe to shut a worker pool down.
#[derive(Debug, Clone, Copy)]
pub struct InflightBatch {
    pub queue_in_progress: i64,
}

/// Polls a queue's status until its in-progress count drains to zero, or a
/// deadline passes — the usual shape of a graceful-shutdown wait.
pub struct InflightTracker<'a> {
    handle: &'a EngineHandle,
}

impl<'a> InflightTracker<'a> {
    pub fn new(handle: &'a EngineHandle) -> Self {
        Self { handle }
    }

    pub async fn snapshot(&self, queue: &str) -> anyhow::Result<InflightBatch> {
        let status = self.handle.status(queue).await?;
        Ok(InflightBatch {
            queue_in_progress: status.in_progress,
        })
    }

    pub async fn wait_until_drained(&self, queue: &str, poll_every: StdDuration, deadline: StdDuration) -> bool {
        let start = tokio::time::Instant::now();
        loop {
            if let Ok(batch) = self.snapshot(queue).await {
                if batch.queue_in_progress == 0 {
                    return true;
                }
            }
            if start.elapsed() >= deadline {
                return false;
            }
            tokio::time::sleep(poll_every).await;
        }
    }
}
