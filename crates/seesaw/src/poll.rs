//! The generic polling driver (spec §4.3): schedules reservation attempts,
//! hands reserved jobs to free workers, and honors suspend/resume. Works
//! against any `JobStore`; the lock-column PostgreSQL backend is just one.
//!
//! Modeled as a single-owner event loop (spec §9: "per-process state with
//! mailbox semantics" → a typed actor). All mutable state — `suspended`,
//! `outstanding`, the free-worker list, the buffered job — lives inside the
//! loop task; every external caller talks to it through `PollQueueHandle`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use futures::future::Either;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::job::{CancelOutcome, FilterSelector, Job, JobStore, PrimaryKey, QueueError, QueueStatus};

/// A free worker's handshake: it hands over a one-shot sender and receives
/// exactly one job on it, then re-announces itself once free again.
pub type WorkerHandle = oneshot::Sender<Job>;

enum PollCommand {
    Suspend,
    Resume,
    Status(oneshot::Sender<QueueStatus>),
    Filter(FilterSelector, oneshot::Sender<Vec<Job>>),
    Cancel(PrimaryKey, oneshot::Sender<CancelOutcome>),
    WorkerReady(WorkerHandle),
    Ack(Job),
    Nack(Job, ChronoDuration),
}

/// External handle to a running `PollQueueLoop`. Cheap to clone; every call
/// is a message send, never a direct field touch (no cross-process state
/// sharing, per spec §5).
#[derive(Clone)]
pub struct PollQueueHandle {
    queue: String,
    commands: mpsc::Sender<PollCommand>,
}

impl PollQueueHandle {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stops scheduling polls and refuses to hand out buffered jobs. Never
    /// waits (spec §5).
    pub async fn suspend(&self) {
        let _ = self.commands.send(PollCommand::Suspend).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(PollCommand::Resume).await;
    }

    pub async fn status(&self) -> Option<QueueStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(PollCommand::Status(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn filter(&self, selector: FilterSelector) -> Vec<Job> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(PollCommand::Filter(selector, tx)).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Returns immediately with `:ok | {:error, :in_progress} |
    /// {:error, :not_found}` (spec §6); never waits.
    pub async fn cancel(&self, primary_key: PrimaryKey) -> CancelOutcome {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(PollCommand::Cancel(primary_key, tx))
            .await
            .is_err()
        {
            return CancelOutcome::NotFound;
        }
        rx.await.unwrap_or(CancelOutcome::NotFound)
    }

    /// A worker advertises itself as free; it receives its next job on the
    /// returned receiver.
    pub async fn worker_ready(&self) -> oneshot::Receiver<Job> {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands.send(PollCommand::WorkerReady(tx)).await;
        rx
    }

    pub async fn ack(&self, job: Job) {
        let _ = self.commands.send(PollCommand::Ack(job)).await;
    }

    pub async fn nack(&self, job: Job, delay: ChronoDuration) {
        let _ = self.commands.send(PollCommand::Nack(job, delay)).await;
    }
}

/// The loop itself. Spawn with `tokio::spawn(poll_loop.run())`.
pub struct PollQueueLoop {
    queue: String,
    source: Arc<dyn JobStore>,
    poll_interval: StdDuration,
    suspended: bool,
    outstanding: u64,
    free_workers: VecDeque<WorkerHandle>,
    buffered: VecDeque<Job>,
    commands: mpsc::Receiver<PollCommand>,
}

const COMMAND_CHANNEL_CAPACITY: usize = 256;

impl PollQueueLoop {
    pub fn new(
        queue: impl Into<String>,
        source: Arc<dyn JobStore>,
        poll_interval: StdDuration,
        suspended: bool,
    ) -> (Self, PollQueueHandle) {
        let queue = queue.into();
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let loop_ = Self {
            queue: queue.clone(),
            source,
            poll_interval,
            suspended,
            outstanding: 0,
            free_workers: VecDeque::new(),
            buffered: VecDeque::new(),
            commands: rx,
        };
        (loop_, PollQueueHandle { queue, commands: tx })
    }

    pub fn outstanding(&self) -> u64 {
        self.outstanding
    }

    /// Runs until every `PollQueueHandle` is dropped.
    pub async fn run(mut self) {
        let mut next_poll = if self.suspended {
            None
        } else {
            Some(Instant::now())
        };

        loop {
            let sleep = match next_poll {
                Some(at) => Either::Left(tokio::time::sleep_until(at)),
                None => Either::Right(std::future::pending()),
            };

            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(cmd) => next_poll = self.handle_command(cmd, next_poll).await,
                        None => break,
                    }
                }
                _ = sleep => {
                    next_poll = self.poll_once().await;
                }
            }
        }
    }

    async fn poll_once(&mut self) -> Option<Instant> {
        if self.suspended {
            return None;
        }

        match self.source.reserve().await {
            Ok(Some(job)) => {
                self.dispatch_or_buffer(job);
                if self.free_workers.is_empty() {
                    None
                } else {
                    Some(Instant::now())
                }
            }
            Ok(None) => Some(Instant::now() + self.poll_interval),
            Err(QueueError::Transient(err)) => {
                tracing::warn!(queue = %self.queue, error = %err, "transient storage error, backing off");
                Some(Instant::now() + self.poll_interval)
            }
            Err(err) => {
                tracing::error!(queue = %self.queue, error = %err, "reserve failed");
                Some(Instant::now() + self.poll_interval)
            }
        }
    }

    fn dispatch_or_buffer(&mut self, mut job: Job) {
        while let Some(worker) = self.free_workers.pop_front() {
            match worker.send(job) {
                Ok(()) => {
                    self.outstanding += 1;
                    return;
                }
                // Receiver already gone; try the next free worker with the
                // same job instead of losing it.
                Err(returned_job) => job = returned_job,
            }
        }
        self.buffered.push_back(job);
    }

    async fn handle_command(&mut self, cmd: PollCommand, next_poll: Option<Instant>) -> Option<Instant> {
        match cmd {
            PollCommand::Suspend => {
                self.suspended = true;
                None
            }
            PollCommand::Resume => {
                self.suspended = false;
                Some(Instant::now())
            }
            PollCommand::Status(reply) => {
                match self.source.status().await {
                    Ok(status) => {
                        let _ = reply.send(status);
                    }
                    Err(err) => tracing::warn!(queue = %self.queue, error = %err, "status failed"),
                }
                next_poll
            }
            PollCommand::Filter(selector, reply) => {
                match self.source.filter(selector).await {
                    Ok(jobs) => {
                        let _ = reply.send(jobs);
                    }
                    Err(err) => tracing::warn!(queue = %self.queue, error = %err, "filter failed"),
                }
                next_poll
            }
            PollCommand::Cancel(primary_key, reply) => {
                match self.source.cancel(&primary_key).await {
                    Ok(outcome) => {
                        let _ = reply.send(outcome);
                    }
                    Err(err) => {
                        tracing::warn!(queue = %self.queue, error = %err, "cancel failed");
                        let _ = reply.send(CancelOutcome::NotFound);
                    }
                }
                next_poll
            }
            PollCommand::WorkerReady(worker) => {
                // A suspended queue never hands out buffered work (spec §4.3);
                // the worker just joins the free list until resumed.
                if self.suspended {
                    self.free_workers.push_back(worker);
                    next_poll
                } else if let Some(job) = self.buffered.pop_front() {
                    match worker.send(job) {
                        Ok(()) => self.outstanding += 1,
                        Err(job) => self.buffered.push_front(job),
                    }
                    next_poll
                } else {
                    self.free_workers.push_back(worker);
                    Some(Instant::now())
                }
            }
            PollCommand::Ack(job) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if let Err(err) = self.source.ack(&job).await {
                    tracing::error!(queue = %self.queue, error = %err, "ack failed");
                }
                if self.suspended {
                    next_poll
                } else {
                    Some(Instant::now())
                }
            }
            PollCommand::Nack(job, delay) => {
                self.outstanding = self.outstanding.saturating_sub(1);
                if let Err(err) = self.source.nack(&job, delay).await {
                    tracing::error!(queue = %self.queue, error = %err, "nack failed");
                }
                if self.suspended {
                    next_poll
                } else {
                    Some(Instant::now())
                }
            }
        }
    }
}
