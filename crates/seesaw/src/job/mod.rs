//! The durable job model shared by every queue backend (the lock-column
//! PostgreSQL backend in `seesaw-job-postgres`, and any in-memory or
//! replicated-table backend behind the same `JobStore` interface).
//!
//! A job is a named task reserved from a named queue, executed, and then
//! acknowledged, retried, or handed to a failure mode. Storage is abstracted
//! behind `JobStore`; this module only knows the shape of a job and the
//! operations a store must support, not how any particular backend persists
//! them.

mod registry;

pub use registry::{CommandRegistry, DeserializationError, TaskFn};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// An ordered list of primary-key `(field, value)` pairs identifying one row.
/// Opaque to everything except the backend that produced it: callers must
/// round-trip it through the same `JobStore` without inspecting it.
pub type PrimaryKey = Vec<(String, Value)>;

/// Where to deliver a job's result once it finishes, for callers using
/// `yield_for` (spec §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReplyAddress {
    pub caller_id: Uuid,
    pub request_id: Uuid,
}

/// A job's task: a symbolic handler id plus its JSON-encoded arguments. The
/// worker pool looks up `handler_id` in a `CommandRegistry` (spec §9: tagged
/// variant instead of a runtime-dispatched callable).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRef {
    pub handler_id: String,
    pub args: Value,
}

impl TaskRef {
    pub fn new(handler_id: impl Into<String>, args: Value) -> Self {
        Self {
            handler_id: handler_id.into(),
            args,
        }
    }

    /// The default task when a queue has no `task_fn`: `(:run, [pk])`.
    pub fn run_with_primary_key(primary_key: &PrimaryKey) -> Self {
        let args = Value::Object(
            primary_key
                .iter()
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect(),
        );
        Self::new("run", args)
    }
}

/// The outcome delivered to a caller that asked for a reply (spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobResult {
    Ok(Value),
    Exit(String),
    Moved(String),
}

/// A reserved unit of work, carrying everything the pipeline (C4) and the
/// failure modes (C5) need to ack, nack, or re-route it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub queue: String,
    pub task: TaskRef,
    /// Backend-specific handle identifying the row this job came from.
    pub private: PrimaryKey,
    /// Opaque state persisted between attempts (e.g. a retry counter).
    pub failure_private: Option<Value>,
    pub from: Option<ReplyAddress>,
    pub result: Option<JobResult>,
    /// Set once acked after a successful run; absent while pending or when
    /// acked as abandoned. Distinguishes finish from abandon on `ack`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(queue: impl Into<String>, task: TaskRef, private: PrimaryKey) -> Self {
        Self {
            queue: queue.into(),
            task,
            private,
            failure_private: None,
            from: None,
            result: None,
            completed_at: None,
        }
    }

    pub fn with_reply(mut self, from: ReplyAddress) -> Self {
        self.from = Some(from);
        self
    }

    /// True once this job has been acked following a *successful* run, as
    /// opposed to being acked while still pending (the abandon path).
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// The raw output of `JobStore::reserve` before a queue's `task_fn` wraps it
/// into a full `Job`: just enough to identify the row and recover its
/// failure-private state.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub primary_key: PrimaryKey,
    pub failure_private: Option<Value>,
}

/// Categorizes why a job's execution failed, so a failure mode (C5) can
/// decide whether retrying is even worth attempting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureKind {
    Retryable,
    NonRetryable,
}

/// What `JobStore::cancel` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    InProgress,
    NotFound,
}

/// The only selector `filter` currently supports (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterSelector {
    Abandoned,
}

/// Row counts by lock-column state (spec §4.1 `status_sql`). Summing the
/// five non-total fields should equal `total`, except during brief
/// transitions (P6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub total: i64,
    pub abandoned: i64,
    pub ready: i64,
    pub delayed: i64,
    pub stale: i64,
    pub in_progress: i64,
}

/// Errors a `JobStore` can raise, categorized per spec §7.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Bad configuration: unknown dialect, missing columns. Fails queue
    /// construction; never raised mid-operation.
    #[error("queue configuration error: {0}")]
    Config(String),

    /// Connection loss, deadlock, or similar: the poll loop should treat the
    /// attempt as `empty` and back off rather than propagate.
    #[error("transient storage error: {0}")]
    Transient(#[source] anyhow::Error),

    /// An operation's invariant was violated (e.g. `nack` or `cancel`
    /// affected more or fewer rows than the one it required). A bug, not a
    /// retryable condition; propagates to the queue's supervisor.
    #[error("queue invariant violated: {0}")]
    Invariant(String),
}

/// Generic poll-source contract. The Poll Queue Loop (C3) only ever talks to
/// a queue through this trait; the lock-column PostgreSQL backend is one
/// implementation (see `seesaw-job-postgres::EctoSource`), and any
/// in-memory or replicated-table backend can be another.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Atomically claims one ready row, if any, and loads it into a `Job`.
    async fn reserve(&self) -> Result<Option<Job>, QueueError>;

    /// Declares a reserved job done. `job.completed_at` distinguishes a
    /// normal finish (lock cleared) from an abandon (lock set to the
    /// terminal marker) — see spec §9 open question 1.
    async fn ack(&self, job: &Job) -> Result<(), QueueError>;

    /// Reschedules a reserved job for a future attempt after `delay`.
    async fn nack(&self, job: &Job, delay: Duration) -> Result<(), QueueError>;

    /// Cancels a row identified by primary key if it is ready or delayed.
    async fn cancel(&self, primary_key: &PrimaryKey) -> Result<CancelOutcome, QueueError>;

    /// Row counts by lock-column state.
    async fn status(&self) -> Result<QueueStatus, QueueError>;

    /// Lists jobs matching `selector`. Only `Abandoned` is supported today.
    async fn filter(&self, selector: FilterSelector) -> Result<Vec<Job>, QueueError>;

    /// Restores rows whose owning worker appears to have died back to ready.
    /// Idempotent; returns the number of rows restored. The sole recovery
    /// mechanism for a crashed worker (P2).
    async fn reset_stale(&self) -> Result<u64, QueueError>;
}
