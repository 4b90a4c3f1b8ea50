//! Facts (`Event`) and intent (`Command`), and the bookkeeping that lets the
//! runtime route and audit them without knowing their concrete types.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::fmt::Debug;
use uuid::Uuid;

/// Correlates every event and command spawned from one originating request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

/// How a command's effect should be executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run synchronously in the caller's task.
    Inline,
    /// Enqueue as a durable job, run as soon as a worker is free.
    Background,
    /// Enqueue as a durable job, run no earlier than `run_at`.
    Scheduled { run_at: DateTime<Utc> },
}

/// Declares the durable job a `Background`/`Scheduled` command becomes.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_type: String,
    pub max_retries: u32,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            max_retries: 3,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A fact: something that happened. No IO, immutable, describes the past.
pub trait Event: Debug + Send + Sync + 'static {}

/// An intent: a request for IO with transaction authority. One command maps
/// to one effect maps to one transaction.
pub trait Command: Debug + Send + Sync + 'static {
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Inline
    }

    fn job_spec(&self) -> Option<JobSpec> {
        None
    }

    /// Override manually, or derive `Serialize` and use `auto_serialize!()`.
    fn serialize_to_json(&self) -> Option<Value> {
        None
    }
}

/// Object-safe facade over any `Command`, used once the concrete command
/// type has been erased crossing the dispatcher boundary.
pub trait AnyCommand: Debug + Send + Sync {
    fn get_execution_mode(&self) -> ExecutionMode;
    fn get_job_spec(&self) -> Option<JobSpec>;
    fn serialize(&self) -> Option<Value>;
}

impl<T: Command> AnyCommand for T {
    fn get_execution_mode(&self) -> ExecutionMode {
        self.execution_mode()
    }

    fn get_job_spec(&self) -> Option<JobSpec> {
        self.job_spec()
    }

    fn serialize(&self) -> Option<Value> {
        self.serialize_to_json()
    }
}

/// A command that knows its own job type even once erased, so a failure mode
/// (e.g. `Move`, spec §4.5) can re-enqueue it against a different queue.
pub trait SerializableCommand: AnyCommand {
    fn job_type(&self) -> &str;
}

/// Where in a processing pipeline an event sits, for tap filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    Emitted,
    Decided,
    Dispatched,
}

/// An event plus the bookkeeping the runtime needs to route and audit it.
#[derive(Debug, Clone)]
pub struct EventEnvelope<E> {
    pub event: E,
    pub correlation_id: CorrelationId,
    pub role: EventRole,
}

/// A predicate an `EventTap` uses to select which envelopes it receives.
pub trait EnvelopeMatch<E>: Send + Sync {
    fn matches(&self, envelope: &EventEnvelope<E>) -> bool;
}

impl<E, F> EnvelopeMatch<E> for F
where
    F: Fn(&EventEnvelope<E>) -> bool + Send + Sync,
{
    fn matches(&self, envelope: &EventEnvelope<E>) -> bool {
        self(envelope)
    }
}

/// Combines multiple `EnvelopeMatch` predicates with AND semantics.
#[derive(Default)]
pub struct MatchChain<E> {
    matchers: Vec<Box<dyn EnvelopeMatch<E>>>,
}

impl<E> MatchChain<E> {
    pub fn new() -> Self {
        Self {
            matchers: Vec::new(),
        }
    }

    pub fn push(mut self, matcher: impl EnvelopeMatch<E> + 'static) -> Self {
        self.matchers.push(Box::new(matcher));
        self
    }
}

impl<E> EnvelopeMatch<E> for MatchChain<E> {
    fn matches(&self, envelope: &EventEnvelope<E>) -> bool {
        self.matchers.iter().all(|m| m.matches(envelope))
    }
}
