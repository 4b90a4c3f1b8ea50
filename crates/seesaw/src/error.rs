//! Error types shared across the runtime, dispatcher and job pipeline.

use thiserror::Error;

/// How a failure should be treated by a retrying caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    /// Worth retrying: connection loss, deadlock, timeout.
    Transient,
    /// Retrying will not help: bad input, a business-rule violation.
    Permanent,
    /// A setup mistake; should fail fast rather than retry.
    Configuration,
}

/// Lets a failure mode (spec §4.5) decide retry vs. abandon without matching
/// on concrete error types.
pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

/// Top-level error type for the runtime and dispatcher.
#[derive(Debug, Error)]
pub enum SeesawError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("command failed: {0}")]
    CommandFailed(#[from] CommandFailed),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Categorizable for SeesawError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            SeesawError::Config(_) => SafeErrorCategory::Configuration,
            SeesawError::CommandFailed(_) => SafeErrorCategory::Permanent,
            SeesawError::Other(_) => SafeErrorCategory::Transient,
        }
    }
}

/// Raised when a command's effect throws; carries enough context for a
/// failure mode to log and route the outcome.
#[derive(Debug, Error)]
#[error("{job_type}: {reason}")]
pub struct CommandFailed {
    pub job_type: String,
    pub reason: String,
}

/// The outcome of running an operation over a batch of independent items,
/// where a partial failure should not discard the successes.
#[derive(Debug)]
pub enum BatchOutcome<T> {
    AllSucceeded(Vec<T>),
    PartialFailure {
        succeeded: Vec<T>,
        failed: Vec<SeesawError>,
    },
}

impl<T> BatchOutcome<T> {
    pub fn succeeded(&self) -> &[T] {
        match self {
            BatchOutcome::AllSucceeded(v) => v,
            BatchOutcome::PartialFailure { succeeded, .. } => succeeded,
        }
    }

    pub fn is_complete_success(&self) -> bool {
        matches!(self, BatchOutcome::AllSucceeded(_))
    }
}
