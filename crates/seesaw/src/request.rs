//! Syntactic sugar over the event bus for request/reply: emit a command,
//! await the one reply that answers it, with a timeout.
//!
//! This is what backs the queue's `yield_for` (spec §6): it blocks the
//! caller up to a timeout and returns `None` on timeout without disturbing
//! whatever is still producing the reply.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::timeout;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Waits up to `DEFAULT_REQUEST_TIMEOUT` for `rx` to resolve.
pub async fn dispatch_request<T>(rx: oneshot::Receiver<T>) -> Option<T> {
    dispatch_request_timeout(rx, DEFAULT_REQUEST_TIMEOUT).await
}

/// Waits up to `timeout_duration` for `rx` to resolve. A closed channel and a
/// timeout are both reported as `None`, matching `yield`'s "never disturbs
/// the job" contract.
pub async fn dispatch_request_timeout<T>(
    rx: oneshot::Receiver<T>,
    timeout_duration: Duration,
) -> Option<T> {
    match timeout(timeout_duration, rx).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(_)) | Err(_) => None,
    }
}
