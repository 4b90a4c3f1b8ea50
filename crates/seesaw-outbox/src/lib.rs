//! Durable event outbox for same-transaction event persistence.
//!
//! The outbox pattern persists events in the same database transaction as
//! business data, so they survive a crash between the write and the publish.
//! It is a narrower, unrelated mechanism to the lock-column poll queue in
//! `seesaw-job-postgres`: the outbox durably re-emits in-process `Event`s,
//! while the poll queue durably executes `Command`s against user rows.
//!
//! 1. An effect writes business data AND an outbox entry in one transaction.
//! 2. A background publisher polls the outbox, emits to the `EventBus`, and
//!    marks each entry published.
//! 3. A cleanup job removes old published entries.
//!
//! Events are persisted as JSON under a versioned type string
//! (`"notification.created.v1"`); a new version is a new type, not an
//! in-place migration.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use seesaw_core::{CorrelationId, Event};

/// An event that can be persisted to the transactional outbox.
pub trait OutboxEvent: Event + Serialize + DeserializeOwned {
    /// A versioned identifier, e.g. `"order.shipped.v1"`, used to route an
    /// entry back to its deserializer and to query the outbox table.
    fn event_type() -> &'static str;
}

/// A persisted outbox row.
#[derive(Debug, Clone)]
pub struct OutboxEntry {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

/// Writes events to the transactional outbox. Implementations should write
/// within the same database transaction as the business data they
/// accompany.
#[async_trait]
pub trait OutboxWriter: Send + Sync {
    async fn write_event<E: OutboxEvent + Send + Sync>(
        &mut self,
        event: &E,
        correlation_id: CorrelationId,
    ) -> Result<Uuid>;
}

/// Reads and manages outbox entries for the publisher. Implementations
/// should use `FOR UPDATE SKIP LOCKED` or equivalent so multiple publisher
/// instances can run concurrently without double-delivering an entry.
#[async_trait]
pub trait OutboxReader: Send + Sync {
    /// Claims up to `limit` unpublished entries, oldest first.
    async fn claim_unpublished(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    async fn mark_published(&self, ids: &[Uuid]) -> Result<()>;

    /// Deletes published entries older than `older_than`; returns the count removed.
    async fn cleanup_published(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Maps event type strings back to deserializer closures, so the publisher
/// can recover a typed `Event` from an `OutboxEntry` without matching on
/// every registered type by hand. The caller is responsible for emitting
/// the returned event onto whatever `EventBus` it belongs to.
pub trait OutboxEventRegistry: Send + Sync {
    fn deserialize_entry(&self, entry: &OutboxEntry) -> Result<Box<dyn std::fmt::Debug + Send>>;
}

/// Tuning for the background publisher/cleanup loop.
#[derive(Debug, Clone)]
pub struct OutboxPublisherConfig {
    pub poll_interval: std::time::Duration,
    pub batch_size: usize,
    pub retention: std::time::Duration,
    pub cleanup_interval: std::time::Duration,
}

impl Default for OutboxPublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: std::time::Duration::from_millis(100),
            batch_size: 100,
            retention: std::time::Duration::from_secs(7 * 24 * 60 * 60),
            cleanup_interval: std::time::Duration::from_secs(60 * 60),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbox_publisher_config_default() {
        let config = OutboxPublisherConfig::default();
        assert_eq!(config.poll_interval, std::time::Duration::from_millis(100));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.retention, std::time::Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.cleanup_interval, std::time::Duration::from_secs(60 * 60));
    }
}
