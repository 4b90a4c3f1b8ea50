//! Test doubles for exercising the poll queue (C3), job pipeline (C4) and
//! failure modes (C5) without a database.
//!
//! `InMemoryJobStore` implements `seesaw_core::JobStore` against a `Mutex`-
//! guarded `Vec` instead of lock-column SQL. It keeps the same externally
//! observable state machine (ready/delayed/in-progress/stale/abandoned) so
//! tests written against it exercise the same `reserve`/`ack`/`nack`/`cancel`
//! contract the PostgreSQL backend does, just without a row-locking dialect
//! underneath.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;

use seesaw_core::{CancelOutcome, FilterSelector, Job, JobStore, PrimaryKey, QueueError, QueueStatus, TaskRef};

#[derive(Debug, Clone)]
enum RowState {
    Ready,
    Delayed(DateTime<Utc>),
    InProgress,
    Stale,
    Abandoned,
    Finished,
}

#[derive(Debug, Clone)]
struct Row {
    primary_key: PrimaryKey,
    task: TaskRef,
    state: RowState,
    failure_private: Option<Value>,
}

/// An in-memory stand-in for the lock-column PostgreSQL source, for tests
/// that don't want to stand up a database.
pub struct InMemoryJobStore {
    queue: String,
    rows: Mutex<Vec<Row>>,
}

impl InMemoryJobStore {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Seeds a ready row, as if a row in the user's table had just been
    /// inserted with a ready lock value.
    pub fn seed_ready(&self, primary_key: PrimaryKey, task: TaskRef) {
        self.rows.lock().unwrap().push(Row {
            primary_key,
            task,
            state: RowState::Ready,
            failure_private: None,
        });
    }

    /// Moves an in-progress row to stale, as if its owning worker had died
    /// without acking or nacking. `reset_stale` is the only way back to
    /// ready from here, matching the real backend's crash-recovery path.
    pub fn simulate_crash(&self, primary_key: &PrimaryKey) {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|r| &r.primary_key == primary_key) {
            if matches!(row.state, RowState::InProgress) {
                row.state = RowState::Stale;
            }
        }
    }

    fn find_mut<'a>(rows: &'a mut [Row], primary_key: &PrimaryKey) -> Option<&'a mut Row> {
        rows.iter_mut().find(|r| &r.primary_key == primary_key)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn reserve(&self) -> Result<Option<Job>, QueueError> {
        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now();

        let candidate = rows.iter_mut().find(|r| match &r.state {
            RowState::Ready => true,
            RowState::Delayed(run_at) => *run_at <= now,
            _ => false,
        });

        let Some(row) = candidate else {
            return Ok(None);
        };

        row.state = RowState::InProgress;
        let mut job = Job::new(self.queue.clone(), row.task.clone(), row.primary_key.clone());
        job.failure_private = row.failure_private.clone();
        Ok(Some(job))
    }

    async fn ack(&self, job: &Job) -> Result<(), QueueError> {
        let mut rows = self.rows.lock().unwrap();
        let row = Self::find_mut(&mut rows, &job.private)
            .ok_or_else(|| QueueError::Invariant("ack on unknown primary key".into()))?;
        row.state = if job.is_completed() {
            RowState::Finished
        } else {
            RowState::Abandoned
        };
        Ok(())
    }

    async fn nack(&self, job: &Job, delay: Duration) -> Result<(), QueueError> {
        let mut rows = self.rows.lock().unwrap();
        let row = Self::find_mut(&mut rows, &job.private)
            .ok_or_else(|| QueueError::Invariant("nack on unknown primary key".into()))?;
        row.state = RowState::Delayed(Utc::now() + delay);
        row.failure_private = job.failure_private.clone();
        Ok(())
    }

    async fn cancel(&self, primary_key: &PrimaryKey) -> Result<CancelOutcome, QueueError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = Self::find_mut(&mut rows, primary_key) else {
            return Ok(CancelOutcome::NotFound);
        };

        match row.state {
            RowState::Ready | RowState::Delayed(_) => {
                row.state = RowState::Finished;
                Ok(CancelOutcome::Cancelled)
            }
            RowState::InProgress | RowState::Stale => Ok(CancelOutcome::InProgress),
            RowState::Abandoned | RowState::Finished => Ok(CancelOutcome::NotFound),
        }
    }

    async fn status(&self) -> Result<QueueStatus, QueueError> {
        let rows = self.rows.lock().unwrap();
        let mut status = QueueStatus::default();
        for row in rows.iter() {
            status.total += 1;
            match row.state {
                RowState::Ready => status.ready += 1,
                RowState::Delayed(_) => status.delayed += 1,
                RowState::InProgress => status.in_progress += 1,
                RowState::Stale => status.stale += 1,
                RowState::Abandoned => status.abandoned += 1,
                RowState::Finished => {}
            }
        }
        Ok(status)
    }

    async fn filter(&self, selector: FilterSelector) -> Result<Vec<Job>, QueueError> {
        let rows = self.rows.lock().unwrap();
        let jobs = rows
            .iter()
            .filter(|r| matches!((&selector, &r.state), (FilterSelector::Abandoned, RowState::Abandoned)))
            .map(|r| {
                let mut job = Job::new(self.queue.clone(), r.task.clone(), r.primary_key.clone());
                job.failure_private = r.failure_private.clone();
                job
            })
            .collect();
        Ok(jobs)
    }

    async fn reset_stale(&self) -> Result<u64, QueueError> {
        let mut rows = self.rows.lock().unwrap();
        let mut restored = 0;
        for row in rows.iter_mut() {
            if matches!(row.state, RowState::Stale) {
                row.state = RowState::Ready;
                restored += 1;
            }
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(n: i64) -> PrimaryKey {
        vec![("id".to_string(), Value::from(n))]
    }

    #[tokio::test]
    async fn reserve_returns_ready_rows_and_flips_to_in_progress() {
        let store = InMemoryJobStore::new("widgets");
        store.seed_ready(pk(1), TaskRef::run_with_primary_key(&pk(1)));

        let job = store.reserve().await.unwrap().expect("one ready row");
        assert_eq!(job.private, pk(1));
        assert!(store.reserve().await.unwrap().is_none());

        let status = store.status().await.unwrap();
        assert_eq!(status.in_progress, 1);
        assert_eq!(status.ready, 0);
    }

    #[tokio::test]
    async fn ack_without_completed_at_abandons() {
        let store = InMemoryJobStore::new("widgets");
        store.seed_ready(pk(1), TaskRef::run_with_primary_key(&pk(1)));
        let job = store.reserve().await.unwrap().unwrap();

        store.ack(&job).await.unwrap();

        let abandoned = store.filter(FilterSelector::Abandoned).await.unwrap();
        assert_eq!(abandoned.len(), 1);
    }

    #[tokio::test]
    async fn crash_then_reset_stale_returns_row_to_ready() {
        let store = InMemoryJobStore::new("widgets");
        store.seed_ready(pk(1), TaskRef::run_with_primary_key(&pk(1)));
        let job = store.reserve().await.unwrap().unwrap();

        store.simulate_crash(&job.private);
        assert_eq!(store.status().await.unwrap().stale, 1);

        let restored = store.reset_stale().await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(store.status().await.unwrap().ready, 1);

        assert!(store.reserve().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cancel_reports_in_progress_for_reserved_rows() {
        let store = InMemoryJobStore::new("widgets");
        store.seed_ready(pk(1), TaskRef::run_with_primary_key(&pk(1)));
        let job = store.reserve().await.unwrap().unwrap();

        let outcome = store.cancel(&job.private).await.unwrap();
        assert_eq!(outcome, CancelOutcome::InProgress);
    }

    #[tokio::test]
    async fn cancel_unknown_row_reports_not_found() {
        let store = InMemoryJobStore::new("widgets");
        let outcome = store.cancel(&pk(99)).await.unwrap();
        assert_eq!(outcome, CancelOutcome::NotFound);
    }
}
