//! PostgreSQL-backed `JobStore` for the Seesaw framework, built on the
//! lock-column scheme: no dedicated jobs table, no lease table — a single
//! signed 64-bit column on the user's own row encodes ready/delayed/
//! in-progress/stale/abandoned/finished, manipulated entirely through
//! `SELECT ... FOR UPDATE SKIP LOCKED` (or CockroachDB's serializable-retry
//! equivalent).
//!
//! # Schema
//!
//! Each queue adds two columns to the table it polls:
//!
//! ```sql
//! ALTER TABLE widgets
//!     ADD COLUMN honeydew_default_lock bigint,
//!     ADD COLUMN honeydew_default_private jsonb;
//!
//! CREATE INDEX idx_widgets_honeydew_default_lock ON widgets (honeydew_default_lock);
//! ```
//!
//! A row becomes a job the moment it's inserted with `honeydew_default_lock`
//! defaulted into the ready range (`now - far_in_the_past`, computed by the
//! migration or the application). It leaves the queue when the lock column
//! is set to `NULL` (finished) or `-1` (abandoned); the row itself is never
//! deleted by queue activity.
//!
//! # Usage
//!
//! ```rust,ignore
//! use seesaw_job_postgres::{EctoSource, EctoSourceConfig};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let config = EctoSourceConfig::new("default", "widgets", vec!["id".to_string()]);
//! let source = EctoSource::new(pool, config)?;
//! ```

mod codec;
mod dialect;
mod source;

pub use codec::{JsonKeyCodec, KeyCodec};
pub use dialect::{CockroachDb, Database, Postgres, SqlDialect, FAR_IN_THE_PAST_MS, STALE_WINDOW_MS};
pub use source::{EctoSource, EctoSourceConfig, RunIf, TaskFn};
