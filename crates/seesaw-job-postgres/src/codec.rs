//! Primary-key marshaling (spec §4.2's "marshaling discipline", I5): the
//! rest of the framework only ever sees a primary key as an ordered list of
//! `(field, serde_json::Value)` pairs. A `KeyCodec` is the capability
//! boundary that binds such a value into a query and decodes it back out of
//! a row, so `EctoSource` never hard-codes whether a key is a UUID, a
//! bigint, or something else.

use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::query::Query;
use sqlx::{Postgres, Row};
use uuid::Uuid;

use seesaw_core::QueueError;

/// Dumps a key value to its bound SQL form and loads it back. Implement
/// this for key shapes `JsonKeyCodec` doesn't cover (custom binary ids,
/// composite wrapper types).
pub trait KeyCodec: Send + Sync {
    fn bind<'q>(&self, query: Query<'q, Postgres, PgArguments>, value: &Value) -> Result<Query<'q, Postgres, PgArguments>, QueueError>;

    fn load(&self, row: &PgRow, column: &str) -> Result<Value, QueueError>;
}

/// The default codec (I5's common cases): integers bind as `bigint`,
/// strings that parse as a UUID bind as `uuid`, everything else binds as
/// `text`. Decoding tries the same three in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonKeyCodec;

impl KeyCodec for JsonKeyCodec {
    fn bind<'q>(&self, query: Query<'q, Postgres, PgArguments>, value: &Value) -> Result<Query<'q, Postgres, PgArguments>, QueueError> {
        match value {
            Value::Number(n) if n.is_i64() => Ok(query.bind(n.as_i64().expect("checked is_i64"))),
            Value::Number(n) if n.is_u64() => Ok(query.bind(n.as_u64().expect("checked is_u64") as i64)),
            Value::String(s) => match Uuid::parse_str(s) {
                Ok(uuid) => Ok(query.bind(uuid)),
                Err(_) => Ok(query.bind(s.clone())),
            },
            other => Err(QueueError::Config(format!("JsonKeyCodec cannot bind primary-key value {other}"))),
        }
    }

    fn load(&self, row: &PgRow, column: &str) -> Result<Value, QueueError> {
        if let Ok(v) = row.try_get::<i64, _>(column) {
            return Ok(Value::from(v));
        }
        if let Ok(v) = row.try_get::<Uuid, _>(column) {
            return Ok(Value::String(v.to_string()));
        }
        if let Ok(v) = row.try_get::<String, _>(column) {
            return Ok(Value::String(v));
        }
        Err(QueueError::Invariant(format!(
            "column {column:?} is neither an integer, a uuid, nor text; no codec could decode it"
        )))
    }
}
