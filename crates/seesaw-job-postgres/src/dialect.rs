//! The SQL dialect (spec §4.1): every operation returns SQL text built from
//! table/column names supplied by the source, never user data. Runtime
//! values (primary keys, the private blob, the delay) are always bound as
//! query parameters by the caller, never interpolated.
//!
//! The lock column's numeric ranges (see `seesaw-core`'s state-machine
//! table) are carved by two constants: `FAR_IN_THE_PAST_MS`, an instant
//! close to 1994, and `STALE_WINDOW_MS`, a five-year span. Both dialects
//! share them so `ready_watermark` and the stale boundary mean the same
//! thing regardless of which database runs the SQL.

use seesaw_core::QueueError;

/// `1994-01-01T00:00:00Z` in milliseconds since the epoch.
pub const FAR_IN_THE_PAST_MS: i64 = 757_382_400_000;

/// Five years, in milliseconds.
pub const STALE_WINDOW_MS: i64 = 157_680_000_000;

/// A SQL dialect capability (spec §4.1): object-safe so `EctoSource` can
/// hold one behind `Arc<dyn SqlDialect>` chosen at construction time from
/// the `database` config option.
pub trait SqlDialect: Send + Sync {
    /// The column type used for the lock column.
    fn integer_type(&self) -> &'static str {
        "bigint"
    }

    /// A scalar expression evaluating to `now` as integer milliseconds.
    fn now_expr(&self) -> String;

    /// A scalar expression evaluating to `ready_watermark` at query time.
    fn ready_expr(&self) -> String {
        format!("({} - {FAR_IN_THE_PAST_MS})", self.now_expr())
    }

    /// The table reference to use in generated SQL, schema-qualified when
    /// `schema` is given. Both parts are quoted independently so a schema
    /// containing a `.` can't widen into an unintended table reference.
    fn table_name(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!("\"{schema}\".\"{table}\""),
            None => format!("\"{table}\""),
        }
    }

    /// Algorithm R1: select one ready row, mark it in-progress, return its
    /// primary key and private blob — one atomic statement so concurrent
    /// pollers on different nodes never reserve the same row.
    fn reserve_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        lock_field: &str,
        private_field: &str,
        pk_fields: &[String],
        stale_timeout_ms: i64,
    ) -> String;

    /// Sets lock to `ready_watermark + delay_seconds*1000` and overwrites
    /// the private blob. Parameters: `($1 delay_seconds, $2 private_blob,
    /// $3.. pk_values)`.
    fn delay_ready_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, pk_fields: &[String]) -> String;

    /// Sets lock to `NULL` where `pk = ?` and the row is cancellable
    /// (ready or delayed). Always matches an existing row regardless of its
    /// current state and returns its lock value *before* this statement, as
    /// `previous_lock`, so the caller can tell "not found" (0 rows) from
    /// "cancelled"/"in progress" (1 row, inspect `previous_lock`).
    /// Parameters: `pk_values`.
    fn cancel_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, pk_fields: &[String]) -> String;

    /// One row of counts: `total, abandoned, ready, delayed, stale,
    /// in_progress`.
    fn status_sql(&self, schema: Option<&str>, table: &str, lock_field: &str) -> String;

    /// Restores stale rows (a worker reserved them, then died) to ready.
    /// Idempotent.
    fn reset_stale_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str) -> String;

    /// Primary keys and private blobs of every abandoned row.
    fn filter_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, pk_fields: &[String]) -> String;
}

fn quote_cols(fields: &[String]) -> String {
    fields.iter().map(|f| format!("\"{f}\"")).collect::<Vec<_>>().join(", ")
}

fn order_cols(fields: &[String]) -> String {
    fields.iter().map(|f| format!("\"{f}\" ASC")).collect::<Vec<_>>().join(", ")
}

fn pk_eq(fields: &[String], offset: usize) -> String {
    fields
        .iter()
        .enumerate()
        .map(|(i, f)| format!("\"{f}\" = ${}", offset + i + 1))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn pk_join(left: &str, right: &str, fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| format!("{left}.\"{f}\" = {right}.\"{f}\""))
        .collect::<Vec<_>>()
        .join(" AND ")
}

#[allow(clippy::too_many_arguments)]
fn reserve_sql_shared(
    schema: Option<&str>,
    table: &str,
    lock_field: &str,
    private_field: &str,
    pk_fields: &[String],
    stale_timeout_ms: i64,
    skip_locked: bool,
    dialect: &dyn SqlDialect,
) -> String {
    let table = dialect.table_name(schema, table);
    let pk_cols = quote_cols(pk_fields);
    let order = order_cols(pk_fields);
    let join = pk_join("t", "candidate", pk_fields);
    let skip_locked = if skip_locked { " SKIP LOCKED" } else { "" };
    format!(
        "UPDATE {table} AS t \
         SET \"{lock_field}\" = {now} + {stale_timeout_ms} \
         FROM ( \
             SELECT {pk_cols} FROM {table} \
             WHERE \"{lock_field}\" >= 0 AND \"{lock_field}\" <= {ready} \
             ORDER BY \"{lock_field}\" ASC, {order} \
             LIMIT 1 \
             FOR UPDATE{skip_locked} \
         ) AS candidate \
         WHERE {join} \
         RETURNING {pk_cols}, t.\"{private_field}\"",
        now = dialect.now_expr(),
        ready = dialect.ready_expr(),
    )
}

fn delay_ready_sql_shared(schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, pk_fields: &[String], dialect: &dyn SqlDialect) -> String {
    let table = dialect.table_name(schema, table);
    format!(
        "UPDATE {table} SET \"{lock_field}\" = {ready} + ($1 * 1000), \"{private_field}\" = $2 WHERE {eq}",
        ready = dialect.ready_expr(),
        eq = pk_eq(pk_fields, 2),
    )
}

fn cancel_sql_shared(schema: Option<&str>, table: &str, lock_field: &str, pk_fields: &[String], dialect: &dyn SqlDialect) -> String {
    let table = dialect.table_name(schema, table);
    let join = pk_join("t", "prior", pk_fields);
    format!(
        "WITH prior AS ( \
             SELECT {pk_cols}, \"{lock_field}\" AS prev_lock FROM {table} WHERE {eq} FOR UPDATE \
         ) \
         UPDATE {table} AS t \
         SET \"{lock_field}\" = CASE \
             WHEN prior.prev_lock >= 0 AND prior.prev_lock < ({now} - {STALE_WINDOW_MS}) THEN NULL \
             ELSE t.\"{lock_field}\" \
         END \
         FROM prior \
         WHERE {join} \
         RETURNING prior.prev_lock AS previous_lock",
        pk_cols = quote_cols(pk_fields),
        eq = pk_eq(pk_fields, 0),
        now = dialect.now_expr(),
    )
}

fn status_sql_shared(schema: Option<&str>, lock_field: &str, table: &str, dialect: &dyn SqlDialect) -> String {
    let table = dialect.table_name(schema, table);
    let now = dialect.now_expr();
    let ready = dialect.ready_expr();
    format!(
        "SELECT \
             COUNT(*) AS total, \
             COUNT(*) FILTER (WHERE \"{lock_field}\" = -1) AS abandoned, \
             COUNT(*) FILTER (WHERE \"{lock_field}\" >= 0 AND \"{lock_field}\" <= {ready}) AS ready, \
             COUNT(*) FILTER (WHERE \"{lock_field}\" > {ready} AND \"{lock_field}\" < ({now} - {STALE_WINDOW_MS})) AS delayed, \
             COUNT(*) FILTER (WHERE \"{lock_field}\" >= ({now} - {STALE_WINDOW_MS}) AND \"{lock_field}\" < {now}) AS stale, \
             COUNT(*) FILTER (WHERE \"{lock_field}\" >= {now}) AS in_progress \
         FROM {table} \
         WHERE \"{lock_field}\" IS NOT NULL"
    )
}

fn reset_stale_sql_shared(schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, dialect: &dyn SqlDialect) -> String {
    let table = dialect.table_name(schema, table);
    format!(
        "UPDATE {table} SET \"{lock_field}\" = {ready}, \"{private_field}\" = NULL \
         WHERE \"{lock_field}\" >= ({now} - {STALE_WINDOW_MS}) AND \"{lock_field}\" < {now}",
        now = dialect.now_expr(),
        ready = dialect.ready_expr(),
    )
}

fn filter_sql_shared(schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, pk_fields: &[String], dialect: &dyn SqlDialect) -> String {
    let table = dialect.table_name(schema, table);
    format!(
        "SELECT {pk_cols}, \"{private_field}\" FROM {table} WHERE \"{lock_field}\" = -1",
        pk_cols = quote_cols(pk_fields),
    )
}

/// The common case: PostgreSQL's `SELECT ... FOR UPDATE SKIP LOCKED` inside
/// R1's subquery makes reservation contention-free across nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Postgres;

impl SqlDialect for Postgres {
    fn now_expr(&self) -> String {
        "(extract(epoch from clock_timestamp()) * 1000)::bigint".to_string()
    }

    fn reserve_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        lock_field: &str,
        private_field: &str,
        pk_fields: &[String],
        stale_timeout_ms: i64,
    ) -> String {
        reserve_sql_shared(schema, table, lock_field, private_field, pk_fields, stale_timeout_ms, true, self)
    }

    fn delay_ready_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, pk_fields: &[String]) -> String {
        delay_ready_sql_shared(schema, table, lock_field, private_field, pk_fields, self)
    }

    fn cancel_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, pk_fields: &[String]) -> String {
        cancel_sql_shared(schema, table, lock_field, pk_fields, self)
    }

    fn status_sql(&self, schema: Option<&str>, table: &str, lock_field: &str) -> String {
        status_sql_shared(schema, lock_field, table, self)
    }

    fn reset_stale_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str) -> String {
        reset_stale_sql_shared(schema, table, lock_field, private_field, self)
    }

    fn filter_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, pk_fields: &[String]) -> String {
        filter_sql_shared(schema, table, lock_field, private_field, pk_fields, self)
    }
}

/// CockroachDB lacks `SKIP LOCKED`; R1 instead relies on its serializable
/// isolation plus automatic retry of conflicting transactions, so a row
/// already claimed by another node simply causes this statement to retry
/// rather than block or double-reserve. `FOR UPDATE` is kept — Cockroach
/// supports it as an intent-acquisition hint — only `SKIP LOCKED` is
/// dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct CockroachDb;

impl SqlDialect for CockroachDb {
    fn now_expr(&self) -> String {
        "(extract(epoch from now()) * 1000)::int8".to_string()
    }

    fn reserve_sql(
        &self,
        schema: Option<&str>,
        table: &str,
        lock_field: &str,
        private_field: &str,
        pk_fields: &[String],
        stale_timeout_ms: i64,
    ) -> String {
        reserve_sql_shared(schema, table, lock_field, private_field, pk_fields, stale_timeout_ms, false, self)
    }

    fn delay_ready_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, pk_fields: &[String]) -> String {
        delay_ready_sql_shared(schema, table, lock_field, private_field, pk_fields, self)
    }

    fn cancel_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, pk_fields: &[String]) -> String {
        cancel_sql_shared(schema, table, lock_field, pk_fields, self)
    }

    fn status_sql(&self, schema: Option<&str>, table: &str, lock_field: &str) -> String {
        status_sql_shared(schema, lock_field, table, self)
    }

    fn reset_stale_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str) -> String {
        reset_stale_sql_shared(schema, table, lock_field, private_field, self)
    }

    fn filter_sql(&self, schema: Option<&str>, table: &str, lock_field: &str, private_field: &str, pk_fields: &[String]) -> String {
        filter_sql_shared(schema, table, lock_field, private_field, pk_fields, self)
    }
}

/// Which engine `EctoSource` is talking to, and therefore which dialect to
/// build R1 with. `Other` exists so an unrecognized config value becomes a
/// `QueueError::Config` at construction instead of a panic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Database {
    #[default]
    Postgres,
    CockroachDb,
    Other(String),
}

impl Database {
    pub(crate) fn dialect(&self) -> Result<std::sync::Arc<dyn SqlDialect>, QueueError> {
        match self {
            Database::Postgres => Ok(std::sync::Arc::new(Postgres)),
            Database::CockroachDb => Ok(std::sync::Arc::new(CockroachDb)),
            Database::Other(name) => Err(QueueError::Config(format!("unknown database dialect {name:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn postgres_reserve_sql_uses_skip_locked() {
        let sql = Postgres.reserve_sql(None, "widgets", "honeydew_default_lock", "honeydew_default_private", &fields(&["id"]), 30_000);
        assert!(sql.contains("FOR UPDATE SKIP LOCKED"));
        assert!(sql.contains("RETURNING \"id\", t.\"honeydew_default_private\""));
    }

    #[test]
    fn cockroach_reserve_sql_omits_skip_locked() {
        let sql = CockroachDb.reserve_sql(None, "widgets", "honeydew_default_lock", "honeydew_default_private", &fields(&["id"]), 30_000);
        assert!(sql.contains("FOR UPDATE"));
        assert!(!sql.contains("SKIP LOCKED"));
    }

    #[test]
    fn delay_ready_sql_binds_delay_then_private_then_pk() {
        let sql = Postgres.delay_ready_sql(None, "widgets", "lock", "private", &fields(&["tenant_id", "id"]));
        assert!(sql.contains("\"tenant_id\" = $3"));
        assert!(sql.contains("\"id\" = $4"));
    }

    #[test]
    fn database_other_is_a_config_error() {
        match Database::Other("oracle".to_string()).dialect() {
            Err(QueueError::Config(_)) => {}
            Err(err) => panic!("expected a config error, got {err}"),
            Ok(_) => panic!("expected a config error, got Ok"),
        }
    }

    #[test]
    fn compound_primary_keys_are_quoted_independently() {
        let sql = Postgres.cancel_sql(None, "widgets", "lock", &fields(&["tenant_id", "id"]));
        assert!(sql.contains("\"tenant_id\" = $1"));
        assert!(sql.contains("\"id\" = $2"));
    }

    #[test]
    fn schema_qualifies_the_table_reference_independently_of_the_table_name() {
        let sql = Postgres.reserve_sql(Some("jobs"), "widgets", "lock", "private", &fields(&["id"]), 30_000);
        assert!(sql.contains("UPDATE \"jobs\".\"widgets\" AS t"));
        assert!(sql.contains("FROM ( SELECT \"id\" FROM \"jobs\".\"widgets\""));
    }

    #[test]
    fn no_schema_falls_back_to_a_bare_table_reference() {
        let sql = Postgres.status_sql(None, "widgets", "lock");
        assert!(sql.contains("FROM \"widgets\" "));
        assert!(!sql.contains('.'));
    }
}
