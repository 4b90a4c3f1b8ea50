//! Shared container + table setup for the integration suite. A single
//! Postgres container is started once and reused by every test (spinning
//! one per test is the dominant cost in a testcontainers-based suite); each
//! test instead gets its own table, named uniquely so tests run in parallel
//! without interfering with each other's lock columns.

use std::sync::Arc;

use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres as PostgresImage;
use tokio::sync::OnceCell;
use uuid::Uuid;

use seesaw_job_postgres::{Database, EctoSource, EctoSourceConfig};

struct SharedPostgres {
    pool: PgPool,
    // Keeps the container alive for the process lifetime; never read again.
    _container: ContainerAsync<PostgresImage>,
}

static SHARED: OnceCell<SharedPostgres> = OnceCell::const_new();

async fn shared() -> &'static SharedPostgres {
    SHARED
        .get_or_init(|| async {
            let container = PostgresImage::default()
                .start()
                .await
                .expect("failed to start postgres container");

            let host = container.get_host().await.expect("container host");
            let port = container.get_host_port_ipv4(5432).await.expect("container port");
            let url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

            let pool = PgPool::connect(&url).await.expect("failed to connect to postgres container");

            SharedPostgres { pool, _container: container }
        })
        .await
}

/// One freshly-created test table plus an `EctoSource` wired against it
/// under the `default` queue naming scheme, and the raw pool for seeding
/// rows directly with SQL (there is no `JobStore` insert operation — rows
/// enter the queue the way an application's own writes would).
pub struct TestQueue {
    pub source: Arc<EctoSource>,
    pub pool: PgPool,
    pub table: String,
}

impl TestQueue {
    pub async fn new() -> Self {
        let pool = shared().await.pool.clone();
        let table = format!("honeydew_test_{}", Uuid::new_v4().simple());

        sqlx::query(&format!(
            "CREATE TABLE \"{table}\" ( \
                 id bigint PRIMARY KEY, \
                 honeydew_default_lock bigint, \
                 honeydew_default_private jsonb \
             )"
        ))
        .execute(&pool)
        .await
        .expect("failed to create test table");

        sqlx::query(&format!("CREATE INDEX ON \"{table}\" (honeydew_default_lock)"))
            .execute(&pool)
            .await
            .expect("failed to create lock index");

        let mut config = EctoSourceConfig::new("default", table.clone(), vec!["id".to_string()]);
        config.database = Database::Postgres;
        let source = EctoSource::new(pool.clone(), config).expect("EctoSource construction should not fail with valid config");

        Self { source, pool, table }
    }

    /// Inserts a row ready for immediate reservation: lock=0 is always
    /// within `[0, ready_watermark]` since `ready_watermark` trails real
    /// time by decades.
    pub async fn seed_ready(&self, id: i64) {
        sqlx::query(&format!("INSERT INTO \"{}\" (id, honeydew_default_lock) VALUES ($1, 0)", self.table))
            .bind(id)
            .execute(&self.pool)
            .await
            .expect("failed to seed ready row");
    }

    pub async fn lock_value(&self, id: i64) -> Option<i64> {
        sqlx::query_scalar::<_, Option<i64>>(&format!("SELECT honeydew_default_lock FROM \"{}\" WHERE id = $1", self.table))
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .expect("row should exist")
    }
}
