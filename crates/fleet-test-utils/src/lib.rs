//! Shared test fixtures for integration tests across the workspace.
//!
//! Two flavors, matching the two dialects [`fleet_db`] supports:
//! - [`sqlite_test_db`]: a throwaway sqlite file per test, migrated and
//!   ready to use. Cheap enough to call from every test.
//! - [`create_postgres_test_db`]/[`drop_postgres_test_db`]: a temporary
//!   database inside a shared, lazily-started Postgres container, for the
//!   dual-dialect tests that specifically exercise
//!   [`fleet_db::dialect::to_secondary_dialect`] against a real server.
//!   `FLEET_TEST_PG_URL` lets CI point at an already-running container
//!   instead of spinning one up per process.

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::Executor;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers::ImageExt;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use fleet_db::config::{Dialect, DbConfig};
use fleet_db::db::Db;
use fleet_db::pool;

/// A sqlite-backed `Db` over a fresh temp file, migrated and ready. The
/// `TempDir` must be kept alive for the duration of the test; dropping it
/// deletes the underlying file.
pub async fn sqlite_test_db() -> (Db, tempfile::TempDir) {
    let tmp = tempfile::TempDir::new().expect("failed to create temp dir for test db");
    let url = format!("sqlite://{}", tmp.path().join("test.db").display());
    let config = DbConfig::new(Dialect::Sqlite, url);
    let any_pool = pool::create_pool(&config).await.expect("failed to open sqlite test db");
    let db = Db::new(any_pool, &config);
    fleet_db::run_migrations(&db, &pool::default_migrations_path(Dialect::Sqlite))
        .await
        .expect("sqlite migrations should succeed");
    (db, tmp)
}

struct SharedPg {
    base_url: String,
    _container: Option<ContainerAsync<Postgres>>,
}

static SHARED_PG: OnceCell<SharedPg> = OnceCell::const_new();

async fn init_shared_pg() -> SharedPg {
    if let Ok(url) = std::env::var("FLEET_TEST_PG_URL") {
        return SharedPg {
            base_url: url,
            _container: None,
        };
    }

    let container = Postgres::default()
        .with_tag("18")
        .start()
        .await
        .expect("failed to start PostgreSQL container");
    let host = container.get_host().await.expect("failed to get container host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("failed to get mapped port");

    SharedPg {
        base_url: format!("postgresql://postgres:postgres@{host}:{port}"),
        _container: Some(container),
    }
}

async fn pg_url() -> &'static str {
    let shared = SHARED_PG.get_or_init(init_shared_pg).await;
    &shared.base_url
}

/// Create a uniquely-named Postgres database inside the shared container,
/// migrated and wrapped in a `Db`. Call [`drop_postgres_test_db`] with the
/// returned name once the test is done.
pub async fn create_postgres_test_db() -> (Db, String) {
    let base_url = pg_url().await;

    let maint_url = format!("{base_url}/postgres");
    let maint_pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
        .expect("failed to connect to maintenance database");

    let db_name = format!("fleet_test_{}", Uuid::new_v4().simple());
    maint_pool
        .execute(format!("CREATE DATABASE {db_name}").as_str())
        .await
        .unwrap_or_else(|e| panic!("failed to create temp database {db_name}: {e}"));
    maint_pool.close().await;

    let config = DbConfig::new(Dialect::Postgres, format!("{base_url}/{db_name}"));
    let any_pool = pool::create_pool(&config).await.expect("failed to connect to temp postgres db");
    let db = Db::new(any_pool, &config);
    fleet_db::run_migrations(&db, &pool::default_migrations_path(Dialect::Postgres))
        .await
        .expect("postgres migrations should succeed");

    (db, db_name)
}

/// Drop a database created by [`create_postgres_test_db`]. Safe to call
/// even if it was already dropped.
pub async fn drop_postgres_test_db(db_name: &str) {
    let base_url = pg_url().await;
    let maint_url = format!("{base_url}/postgres");
    let maint_pool = match PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&maint_url)
        .await
    {
        Ok(pool) => pool,
        Err(_) => return,
    };

    let terminate = format!(
        "SELECT pg_terminate_backend(pid) FROM pg_stat_activity WHERE datname = '{db_name}' AND pid <> pg_backend_pid()"
    );
    let _ = maint_pool.execute(terminate.as_str()).await;
    let _ = maint_pool.execute(format!("DROP DATABASE IF EXISTS {db_name}").as_str()).await;
    maint_pool.close().await;
}
