use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{PgPool, SqlitePool};

use crate::config::{Dialect, DbConfig};

/// The backend connection pool, selected at startup by [`DbConfig::dialect`].
#[derive(Debug, Clone)]
pub enum AnyPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl AnyPool {
    pub fn dialect(&self) -> Dialect {
        match self {
            AnyPool::Sqlite(_) => Dialect::Sqlite,
            AnyPool::Postgres(_) => Dialect::Postgres,
        }
    }

    pub async fn close(&self) {
        match self {
            AnyPool::Sqlite(pool) => pool.close().await,
            AnyPool::Postgres(pool) => pool.close().await,
        }
    }
}

/// Create a connection pool for the configured dialect.
///
/// SQLite is a single-writer database: the pool is pinned to exactly one
/// connection regardless of `config.max_connections` so writers serialize
/// through sqlx's pool queue rather than racing `SQLITE_BUSY`. Postgres
/// uses the configured bounds directly.
pub async fn create_pool(config: &DbConfig) -> Result<AnyPool> {
    match config.dialect {
        Dialect::Sqlite => {
            let opts = SqliteConnectOptions::from_str(&config.database_url)
                .with_context(|| format!("invalid sqlite url {}", config.database_url))?
                .create_if_missing(true)
                .foreign_keys(true);
            let pool = SqlitePoolOptions::new()
                .min_connections(1)
                .max_connections(1)
                .acquire_timeout(config.acquire_timeout)
                .connect_with(opts)
                .await
                .with_context(|| {
                    format!("failed to connect to database at {}", config.database_url)
                })?;
            Ok(AnyPool::Sqlite(pool))
        }
        Dialect::Postgres => {
            let pool = PgPoolOptions::new()
                .min_connections(config.min_connections)
                .max_connections(config.max_connections)
                .acquire_timeout(config.acquire_timeout)
                .connect(&config.database_url)
                .await
                .with_context(|| {
                    format!("failed to connect to database at {}", config.database_url)
                })?;
            Ok(AnyPool::Postgres(pool))
        }
    }
}

/// Return the default migrations directory for a dialect, shipped inside
/// the `fleet-db` crate's source tree.
///
/// Resolves relative to the crate's source tree via the compile-time
/// `CARGO_MANIFEST_DIR` env. For installed binaries (no source tree on
/// disk) the migrations would need to be embedded at compile time instead;
/// that embedding step is left as a follow-up (see DESIGN.md).
pub fn default_migrations_path(dialect: Dialect) -> PathBuf {
    let sub = match dialect {
        Dialect::Sqlite => "sqlite",
        Dialect::Postgres => "postgres",
    };
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations")).join(sub)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_path_selects_dialect_subdirectory() {
        let sqlite_path = default_migrations_path(Dialect::Sqlite);
        assert!(sqlite_path.ends_with("migrations/sqlite"));
        let pg_path = default_migrations_path(Dialect::Postgres);
        assert!(pg_path.ends_with("migrations/postgres"));
    }

    #[tokio::test]
    async fn create_pool_connects_to_temp_sqlite_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let db_path = tmp.path().join("test.db");
        let url = format!("sqlite://{}", db_path.display());
        let config = DbConfig::new(Dialect::Sqlite, url);

        let pool = create_pool(&config).await.unwrap();
        let db = crate::Db::new(pool, &config);
        crate::migrate::run_migrations(&db, &default_migrations_path(Dialect::Sqlite))
            .await
            .unwrap();
    }
}
