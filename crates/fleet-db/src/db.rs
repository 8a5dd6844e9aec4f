//! The dialect-portable persistence handle.
//!
//! `Db` wraps the dual-backend [`AnyPool`] (SQLite or Postgres, selected by
//! [`crate::config::DbConfig`]) and exposes four row operations — `one`,
//! `many`, `exec`, `insert` — plus `run` for parameterless statements and
//! `tx` for transactional scopes. SQL text is always written in the native
//! (SQLite) dialect; when the configured backend is Postgres it is
//! rewritten on the way in via [`crate::dialect::to_secondary_dialect`].
//!
//! A task-local flag tracks whether the current async task is inside a
//! `tx()` scope. Calling a pool-level operation from inside that scope
//! almost always means the caller meant to use the transaction handle
//! instead and forgot to thread it through; depending on
//! [`crate::config::TxGuardMode`] this either fails loudly or just warns.

use std::borrow::Cow;
use std::cell::Cell;
use std::future::Future;

use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Postgres, Sqlite, Transaction};
use thiserror::Error;
use tracing::warn;

use crate::config::{Dialect, DbConfig, TxGuardMode};
use crate::dialect::{self, RewriteError};
use crate::params::Param;
use crate::pool::AnyPool;

tokio::task_local! {
    static IN_TX: Cell<bool>;
}

fn currently_in_tx() -> bool {
    IN_TX.try_with(|flag| flag.get()).unwrap_or(false)
}

/// Errors surfaced by the persistence layer.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("no row found")]
    NotFound,
    #[error("pool-level operation called while a transaction is open on this task")]
    TxGuardViolation,
    #[error("tx() called while a transaction is already open on this task; nested transactions are not supported")]
    NestedTransaction,
    #[error("query could not be rewritten for the configured dialect: {0}")]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

fn map_not_found(e: sqlx::Error) -> DbError {
    match e {
        sqlx::Error::RowNotFound => DbError::NotFound,
        other => DbError::Sql(other),
    }
}

fn rewrite_for(dialect: Dialect, sql: &str) -> Result<Cow<'_, str>, DbError> {
    match dialect {
        Dialect::Sqlite => Ok(Cow::Borrowed(sql)),
        Dialect::Postgres => Ok(Cow::Owned(dialect::to_secondary_dialect(sql)?)),
    }
}

/// A row type usable with either backend. Blanket-satisfied by any type
/// deriving `sqlx::FromRow` (the derive is generic over the row type), so
/// callers never need to write this bound themselves.
pub trait AnyRow:
    for<'r> FromRow<'r, SqliteRow> + for<'r> FromRow<'r, PgRow> + Send + Unpin
{
}
impl<T> AnyRow for T where T: for<'r> FromRow<'r, SqliteRow> + for<'r> FromRow<'r, PgRow> + Send + Unpin
{}

/// Bind a `&[Param]` onto a `sqlx::query`/`sqlx::query_as` builder,
/// producing the concrete `.bind()` call for each variant. Expands at each
/// call site so it works for both `Query` and `QueryAs`, and for either
/// backend's argument type, without a shared `Bindable` trait.
macro_rules! bind_all {
    ($query:expr, $params:expr) => {{
        let mut q = $query;
        for p in $params {
            q = match p {
                Param::Text(s) => q.bind(s.clone()),
                Param::Int(i) => q.bind(*i),
                Param::Bool(b) => q.bind(*b),
                Param::Uuid(u) => q.bind(*u),
                Param::Timestamp(t) => q.bind(*t),
                Param::Json(j) => q.bind(j.clone()),
                Param::Null => q.bind(None::<String>),
            };
        }
        q
    }};
}

/// The pool-level persistence handle. Clone is cheap; it just clones the
/// underlying pool handle.
#[derive(Clone)]
pub struct Db {
    pool: AnyPool,
    tx_guard_mode: TxGuardMode,
}

impl Db {
    pub fn new(pool: AnyPool, config: &DbConfig) -> Self {
        Self {
            pool,
            tx_guard_mode: config.tx_guard_mode,
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.pool.dialect()
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Return `Err` if a transaction is open on this task and the
    /// configured guard mode is `Fail`; log a warning and continue if it is
    /// `Warn`; no-op otherwise.
    fn check_guard(&self, op: &str) -> Result<(), DbError> {
        if !currently_in_tx() {
            return Ok(());
        }
        match self.tx_guard_mode {
            TxGuardMode::Fail => Err(DbError::TxGuardViolation),
            TxGuardMode::Warn => {
                warn!(op, "pool-level call made while a transaction is open on this task");
                Ok(())
            }
        }
    }

    /// Fetch exactly one row. Maps `sqlx::Error::RowNotFound` to
    /// [`DbError::NotFound`].
    pub async fn one<T: AnyRow>(&self, sql: &str, params: &[Param]) -> Result<T, DbError> {
        self.check_guard("one")?;
        let sql = rewrite_for(self.dialect(), sql)?;
        match &self.pool {
            AnyPool::Sqlite(pool) => {
                let q = bind_all!(sqlx::query_as::<Sqlite, T>(&sql), params);
                q.fetch_one(pool).await.map_err(map_not_found)
            }
            AnyPool::Postgres(pool) => {
                let q = bind_all!(sqlx::query_as::<Postgres, T>(&sql), params);
                q.fetch_one(pool).await.map_err(map_not_found)
            }
        }
    }

    /// Fetch zero or more rows.
    pub async fn many<T: AnyRow>(&self, sql: &str, params: &[Param]) -> Result<Vec<T>, DbError> {
        self.check_guard("many")?;
        let sql = rewrite_for(self.dialect(), sql)?;
        match &self.pool {
            AnyPool::Sqlite(pool) => {
                let q = bind_all!(sqlx::query_as::<Sqlite, T>(&sql), params);
                Ok(q.fetch_all(pool).await?)
            }
            AnyPool::Postgres(pool) => {
                let q = bind_all!(sqlx::query_as::<Postgres, T>(&sql), params);
                Ok(q.fetch_all(pool).await?)
            }
        }
    }

    /// Execute a statement, returning the number of rows affected.
    pub async fn exec(&self, sql: &str, params: &[Param]) -> Result<u64, DbError> {
        self.check_guard("exec")?;
        let sql = rewrite_for(self.dialect(), sql)?;
        match &self.pool {
            AnyPool::Sqlite(pool) => {
                let q = bind_all!(sqlx::query::<Sqlite>(&sql), params);
                Ok(q.execute(pool).await?.rows_affected())
            }
            AnyPool::Postgres(pool) => {
                let q = bind_all!(sqlx::query::<Postgres>(&sql), params);
                Ok(q.execute(pool).await?.rows_affected())
            }
        }
    }

    /// Execute an insert, returning the number of rows affected. Callers
    /// that use `INSERT OR IGNORE`-style idempotent inserts (rewritten to
    /// `ON CONFLICT DO NOTHING` for Postgres) should treat `0` as "row
    /// already existed", not an error.
    pub async fn insert(&self, sql: &str, params: &[Param]) -> Result<u64, DbError> {
        self.exec(sql, params).await
    }

    /// Execute a parameterless statement, returning the number of rows
    /// affected.
    pub async fn run(&self, sql: &str) -> Result<u64, DbError> {
        self.exec(sql, &[]).await
    }

    /// Open a transaction and run `f` against it. Commits on `Ok`, rolls
    /// back on `Err`. While `f` runs, pool-level calls made from this task
    /// (even through a cloned `Db`) are subject to the transaction guard.
    ///
    /// The closure's error type `E` only needs `From<DbError>` rather than
    /// being `DbError` itself, so callers can use `?` on `tx.one/many/exec`
    /// (which return `DbError`) while the closure as a whole returns a
    /// richer error -- `anyhow::Error` at call boundaries, or a typed
    /// `thiserror` enum like `RouterError` at component seams.
    pub async fn tx<F, Fut, R, E>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut DbTx<'_>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<DbError>,
    {
        if currently_in_tx() {
            return Err(E::from(DbError::NestedTransaction));
        }

        let mut handle = match &self.pool {
            AnyPool::Sqlite(pool) => DbTx::Sqlite(pool.begin().await.map_err(DbError::from)?),
            AnyPool::Postgres(pool) => DbTx::Postgres(pool.begin().await.map_err(DbError::from)?),
        };

        let result = IN_TX.scope(Cell::new(true), f(&mut handle)).await;

        match result {
            Ok(value) => {
                handle.commit().await?;
                Ok(value)
            }
            Err(err) => {
                let _ = handle.rollback().await;
                Err(err)
            }
        }
    }
}

/// A persistence handle scoped to an open transaction, yielded to the
/// closure passed to [`Db::tx`].
pub enum DbTx<'c> {
    Sqlite(Transaction<'c, Sqlite>),
    Postgres(Transaction<'c, Postgres>),
}

impl<'c> DbTx<'c> {
    fn dialect(&self) -> Dialect {
        match self {
            DbTx::Sqlite(_) => Dialect::Sqlite,
            DbTx::Postgres(_) => Dialect::Postgres,
        }
    }

    async fn commit(self) -> Result<(), DbError> {
        match self {
            DbTx::Sqlite(t) => t.commit().await?,
            DbTx::Postgres(t) => t.commit().await?,
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), DbError> {
        match self {
            DbTx::Sqlite(t) => t.rollback().await?,
            DbTx::Postgres(t) => t.rollback().await?,
        }
        Ok(())
    }

    pub async fn one<T: AnyRow>(&mut self, sql: &str, params: &[Param]) -> Result<T, DbError> {
        let sql = rewrite_for(self.dialect(), sql)?;
        match self {
            DbTx::Sqlite(txn) => {
                let q = bind_all!(sqlx::query_as::<Sqlite, T>(&sql), params);
                q.fetch_one(&mut **txn).await.map_err(map_not_found)
            }
            DbTx::Postgres(txn) => {
                let q = bind_all!(sqlx::query_as::<Postgres, T>(&sql), params);
                q.fetch_one(&mut **txn).await.map_err(map_not_found)
            }
        }
    }

    pub async fn many<T: AnyRow>(&mut self, sql: &str, params: &[Param]) -> Result<Vec<T>, DbError> {
        let sql = rewrite_for(self.dialect(), sql)?;
        match self {
            DbTx::Sqlite(txn) => {
                let q = bind_all!(sqlx::query_as::<Sqlite, T>(&sql), params);
                Ok(q.fetch_all(&mut **txn).await?)
            }
            DbTx::Postgres(txn) => {
                let q = bind_all!(sqlx::query_as::<Postgres, T>(&sql), params);
                Ok(q.fetch_all(&mut **txn).await?)
            }
        }
    }

    pub async fn exec(&mut self, sql: &str, params: &[Param]) -> Result<u64, DbError> {
        let sql = rewrite_for(self.dialect(), sql)?;
        match self {
            DbTx::Sqlite(txn) => {
                let q = bind_all!(sqlx::query::<Sqlite>(&sql), params);
                Ok(q.execute(&mut **txn).await?.rows_affected())
            }
            DbTx::Postgres(txn) => {
                let q = bind_all!(sqlx::query::<Postgres>(&sql), params);
                Ok(q.execute(&mut **txn).await?.rows_affected())
            }
        }
    }

    pub async fn insert(&mut self, sql: &str, params: &[Param]) -> Result<u64, DbError> {
        self.exec(sql, params).await
    }

    pub async fn run(&mut self, sql: &str) -> Result<u64, DbError> {
        self.exec(sql, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dialect, DbConfig};
    use crate::{params, pool};

    async fn test_db() -> (Db, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", tmp.path().join("test.db").display());
        let config = DbConfig::new(Dialect::Sqlite, url);
        let any_pool = pool::create_pool(&config).await.unwrap();
        let db = Db::new(any_pool, &config);
        crate::migrate::run_migrations(&db, &pool::default_migrations_path(Dialect::Sqlite))
            .await
            .unwrap();
        (db, tmp)
    }

    #[derive(Debug, sqlx::FromRow)]
    struct Count {
        n: i64,
    }

    #[tokio::test]
    async fn tx_commits_on_ok() {
        let (db, _tmp) = test_db().await;
        db.tx(|tx| async move {
            tx.exec(
                "INSERT INTO agents (id, name, status, capabilities, created_at) \
                 VALUES (?, ?, 'active', '[]', datetime('now'))",
                &params!(uuid::Uuid::new_v4(), "agent-1"),
            )
            .await?;
            Ok(())
        })
        .await
        .unwrap();

        let count: Count = db.one("SELECT COUNT(*) AS n FROM agents", &[]).await.unwrap();
        assert_eq!(count.n, 1);
    }

    #[tokio::test]
    async fn tx_rolls_back_on_err() {
        let (db, _tmp) = test_db().await;
        let result: Result<(), DbError> = db
            .tx(|tx| async move {
                tx.exec(
                    "INSERT INTO agents (id, name, status, capabilities, created_at) \
                     VALUES (?, ?, 'idle', '[]', datetime('now'))",
                    &params!(uuid::Uuid::new_v4(), "agent-2"),
                )
                .await?;
                Err(DbError::NotFound)
            })
            .await;
        assert!(result.is_err());

        let count: Count = db.one("SELECT COUNT(*) AS n FROM agents", &[]).await.unwrap();
        assert_eq!(count.n, 0);
    }

    #[tokio::test]
    async fn pool_call_inside_tx_fails_in_fail_mode() {
        let (db, _tmp) = test_db().await;
        let outer = db.clone();
        let result: Result<(), DbError> = db
            .tx(|_tx| async move {
                let guard_result: Result<Count, DbError> =
                    outer.one("SELECT 1 AS n FROM agents", &[]).await;
                match guard_result {
                    Err(DbError::TxGuardViolation) => Ok(()),
                    other => panic!("expected TxGuardViolation, got {other:?}"),
                }
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn nested_tx_is_rejected() {
        let (db, _tmp) = test_db().await;
        let inner = db.clone();
        let result: Result<(), DbError> = db
            .tx(|_tx| async move {
                inner
                    .tx(|_inner_tx| async move { Ok::<(), DbError>(()) })
                    .await
            })
            .await;
        assert!(matches!(result, Err(DbError::NestedTransaction)));
    }

    #[tokio::test]
    async fn one_maps_no_rows_to_not_found() {
        let (db, _tmp) = test_db().await;
        let result: Result<Count, DbError> = db
            .one(
                "SELECT 1 AS n FROM agents WHERE id = ?",
                &params!(uuid::Uuid::new_v4()),
            )
            .await;
        assert!(matches!(result, Err(DbError::NotFound)));
    }
}
