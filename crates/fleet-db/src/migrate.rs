//! The migration runner.
//!
//! Applies the `.sql` files in a dialect-specific directory in
//! lexicographic order, tracking what has already run in a two-column
//! `schema_migrations` table that this module owns. Each migration runs
//! and gets recorded inside a single transaction, so a crash mid-migration
//! never leaves a half-applied version marked as done.
//!
//! Two error classes get special handling instead of a hard abort:
//!
//! - `ALTER TABLE ADD COLUMN` failing with "duplicate column" means the
//!   column is already there (a previous run got partway through and was
//!   retried, or two processes raced on first boot) -- treated as success.
//! - A unique violation on a migration whose body opts in via the
//!   `-- dedup-check` marker comment means the migration is guarding
//!   against pre-existing duplicate data that must be cleaned up by an
//!   operator; that gets a pointed diagnostic instead of a generic error.
//!
//! Anything else aborts the whole run, naming the offending version.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::config::Dialect;
use crate::db::{Db, DbError};

/// Marker comment a migration's author includes when a `UNIQUE` constraint
/// it adds is meant to catch pre-existing duplicate rows rather than a
/// concurrent-application race. See module docs.
const DEDUP_CHECK_MARKER: &str = "-- dedup-check";

fn create_schema_migrations_sql(dialect: Dialect) -> &'static str {
    match dialect {
        Dialect::Sqlite => {
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
                version TEXT PRIMARY KEY, \
                applied_at TEXT NOT NULL)"
        }
        Dialect::Postgres => {
            "CREATE TABLE IF NOT EXISTS schema_migrations (\
                version TEXT PRIMARY KEY, \
                applied_at TIMESTAMPTZ NOT NULL)"
        }
    }
}

fn is_duplicate_column(e: &dyn sqlx::error::DatabaseError) -> bool {
    if e.code().as_deref() == Some("42701") {
        return true;
    }
    e.message().to_ascii_lowercase().contains("duplicate column")
}

/// Read the lexicographically sorted list of `.sql` migration files in
/// `dir`, paired with their version identifier (filename without the
/// extension).
fn read_migration_files(dir: &Path) -> Result<Vec<(String, String)>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading migrations dir {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let version = path
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("non-utf8 migration filename: {}", path.display()))?
            .to_owned();
        let body = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        entries.push((version, body));
    }
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(entries)
}

/// Apply every unapplied migration in `dir` against `db`, in lexicographic
/// filename order. Idempotent: running it again with nothing new to apply
/// is a no-op.
pub async fn run_migrations(db: &Db, dir: &Path) -> Result<()> {
    db.run(create_schema_migrations_sql(db.dialect()))
        .await
        .context("failed to create schema_migrations bookkeeping table")?;

    let files = read_migration_files(dir)?;

    #[derive(sqlx::FromRow)]
    struct AppliedVersion {
        version: String,
    }
    let applied: Vec<AppliedVersion> = db
        .many("SELECT version FROM schema_migrations", &[])
        .await
        .context("failed to read applied migrations")?;
    let applied: std::collections::HashSet<String> = applied.into_iter().map(|r| r.version).collect();

    for (version, body) in files {
        if applied.contains(&version) {
            continue;
        }
        apply_one(db, &version, &body).await?;
    }

    Ok(())
}

async fn apply_one(db: &Db, version: &str, body: &str) -> Result<()> {
    let is_dedup_check = body.contains(DEDUP_CHECK_MARKER);
    let version_owned = version.to_owned();
    let body_owned = body.to_owned();

    let outcome = db
        .tx(move |tx| {
            let version = version_owned.clone();
            let body = body_owned.clone();
            async move {
                // Run the migration body under a savepoint: on Postgres, a
                // duplicate-column error aborts the enclosing transaction
                // outright, poisoning every statement after it (including
                // the bookkeeping INSERT below) with `25P02 current
                // transaction is aborted`. Rolling back to the savepoint
                // instead of the whole transaction recovers a usable
                // connection while still discarding whatever partial effect
                // the failed ALTER had.
                tx.exec("SAVEPOINT migration_body", &[]).await?;
                match tx.run(&body).await {
                    Ok(_) => {
                        tx.exec("RELEASE SAVEPOINT migration_body", &[]).await?;
                    }
                    Err(DbError::Sql(sqlx::Error::Database(e))) if is_duplicate_column(e.as_ref()) => {
                        warn!(version = %version, "migration re-added an existing column; treating as already applied");
                        tx.exec("ROLLBACK TO SAVEPOINT migration_body", &[]).await?;
                        tx.exec("RELEASE SAVEPOINT migration_body", &[]).await?;
                    }
                    Err(e) => return Err(e),
                }
                tx.exec(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?, datetime('now'))",
                    &crate::params!(version.clone()),
                )
                .await?;
                Ok(())
            }
        })
        .await;

    match outcome {
        Ok(()) => {
            info!(version, "migration applied");
            Ok(())
        }
        Err(DbError::Sql(sqlx::Error::Database(e))) if e.is_unique_violation() && is_dedup_check => {
            bail!(
                "migration {version} failed a duplicate-data check: {}. \
                 This migration assumes no pre-existing duplicate rows; an operator must \
                 deduplicate the affected table before re-running migrations.",
                e.message()
            )
        }
        Err(e) => Err(anyhow::Error::from(e)).context(format!("migration {version} failed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Dialect, DbConfig};
    use crate::pool;
    use std::io::Write;

    async fn sqlite_db() -> (Db, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let url = format!("sqlite://{}", tmp.path().join("test.db").display());
        let config = DbConfig::new(Dialect::Sqlite, url);
        let any_pool = pool::create_pool(&config).await.unwrap();
        (Db::new(any_pool, &config), tmp)
    }

    #[tokio::test]
    async fn applies_real_migrations_and_is_idempotent() {
        let (db, _tmp) = sqlite_db().await;
        let dir = pool::default_migrations_path(Dialect::Sqlite);
        run_migrations(&db, &dir).await.unwrap();
        run_migrations(&db, &dir).await.unwrap();

        #[derive(sqlx::FromRow)]
        struct Count {
            n: i64,
        }
        let count: Count = db
            .one("SELECT COUNT(*) AS n FROM schema_migrations", &[])
            .await
            .unwrap();
        assert_eq!(count.n, 2);
    }

    #[tokio::test]
    async fn duplicate_column_is_treated_as_success() {
        let (db, tmp) = sqlite_db().await;
        let dir = tmp.path().join("migs");
        fs::create_dir(&dir).unwrap();

        let mut f = fs::File::create(dir.join("0001_init.sql")).unwrap();
        write!(f, "CREATE TABLE widgets (id INTEGER PRIMARY KEY, color TEXT)").unwrap();
        drop(f);
        run_migrations(&db, &dir).await.unwrap();

        // Simulate a retried migration that re-adds an existing column.
        let mut f = fs::File::create(dir.join("0002_add_color_again.sql")).unwrap();
        write!(f, "ALTER TABLE widgets ADD COLUMN color TEXT").unwrap();
        drop(f);
        run_migrations(&db, &dir).await.unwrap();

        #[derive(sqlx::FromRow)]
        struct Count {
            n: i64,
        }
        let count: Count = db
            .one(
                "SELECT COUNT(*) AS n FROM schema_migrations WHERE version = '0002_add_color_again'",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(count.n, 1);
    }

    #[tokio::test]
    async fn genuine_error_aborts_and_does_not_record_version() {
        let (db, tmp) = sqlite_db().await;
        let dir = tmp.path().join("migs");
        fs::create_dir(&dir).unwrap();
        let mut f = fs::File::create(dir.join("0001_broken.sql")).unwrap();
        write!(f, "CREATE TBLE not_sql (id INTEGER)").unwrap();
        drop(f);

        let result = run_migrations(&db, &dir).await;
        assert!(result.is_err());

        #[derive(sqlx::FromRow)]
        struct Count {
            n: i64,
        }
        let count: Count = db
            .one("SELECT COUNT(*) AS n FROM schema_migrations", &[])
            .await
            .unwrap();
        assert_eq!(count.n, 0);
    }
}
