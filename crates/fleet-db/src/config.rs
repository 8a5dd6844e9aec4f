use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Which SQL engine a [`DbConfig`] targets.
///
/// SQLite is the native dialect: the default, self-hostable backend that
/// needs no external service. Postgres is the secondary dialect, for
/// deployments that need multiple writers against one database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl FromStr for Dialect {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Dialect::Sqlite),
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            other => bail!("unrecognized DB_DRIVER {other:?}; expected \"sqlite\" or \"postgres\""),
        }
    }
}

/// What to do when a call is made against the pool-level handle while a
/// transaction opened through the same [`Db`] is still outstanding on the
/// current task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxGuardMode {
    /// Return a [`crate::db::DbError::TxGuardViolation`] instead of running
    /// the pool-level call.
    Fail,
    /// Log a `warn!` and run the pool-level call anyway.
    Warn,
}

impl FromStr for TxGuardMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fail" => Ok(TxGuardMode::Fail),
            "warn" => Ok(TxGuardMode::Warn),
            other => bail!("unrecognized TX_GUARD_MODE {other:?}; expected \"fail\" or \"warn\""),
        }
    }
}

/// Database configuration.
///
/// Reads from `DB_DRIVER` / `DATABASE_URL` / `TX_GUARD_MODE` environment
/// variables, falling back to a local SQLite file when unset.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub dialect: Dialect,
    pub database_url: String,
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub tx_guard_mode: TxGuardMode,
}

impl DbConfig {
    /// The default connection URL used when no environment variable is set:
    /// a SQLite file under the current directory.
    pub const DEFAULT_URL: &str = "sqlite://fleet.db";

    /// Build a config from the environment.
    ///
    /// Priority for each field is: its own env var, then the compile-time
    /// default. `DB_DRIVER` defaults to `sqlite`; pool bounds only matter
    /// for the Postgres dialect (the SQLite pool is always capped at 1
    /// writer connection regardless of these values, see [`crate::pool`]).
    pub fn from_env() -> Result<Self> {
        let dialect = match env::var("DB_DRIVER") {
            Ok(v) => v.parse()?,
            Err(_) => Dialect::Sqlite,
        };
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| Self::DEFAULT_URL.to_owned());
        let min_connections = env_parse("DB_POOL_MIN", 1)?;
        let max_connections = env_parse("DB_POOL_MAX", 5)?;
        let acquire_timeout_secs = env_parse("DB_ACQUIRE_TIMEOUT_SECS", 10)?;
        let tx_guard_mode = match env::var("TX_GUARD_MODE") {
            Ok(v) => v.parse()?,
            Err(_) => TxGuardMode::Fail,
        };

        Ok(Self {
            dialect,
            database_url,
            min_connections,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            tx_guard_mode,
        })
    }

    /// Build a config from an explicit dialect and URL (useful for tests
    /// and CLI flags). Pool bounds and the guard mode take their defaults.
    pub fn new(dialect: Dialect, database_url: impl Into<String>) -> Self {
        Self {
            dialect,
            database_url: database_url.into(),
            min_connections: 1,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
            tx_guard_mode: TxGuardMode::Fail,
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::new(Dialect::Sqlite, Self::DEFAULT_URL)
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}"))
            .context(format!("parsing {key}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_parses_case_insensitively() {
        assert_eq!("SQLite".parse::<Dialect>().unwrap(), Dialect::Sqlite);
        assert_eq!("postgresql".parse::<Dialect>().unwrap(), Dialect::Postgres);
    }

    #[test]
    fn dialect_rejects_unknown() {
        assert!("mysql".parse::<Dialect>().is_err());
    }

    #[test]
    fn tx_guard_mode_parses() {
        assert_eq!("fail".parse::<TxGuardMode>().unwrap(), TxGuardMode::Fail);
        assert_eq!("warn".parse::<TxGuardMode>().unwrap(), TxGuardMode::Warn);
        assert!("ignore".parse::<TxGuardMode>().is_err());
    }

    #[test]
    fn default_config_targets_local_sqlite_file() {
        let cfg = DbConfig::default();
        assert_eq!(cfg.dialect, Dialect::Sqlite);
        assert_eq!(cfg.database_url, "sqlite://fleet.db");
    }

    #[test]
    fn explicit_new_postgres() {
        let cfg = DbConfig::new(Dialect::Postgres, "postgresql://localhost:5432/fleet");
        assert_eq!(cfg.dialect, Dialect::Postgres);
        assert_eq!(cfg.database_url, "postgresql://localhost:5432/fleet");
    }
}
