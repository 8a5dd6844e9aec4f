//! Configuration file management for fleet.
//!
//! [`fleet_db::config::DbConfig::from_env`] already owns the storage-layer
//! knobs (`DB_DRIVER`, `DATABASE_URL`, pool bounds, `TX_GUARD_MODE`); this
//! module resolves the app-level settings it doesn't cover -- the sweeper's
//! tuning and the upload storage root -- following the same chain:
//! CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fleet_db::config::DbConfig;
use fleet_dispatch::SweeperConfig;

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub dispatch: DispatchSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchSection {
    pub sweeper_interval_secs: u64,
    pub sweeper_batch_size: i64,
    pub upload_root: String,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            sweeper_interval_secs: 5,
            sweeper_batch_size: 50,
            upload_root: "data/uploads".to_string(),
        }
    }
}

/// Return the fleet config directory: `$XDG_CONFIG_HOME/fleet` or
/// `~/.config/fleet`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("fleet");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config").join("fleet")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents).context("failed to parse config file")
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix -- the file carries a connection
/// string, which may embed credentials.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents).with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct FleetConfig {
    pub db_config: DbConfig,
    pub sweeper_config: SweeperConfig,
    pub upload_root: PathBuf,
}

impl FleetConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default. The database half delegates entirely to
    /// [`DbConfig::from_env`], which a `--database-url` flag overrides.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file_config = load_config().ok();

        let mut db_config = DbConfig::from_env()?;
        if let Some(url) = cli_db_url {
            db_config.database_url = url.to_string();
        } else if db_config.database_url == DbConfig::DEFAULT_URL {
            if let Some(cfg) = &file_config {
                db_config.database_url = cfg.database.url.clone();
            }
        }

        let dispatch = file_config.map(|c| c.dispatch).unwrap_or_default();
        let sweeper_interval_secs = env_u64("FLEET_SWEEPER_INTERVAL_SECS").unwrap_or(dispatch.sweeper_interval_secs);
        let sweeper_batch_size = env_i64("FLEET_SWEEPER_BATCH_SIZE").unwrap_or(dispatch.sweeper_batch_size);
        let upload_root = std::env::var("FLEET_UPLOAD_ROOT").unwrap_or(dispatch.upload_root);

        Ok(Self {
            db_config,
            sweeper_config: SweeperConfig {
                interval: Duration::from_secs(sweeper_interval_secs),
                batch_size: sweeper_batch_size,
            },
            upload_root: PathBuf::from(upload_root),
        })
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(path.ends_with("fleet/config.toml"), "unexpected config path: {}", path.display());
    }

    #[test]
    fn dispatch_section_default_matches_documented_defaults() {
        let d = DispatchSection::default();
        assert_eq!(d.sweeper_interval_secs, 5);
        assert_eq!(d.sweeper_batch_size, 50);
    }
}
