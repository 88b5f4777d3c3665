//! Runtime configuration
//!
//! All knobs come from the environment (optionally seeded from a `.env`
//! file). Collected once at startup into a [`Config`] that the rest of the
//! system borrows; nothing reads the environment after that.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

const ENV_DATA_DIR: &str = "DOCKHAND_DATA_DIR";
const ENV_SECRET_KEY: &str = "DOCKHAND_SECRET_KEY";
const ENV_SECRET_KEYS: &str = "DOCKHAND_SECRET_KEYS";
const ENV_POLL_INTERVAL: &str = "DOCKHAND_POLL_INTERVAL";
const ENV_COMPOSE_BIN: &str = "DOCKHAND_COMPOSE_BIN";
const ENV_GIT_TIMEOUT: &str = "DOCKHAND_GIT_TIMEOUT";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_GIT_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root for the database and project checkouts.
    pub data_dir: PathBuf,

    /// Primary vault key material; `None` disables storing credentials.
    pub secret_key: Option<String>,

    /// Decrypt-only keys kept alive across rotation.
    pub secret_keys: Vec<String>,

    /// Watcher tick interval.
    pub poll_interval: Duration,

    /// Container orchestration binary, invoked as `<bin> compose ...`.
    pub compose_bin: String,

    /// Deadline for any single Git network operation.
    pub git_timeout: Duration,
}

impl Config {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let data_dir = match std::env::var(ENV_DATA_DIR) {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_data_dir(),
        };

        let secret_key = std::env::var(ENV_SECRET_KEY).ok().filter(|s| !s.is_empty());

        let secret_keys = std::env::var(ENV_SECRET_KEYS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let poll_interval =
            Duration::from_secs(parse_secs(ENV_POLL_INTERVAL, DEFAULT_POLL_INTERVAL_SECS)?);
        let git_timeout =
            Duration::from_secs(parse_secs(ENV_GIT_TIMEOUT, DEFAULT_GIT_TIMEOUT_SECS)?);

        let compose_bin =
            std::env::var(ENV_COMPOSE_BIN).unwrap_or_else(|_| "docker".to_string());

        Ok(Self {
            data_dir,
            secret_key,
            secret_keys,
            poll_interval,
            compose_bin,
            git_timeout,
        })
    }

    /// Database file location.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("dockhand.db")
    }

    /// Directory a project's Git checkout lives in.
    pub fn project_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("projects").join(name)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            secret_key: None,
            secret_keys: Vec::new(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            compose_bin: "docker".to_string(),
            git_timeout: Duration::from_secs(DEFAULT_GIT_TIMEOUT_SECS),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("HOME")
        .map(|home| PathBuf::from(home).join(".dockhand"))
        .unwrap_or_else(|_| PathBuf::from(".dockhand"))
}

fn parse_secs(var: &str, default: u64) -> Result<u64> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| Error::validation(format!("{var} must be an integer (seconds), got '{raw}'"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.compose_bin, "docker");
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert!(config.secret_key.is_none());
    }

    #[test]
    fn test_project_dir_layout() {
        let config = Config {
            data_dir: PathBuf::from("/srv/dockhand"),
            ..Default::default()
        };
        assert_eq!(
            config.project_dir("api"),
            PathBuf::from("/srv/dockhand/projects/api")
        );
        assert_eq!(config.db_path(), PathBuf::from("/srv/dockhand/dockhand.db"));
    }
}
