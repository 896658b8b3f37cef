//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The fallback key itself never appears in the TOML; the config only names
//! the environment variable it is read from.

use key_pool::{DEFAULT_FALLBACK_ENV, ResetCheck};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Environment variable overriding `store.path`.
pub const STORE_PATH_ENV: &str = "KEY_STORE_PATH";

/// Environment variable overriding `store.url`.
pub const STORE_URL_ENV: &str = "KEY_STORE_URL";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    pub server: ServerConfig,
}

/// Credential store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    File,
    Memory,
    Sqlite,
}

/// Credential store settings
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Key file location, required for the file backend
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Database URL, required for the sqlite backend
    /// (e.g. `sqlite:///var/lib/search-key-broker/keys.db?mode=rwc`)
    #[serde(default)]
    pub url: Option<String>,
}

/// Pool behaviour settings
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Environment variable holding the fallback key
    #[serde(default = "default_fallback_env")]
    pub fallback_env: String,
    /// "startup", "every_acquire" or "interval"
    #[serde(default = "default_reset_check")]
    pub reset_check: String,
    #[serde(default = "default_reset_check_interval")]
    pub reset_check_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fallback_env: default_fallback_env(),
            reset_check: default_reset_check(),
            reset_check_interval_secs: default_reset_check_interval(),
        }
    }
}

impl PoolConfig {
    /// Parsed reset check mode. Validated by `Config::load`.
    pub fn reset_check(&self) -> key_pool::Result<ResetCheck> {
        ResetCheck::from_parts(&self.reset_check, self.reset_check_interval_secs)
    }
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_fallback_env() -> String {
    DEFAULT_FALLBACK_ENV.to_string()
}

fn default_reset_check() -> String {
    "startup".to_string()
}

fn default_reset_check_interval() -> u64 {
    3600
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_max_connections() -> usize {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(store_path) = std::env::var(STORE_PATH_ENV) {
            let store_path = store_path.trim();
            if !store_path.is_empty() {
                config.store.path = Some(PathBuf::from(store_path));
            }
        }
        if let Ok(store_url) = std::env::var(STORE_URL_ENV) {
            let store_url = store_url.trim();
            if !store_url.is_empty() {
                config.store.url = Some(store_url.to_string());
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.store.backend == StoreBackend::File && self.store.path.is_none() {
            return Err(common::Error::Config(format!(
                "store.path (or {STORE_PATH_ENV}) is required for the file backend"
            )));
        }
        if self.store.backend == StoreBackend::Sqlite {
            match self.store.url.as_deref() {
                None => {
                    return Err(common::Error::Config(format!(
                        "store.url (or {STORE_URL_ENV}) is required for the sqlite backend"
                    )));
                }
                Some(url) if !url.starts_with("sqlite:") => {
                    return Err(common::Error::Config(
                        "store.url must be a sqlite: URL for the sqlite backend".into(),
                    ));
                }
                Some(_) => {}
            }
        }

        if self.pool.fallback_env.trim().is_empty() {
            return Err(common::Error::Config(
                "pool.fallback_env must not be empty".into(),
            ));
        }

        self.pool
            .reset_check()
            .map_err(|e| common::Error::Config(e.to_string()))?;

        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.server.listen_addr == self.server.admin_addr {
            return Err(common::Error::Config(format!(
                "listen_addr and admin_addr must differ, both are {}",
                self.server.listen_addr
            )));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("search-key-broker.toml")
    }
}
