use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::remote::{ClientConfig, DEFAULT_API_URL};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use url::Url;

pub const APP_NAME: &str = "copyfs";
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Mount settings, read from `~/.copyfs/config.toml` unless told otherwise.
///
/// Every field has a default so a partial (or missing) file is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the object store api
    #[serde(default = "default_api_url")]
    pub api_url: Url,
    /// Account to log in as; the password never lives in this file
    #[serde(default)]
    pub username: Option<String>,
    /// How long directory listings are trusted
    #[serde(default = "default_listing_ttl_secs")]
    pub listing_ttl_secs: u64,
    /// Concurrent connections to the api
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Open files stay in memory up to this size before spilling to disk
    #[serde(default = "default_spool_threshold_bytes")]
    pub spool_threshold_bytes: usize,
    /// Default log filter, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for a daily rolling log file
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    /// Let other users access the mount
    #[serde(default)]
    pub allow_other: bool,
}

fn default_api_url() -> Url {
    Url::parse(DEFAULT_API_URL).expect("hardcoded URL must parse")
}

fn default_listing_ttl_secs() -> u64 {
    10
}

fn default_pool_size() -> usize {
    8
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_spool_threshold_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            username: None,
            listing_ttl_secs: default_listing_ttl_secs(),
            pool_size: default_pool_size(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            spool_threshold_bytes: default_spool_threshold_bytes(),
            log_level: default_log_level(),
            log_dir: None,
            allow_other: false,
        }
    }
}

impl Config {
    /// The copyfs directory (~/.copyfs)
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(Self::config_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Load the config at `path`, or the default location.
    ///
    /// An explicit path must exist; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (Self::default_path()?, false),
        };

        if !path.exists() {
            if explicit {
                return Err(ConfigError::MissingFile(path));
            }
            tracing::debug!("no config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config to `path`, refusing to overwrite an existing file
    pub fn write_new(&self, path: &Path) -> Result<(), ConfigError> {
        if path.exists() {
            return Err(ConfigError::AlreadyExists(path.to_path_buf()));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        self.log_filter()?;
        Ok(())
    }

    pub fn log_filter(&self) -> Result<LevelFilter, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level `{}`", self.log_level)))
    }

    pub fn listing_ttl(&self) -> Duration {
        Duration::from_secs(self.listing_ttl_secs)
    }

    /// The remote-facing subset of this config
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            api_url: self.api_url.clone(),
            listing_ttl: self.listing_ttl(),
            pool_size: self.pool_size.max(1),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not determine home directory")]
    NoHomeDirectory,
    #[error("config file not found: {0:?}")]
    MissingFile(PathBuf),
    #[error("config file already exists: {0:?}")]
    AlreadyExists(PathBuf),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}
