use std::path::PathBuf;

use clap::Args;
use url::Url;

use copyfs_daemon::config::{Config, ConfigError};
use copyfs_daemon::process::{self, MountRequest};

/// Mount the store and serve it until unmounted or interrupted
#[derive(Args, Clone)]
pub struct Mount {
    /// Empty directory to mount on
    pub mountpoint: PathBuf,

    /// Account to log in as (default from config)
    #[arg(long, short)]
    pub username: Option<String>,

    #[arg(long, short, env = "COPYFS_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Override the api base URL
    #[arg(long)]
    pub api_url: Option<Url>,

    /// Override how long directory listings are cached
    #[arg(long)]
    pub listing_ttl_secs: Option<u64>,

    /// Override the number of concurrent api connections
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Let other users access the mount (needs user_allow_other in /etc/fuse.conf)
    #[arg(long)]
    pub allow_other: bool,

    /// Override the log level
    #[arg(long)]
    pub log_level: Option<String>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("mountpoint", &self.mountpoint)
            .field("username", &self.username)
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no username given and none configured")]
    MissingUsername,

    #[error("mountpoint {0:?} is not a directory")]
    BadMountpoint(PathBuf),

    #[error("mount failed: {0:#}")]
    Failed(anyhow::Error),
}

impl Mount {
    /// Layer command-line overrides on top of the config file
    fn apply_overrides(&self, mut config: Config) -> Result<Config, ConfigError> {
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }
        if let Some(ttl) = self.listing_ttl_secs {
            config.listing_ttl_secs = ttl;
        }
        if let Some(pool_size) = self.pool_size {
            if pool_size == 0 {
                return Err(ConfigError::Invalid("pool size must be at least 1".into()));
            }
            config.pool_size = pool_size;
        }
        if self.allow_other {
            config.allow_other = true;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
            config.log_filter()?;
        }
        if let Some(username) = &self.username {
            config.username = Some(username.clone());
        }
        Ok(config)
    }
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Mount {
    type Error = MountError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = self.apply_overrides(ctx.load_config()?)?;
        let username = config.username.clone().ok_or(MountError::MissingUsername)?;
        if !self.mountpoint.is_dir() {
            return Err(MountError::BadMountpoint(self.mountpoint.clone()));
        }

        let _guards = process::init_logging(&config)?;
        let request = MountRequest {
            mountpoint: self.mountpoint.clone(),
            username,
            password: self.password.clone(),
        };
        process::mount(&config, request)
            .await
            .map_err(MountError::Failed)?;

        Ok(format!("unmounted {}", self.mountpoint.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount_args() -> Mount {
        Mount {
            mountpoint: PathBuf::from("/mnt/copy"),
            username: None,
            password: "secret".into(),
            api_url: None,
            listing_ttl_secs: None,
            pool_size: None,
            allow_other: false,
            log_level: None,
        }
    }

    #[test]
    fn test_flags_override_config() {
        let args = Mount {
            username: Some("bob".into()),
            listing_ttl_secs: Some(3),
            pool_size: Some(2),
            allow_other: true,
            log_level: Some("trace".into()),
            ..mount_args()
        };
        let config = Config {
            username: Some("alice".into()),
            ..Config::default()
        };

        let config = args.apply_overrides(config).unwrap();
        assert_eq!(config.username.as_deref(), Some("bob"));
        assert_eq!(config.listing_ttl_secs, 3);
        assert_eq!(config.pool_size, 2);
        assert!(config.allow_other);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_unset_flags_keep_config() {
        let config = Config {
            username: Some("alice".into()),
            pool_size: 4,
            ..Config::default()
        };
        let resolved = mount_args().apply_overrides(config.clone()).unwrap();
        assert_eq!(resolved, config);
    }

    #[test]
    fn test_debug_hides_password() {
        assert!(!format!("{:?}", mount_args()).contains("secret"));
    }

    #[test]
    fn test_rejects_zero_pool() {
        let args = Mount {
            pool_size: Some(0),
            ..mount_args()
        };
        assert!(args.apply_overrides(Config::default()).is_err());
    }
}
