use clap::Args;
use url::Url;

use copyfs_daemon::config::{Config, ConfigError};

/// Write a config file with default settings
#[derive(Args, Debug, Clone)]
pub struct Init {
    /// Account to store as the default login
    #[arg(long, short)]
    pub username: Option<String>,

    /// Object store api to use instead of the public one
    #[arg(long)]
    pub api_url: Option<Url>,
}

#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Init {
    type Error = InitError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let path = ctx.config_file()?;
        let mut config = Config {
            username: self.username.clone(),
            ..Config::default()
        };
        if let Some(url) = &self.api_url {
            config.api_url = url.clone();
        }

        config.write_new(&path)?;
        Ok(format!("wrote {}", path.display()))
    }
}
