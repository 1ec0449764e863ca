pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "copyfs")]
#[command(about = "Mount a remote deduplicating object store as a local filesystem")]
#[command(version)]
pub struct Args {
    /// Path to the config file (defaults to ~/.copyfs/config.toml)
    #[arg(long = "config", global = true)]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
