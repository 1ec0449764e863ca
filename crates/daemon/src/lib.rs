/**
 * Mount settings: the TOML config file and
 *  its command-line overrides.
 */
pub mod config;
/**
 * Filesystem layer: the write-back open file
 *  table, the path-based adapter over the remote
 *  store and its FUSE binding.
 */
pub mod fuse;
/**
 * Process plumbing: logging, signals and the
 *  mount session lifecycle.
 */
pub mod process;

pub use config::{Config, ConfigError};
pub use fuse::{FilesystemAdapter, FsError, OpenFileTable};
