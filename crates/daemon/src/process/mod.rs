pub mod utils;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::{Config, ConfigError};

#[cfg(feature = "fuse")]
pub use mount::{mount, MountRequest};

/// Initialize logging, panic handler, and build info reporting.
/// Returns guards that must be kept alive for the duration of the program.
pub fn init_logging(
    config: &Config,
) -> Result<Vec<tracing_appender::non_blocking::WorkerGuard>, ConfigError> {
    use tracing_subscriber::fmt::format::FmtSpan;

    let level = config.log_filter()?;
    let mut guards = Vec::new();

    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .with_filter(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        );

    if let Some(log_dir) = &config.log_dir {
        if let Err(e) = std::fs::create_dir_all(log_dir) {
            eprintln!(
                "Warning: Failed to create log directory {:?}: {}",
                log_dir, e
            );
        }

        let file_appender = tracing_appender::rolling::daily(log_dir, "copyfs.log");
        let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        guards.push(file_guard);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(
                EnvFilter::builder()
                    .with_default_directive(level.into())
                    .from_env_lossy(),
            );

        tracing_subscriber::registry()
            .with(stdout_layer)
            .with(file_layer)
            .init();
    } else {
        tracing_subscriber::registry().with(stdout_layer).init();
    }

    utils::register_panic_logger();
    utils::report_build_info();

    Ok(guards)
}

#[cfg(feature = "fuse")]
mod mount {
    use std::path::PathBuf;
    use std::sync::Arc;

    use anyhow::Context;
    use common::remote::RemoteClient;
    use fuser::MountOption;
    use tokio::runtime::Handle;

    use super::utils;
    use crate::config::Config;
    use crate::fuse::{CopyFs, FilesystemAdapter};

    /// Who to log in as and where to mount
    #[derive(Clone)]
    pub struct MountRequest {
        pub mountpoint: PathBuf,
        pub username: String,
        pub password: String,
    }

    impl std::fmt::Debug for MountRequest {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MountRequest")
                .field("mountpoint", &self.mountpoint)
                .field("username", &self.username)
                .finish_non_exhaustive()
        }
    }

    fn mount_options(config: &Config) -> Vec<MountOption> {
        let mut options = vec![
            MountOption::FSName("copyfs".to_string()),
            MountOption::Subtype("copyfs".to_string()),
            MountOption::DefaultPermissions,
        ];
        if config.allow_other {
            options.push(MountOption::AllowOther);
        }
        #[cfg(target_os = "macos")]
        {
            options.push(MountOption::CUSTOM("volname=copyfs".to_string()));
            options.push(MountOption::CUSTOM("noappledouble".to_string()));
        }
        options
    }

    /// Log in, mount, and serve until unmounted or signalled.
    ///
    /// Open files are flushed before this returns, whichever way the mount
    /// ends.
    pub async fn mount(config: &Config, request: MountRequest) -> anyhow::Result<()> {
        let client = RemoteClient::connect(
            &config.client_config(),
            &request.username,
            &request.password,
        )
        .await
        .with_context(|| format!("failed to log in to {}", config.api_url))?;

        // Surface a broken account or endpoint before the kernel sees the mount.
        client
            .list_children("/")
            .await
            .context("failed to list the remote root")?;

        let adapter = Arc::new(FilesystemAdapter::new(
            client,
            config.spool_threshold_bytes,
        ));
        let fs = CopyFs::new(Handle::current(), adapter);

        let shutdown = utils::shutdown_signal().context("failed to install signal handlers")?;
        let mut session = fuser::Session::new(fs, &request.mountpoint, &mount_options(config))
            .with_context(|| format!("failed to mount at {:?}", request.mountpoint))?;
        let mut unmounter = session.unmount_callable();
        tracing::info!(
            "mounted {} at {:?}",
            config.api_url,
            request.mountpoint
        );

        // The session loop blocks; dropping the session runs `destroy`, which flushes.
        let mut serving = tokio::task::spawn_blocking(move || session.run());

        let outcome = tokio::select! {
            outcome = &mut serving => outcome,
            _ = shutdown => {
                tracing::info!("unmounting {:?}", request.mountpoint);
                unmounter
                    .unmount()
                    .with_context(|| format!("failed to unmount {:?}", request.mountpoint))?;
                serving.await
            }
        };

        outcome
            .context("filesystem session panicked")?
            .context("filesystem session failed")?;
        tracing::info!("unmounted {:?}", request.mountpoint);
        Ok(())
    }
}
