use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use machine_fc::FirecrackerBackend;
use provision::{
    CommandRunner, NetworkManager, SshKeyImageBuilder, Supervisor, SystemRunner,
};
use tracing::{info, warn};

use crate::cmd::rootfs::{build_rootfs, image_builder};
use crate::config;
use crate::error::ControllerResult;
use crate::http;
use crate::lock;

#[derive(Args)]
pub struct ServeArgs {
    /// Controller config file (YAML).
    #[arg(long)]
    config: PathBuf,
}

pub async fn run_serve(args: ServeArgs) -> ControllerResult<()> {
    let config = config::load(&args.config).await?;

    if !nix::unistd::geteuid().is_root() {
        warn!("not running as root; mount and ip commands will likely fail");
    }

    // -----------------------------------------------------------------------
    // Bootstrap
    // -----------------------------------------------------------------------
    let images = image_builder(&config)?;
    let _lock = lock::try_acquire(config.lock_path()).await?;
    info!(path = %config.lock_path().display(), "controller lock acquired");

    let backend = FirecrackerBackend::new(config.firecracker_config())?;

    let runtime = config.runtime_paths();
    runtime.reset()?;
    tokio::fs::create_dir_all(&config.log_dir).await?;

    build_rootfs(&images, &config.rootfs, false).await?;

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let network = NetworkManager::new(Arc::clone(&runner), config.network_config()).await?;
    let ssh_keys = SshKeyImageBuilder::new(runner, config.cache_paths());

    let supervisor = Arc::new(Supervisor::new(
        config.supervisor_config(),
        Arc::new(backend),
        images,
        ssh_keys,
        Arc::new(network),
    ));

    // -----------------------------------------------------------------------
    // Serve until SIGINT/SIGTERM
    // -----------------------------------------------------------------------
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(addr = %config.listen, "listening");

    let served = axum::serve(listener, http::router(Arc::clone(&supervisor)))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    supervisor.shutdown().await;
    served?;
    info!("controller stopped");
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        () = recv_signal(&mut sigterm) => info!("received SIGTERM, shutting down"),
        () = recv_signal(&mut sigint) => info!("received SIGINT, shutting down"),
    }
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
