//! kioskd - the instance orchestrator daemon.
//!
//! Serves the HTTP API, drives the Docker control plane, and runs the
//! periodic cleanup scan until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use kiosk::api::{AppState, create_router};
use kiosk::cleanup::CleanupTask;
use kiosk::instance::{InstanceService, ServiceConfig};
use kiosk::ports::PortAllocator;
use kiosk::runtime::DockerRuntime;
use kiosk::settings::Settings;

#[derive(Debug, Parser)]
#[command(author, version, about = "Kiosk instance orchestrator daemon.")]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Override the listen address from the config
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(listen) = cli.listen {
        settings.listen_addr = listen;
    }

    let runtime = DockerRuntime::connect(
        settings.instances.log_tail_lines,
        settings.instances.max_log_bytes,
    )
    .context("connecting to the Docker daemon")?;

    let allocator = PortAllocator::new(
        settings.ports.rdp_start,
        settings.ports.rdp_end,
        settings.ports.console_start,
        settings.ports.console_end,
    );

    let service = Arc::new(InstanceService::new(
        Arc::new(runtime),
        allocator,
        ServiceConfig {
            image: settings.docker.image.clone(),
            container_prefix: settings.docker.container_prefix.clone(),
            max_instances: settings.instances.max_instances,
            data_dir: settings.instances.data_dir.clone(),
        },
    ));

    let cleanup = CleanupTask::spawn(
        Arc::clone(&service),
        Duration::from_secs(settings.instances.cleanup_interval_secs),
        chrono::Duration::hours(settings.instances.auto_cleanup_hours as i64),
    );

    let app = create_router(AppState::new(service));
    let listener = TcpListener::bind(settings.listen_addr)
        .await
        .with_context(|| format!("binding {}", settings.listen_addr))?;
    info!(addr = %settings.listen_addr, "kioskd listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    info!("shutting down");
    cleanup.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
