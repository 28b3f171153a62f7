use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, bail};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_config::{ConfigLoad, ConfigLoader};
use vigil_core::{Daemon, scan::CommandLauncher};
use vigil_server::{AppState, create_app, infra::kb::build_connector};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "vigil-server")]
#[command(about = "Scan orchestration daemon driving engine processes through a shared KB")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env)
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Use the in-process KB store instead of Redis (development only)
    #[arg(long, default_value_t = false)]
    memory_kb: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(host) = cli.host.clone() {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "configuration file in effect");
    }
    for warning in &warnings.items {
        match &warning.hint {
            Some(hint) => warn!(message = %warning.message, hint = %hint, "configuration warning"),
            None => warn!(message = %warning.message, "configuration warning"),
        }
    }

    info!(
        kb.address = %config.daemon.kb.address,
        engine.path = %config.daemon.engine.path,
        runner.max_parallel = config.daemon.runner.max_parallel,
        reaper.retention_secs = config.daemon.reaper.retention_secs,
        "daemon configuration in effect"
    );

    let connector = build_connector(&config.daemon.kb, cli.memory_kb)
        .context("failed to set up KB connector")?;
    let launcher = Arc::new(CommandLauncher::new(&config.daemon.engine));

    let daemon = match Daemon::new(config.daemon.clone(), connector, launcher).await {
        Ok(daemon) => Arc::new(daemon),
        Err(err) => {
            error!(address = %config.daemon.kb.address, "Cannot start scan daemon: {err}");
            return Err(err).context("daemon startup failed");
        }
    };
    let fatal = daemon.fatal_token();
    let reaper = daemon.start_reaper();

    let bind_address = config.server.bind_address();
    let state = AppState::new(Arc::clone(&daemon), Arc::new(config));
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(address = %bind_address, "vigil server listening");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(fatal.clone()))
        .await;

    daemon.shutdown().await;
    if let Err(err) = reaper.await {
        warn!("reaper task ended abnormally: {err}");
    }

    serve_result.context("HTTP server failed")?;

    if fatal.is_cancelled() {
        error!("KB store became unreachable; exiting");
        bail!("KB store unreachable");
    }

    info!("vigil server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, SIGTERM, or when the KB store is lost for good.
async fn shutdown_signal(fatal: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl-C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
        _ = fatal.cancelled() => error!("KB store lost, shutting down"),
    }
}
