//! rudder daemon - GitOps reconciliation controller
//!
//! The daemon provides:
//! - One reconciliation worker per configured application
//! - HTTP API for push webhooks and status queries
//! - Exclusive ownership of the sync result history

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use librudder_core::{load_config, HistoryStore, TemplateRenderer};
use librudder_git::GitPoller;
use rudder_daemon::{server, ClusterPool, DaemonError, GitSource, Supervisor};
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rudderd", about = "rudder GitOps controller", version)]
struct Cli {
    /// Controller configuration file
    #[arg(long, default_value = "rudder.toml")]
    config: PathBuf,

    /// HTTP listen address (overrides `listen` in the config)
    #[arg(long)]
    listen: Option<String>,

    /// Run one pass per application, print the results as JSON and exit
    #[arg(long)]
    once: bool,

    /// PID file path
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("rudderd starting");

    // Write PID file if specified
    if let Some(ref pid_file) = cli.pid_file {
        let pid = std::process::id();
        if let Err(e) = std::fs::write(pid_file, pid.to_string()) {
            error!("Failed to write PID file: {}", e);
        }
    }

    let code = match run(&cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(code = e.error_code(), "{}", e);
            1
        }
    };

    // Cleanup PID file
    if let Some(ref pid_file) = cli.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    info!("rudderd stopped");
    std::process::exit(code);
}

async fn run(cli: &Cli) -> Result<(), DaemonError> {
    let mut config = load_config(&cli.config)?;
    if let Some(ref listen) = cli.listen {
        config.listen = listen.clone();
    }
    info!(
        config = %cli.config.display(),
        applications = config.applications.len(),
        "Loaded configuration"
    );

    // Held for the lifetime of the process
    let locked = HistoryStore::open_locked(&config.data_dir.join("rudder"))
        .map_err(|e| DaemonError::LockFailed(e.to_string()))?;

    let source = Arc::new(GitSource::new(GitPoller::new(config.cache_dir.clone())));
    let renderer = Arc::new(TemplateRenderer::new());
    let clusters = ClusterPool::from_config(&config)?;
    let listen = config.listen.clone();

    let supervisor = Supervisor::new(config, source, renderer, clusters, locked.store());

    if cli.once {
        let results = supervisor.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    let listener = TcpListener::bind(&listen)
        .await
        .map_err(|e| DaemonError::BindFailed(format!("Failed to bind to {}: {}", listen, e)))?;

    let controller = supervisor.start()?;

    // Set up signal handlers
    let shutdown = setup_signal_handlers();

    let result = server::serve(listener, controller.clone(), shutdown).await;
    info!("Received shutdown signal");
    controller.shutdown().await;
    result
}

/// Set up signal handlers for graceful shutdown
fn setup_signal_handlers() -> impl std::future::Future<Output = ()> {
    async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("Failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate => {}
        }
    }
}
