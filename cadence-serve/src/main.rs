//! cadence-serve - HTTP trigger surface and publishing workers
//!
//! Serves the tick and manual-action endpoints, runs the worker pool that
//! publishes queued jobs, and sweeps expired credit holds.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use libcadence::config::Config;
use libcadence::content::TemplateGenerator;
use libcadence::logging::{LogFormat, LoggingConfig};
use libcadence::platforms::PlatformRegistry;
use libcadence::{CadenceService, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cadence_serve::runtime::Background;
use cadence_serve::{create_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "cadence-serve")]
#[command(version)]
#[command(about = "HTTP trigger surface and publishing workers for Cadence")]
#[command(long_about = "\
cadence-serve - HTTP trigger surface and publishing workers

DESCRIPTION:
    cadence-serve is the long-running Cadence process. It accepts tick
    triggers from an external scheduler, queues manual actions, and runs
    the worker pool that authorizes credit, publishes and settles each job.

    Expired credit holds are released in the background, so an interrupted
    publish never keeps credits reserved.

ENDPOINTS:
    POST /schedule/tick            Run one decision pass (rate limited)
    POST /actions/run              Queue one action now (rate limited)
    GET  /accounts/:id/credits     Balance and transaction history
    GET  /jobs, /jobs/:id          Inspect jobs
    POST /jobs/:id/cancel          Cancel a pending job
    GET  /health                   Liveness and queue depth

USAGE:
    # Serve on the configured address
    cadence-serve

    # Override the bind address and log as JSON
    cadence-serve --bind 0.0.0.0:8080 --log-format json

SIGNALS:
    SIGTERM, SIGINT - Graceful shutdown (in-flight publishes finish first)

CONFIGURATION:
    Configuration file: ~/.config/cadence/config.toml (or CADENCE_CONFIG)
    Database location:  [database] path (or CADENCE_DB_PATH)

    [server]
    bind = \"127.0.0.1:8080\"

    [queue]
    workers = 4
    max_attempts = 3

    [admission]
    limit = 5         # requests per subject
    window_secs = 60

EXIT CODES:
    0 - Clean shutdown
    1 - Runtime error
    2 - Configuration or database error
")]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides [server] bind)
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Log output format: text, json, pretty
    #[arg(long, value_name = "FORMAT", env = "CADENCE_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    LoggingConfig::new(cli.log_format, "info".to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        error!("cadence-serve failed: {}", e);
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone())?;

    let platforms = PlatformRegistry::dry_run(&config.platforms.enabled);
    info!(platforms = ?platforms.available(), "Platform adapters registered");

    let bind = config.server.bind.clone();
    let service = CadenceService::open(
        config,
        platforms,
        Arc::new(TemplateGenerator::new()),
        shutdown.clone(),
    )
    .await?;

    let background = Background::start(&service, shutdown.clone());
    let app = create_router(AppState::new(service));

    info!(%bind, "cadence-serve listening");
    let listener = tokio::net::TcpListener::bind(&bind).await?;

    let server_token = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_token.cancelled().await })
        .await;

    // Stop the workers even when the server itself failed
    shutdown.cancel();
    background.shutdown().await;

    served?;
    info!("cadence-serve stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM
#[cfg(unix)]
fn setup_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;

    std::thread::spawn(move || {
        if let Some(sig) = signals.forever().next() {
            info!(signal = sig, "Received shutdown signal, stopping gracefully...");
            shutdown.cancel();
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(shutdown: CancellationToken) -> Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping gracefully...");
            shutdown.cancel();
        }
    });
    Ok(())
}
