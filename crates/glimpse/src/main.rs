//! Glimpse server binary.
//!
//! Boot order: settings, record store, startup recovery, sweepers, then the
//! listener. Shutdown reverses it: readiness goes false, the listener
//! drains, sweepers stop, and the session manager tears down every owned
//! session, process, and workspace.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{LevelFilter, error, info};
use tokio::net::TcpListener;

use glimpse::api::{self, AppState};
use glimpse::config::Settings;
use glimpse::session::{SessionManager, SessionStore};

/// Interval between sweeper passes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Glimpse - ephemeral preview orchestrator for Git repositories."
)]
struct Cli {
    /// Override the config file path
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Host address to bind to (overrides configuration)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (overrides configuration)
    #[arg(short, long)]
    port: Option<u16>,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
    /// Reduce output to only errors
    #[arg(short, long)]
    quiet: bool,
}

fn init_logging(cli: &Cli) {
    let level = if cli.quiet {
        LevelFilter::Error
    } else {
        match cli.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level.as_str()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    settings.validate()?;
    let settings = Arc::new(settings);

    info!(
        "Starting glimpse preview orchestrator (instance: {})",
        settings.instance_id
    );
    if settings.use_subdomain_routing {
        if let Some(domain) = &settings.preview_domain {
            info!("Subdomain routing enabled for *.{}", domain);
        }
    }

    let store = SessionStore::connect(&settings.record_store_url)
        .await
        .context("connecting to session record store")?;
    let sessions = SessionManager::new(settings.clone(), store);

    // Fail orphaned records left behind by dead instances before serving.
    sessions
        .recover_on_startup()
        .await
        .context("running startup recovery")?;
    info!("Session manager initialized");

    let state = AppState::new(settings.clone(), sessions.clone());
    let sweeper = tokio::spawn(sweep_loop(sessions.clone()));

    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!("Listening on {}", addr);

    let app = api::create_app(state.clone());
    state.set_ready(true);
    info!("Service is ready");

    use axum::ServiceExt;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("Shutting down...");
    state.set_ready(false);
    sweeper.abort();

    if let Err(e) = sessions.shutdown().await {
        error!("Error during session manager shutdown: {:?}", e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Periodic cleanup of expired sessions, idle sessions, and old tombstones.
async fn sweep_loop(sessions: SessionManager) {
    info!("Starting cleanup background task");
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so sweeps start one
    // interval after boot.
    interval.tick().await;

    loop {
        interval.tick().await;

        match sessions.cleanup_expired_sessions().await {
            Ok(count) if count > 0 => info!("Expiry sweep stopped {} session(s)", count),
            Ok(_) => {}
            Err(e) => error!("Error in expiry sweep: {:?}", e),
        }

        match sessions.cleanup_idle_sessions().await {
            Ok(count) if count > 0 => info!("Idle sweep stopped {} session(s)", count),
            Ok(_) => {}
            Err(e) => error!("Error in idle sweep: {:?}", e),
        }

        match sessions.purge_deleted_sessions().await {
            Ok(count) if count > 0 => info!("Purged {} old session tombstone(s)", count),
            Ok(_) => {}
            Err(e) => error!("Error purging tombstones: {:?}", e),
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {:?}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {:?}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
