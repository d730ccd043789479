use crate::config::{ConfigReloader, DaemonConfig};
use crate::database::SqliteStore;
use crate::diagnostic_logging::{DiagnosticFormat, LoggingConfig};
use crate::http_server::AppState;
use crate::metrics::{spawn_metrics_logger, PrometheusMetrics};
use anyhow::Context;
use arc_swap::ArcSwap;
use axum_server::Handle;
use clap::Parser;
use mail_auth_engine::AuthEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod config;
mod database;
mod diagnostic_logging;
mod http_server;
mod metrics;

/// How long in-flight requests get to finish after a shutdown signal
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
const METRICS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Authentication server for the nginx mail proxy.
///
/// Answers `auth_http` subrequests by looking up the upstream mail
/// server for a login or relay attempt in a sqlite database.
#[derive(Debug, Parser)]
#[command(about, version)]
struct Opt {
    /// Configuration file; `.json` files are read as JSON, anything
    /// else as TOML.
    #[arg(long, default_value = "/etc/nginx-mail-auth/config.toml")]
    config: PathBuf,

    /// Log at debug level and periodically log the request counters
    #[arg(long)]
    verbose: bool,

    /// Log passwords in clear text
    #[arg(long)]
    log_secrets: bool,

    /// Directory where diagnostic log files will be placed.
    ///
    /// If omitted, diagnostics will be printed to stderr.
    #[arg(long)]
    diag_log_dir: Option<PathBuf>,

    /// How diagnostic logs render. full, compact and pretty are intended
    /// for human consumption.
    ///
    /// json outputs machine readable records.
    #[arg(long, default_value = "full")]
    diag_format: DiagnosticFormat,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("mail-auth")
        .build()
        .context("building tokio runtime")?
        .block_on(async move { run(opts).await })
}

async fn run(opts: Opt) -> anyhow::Result<()> {
    let _log_flusher = LoggingConfig {
        log_dir: opts.diag_log_dir.clone(),
        verbose: opts.verbose,
        diag_format: opts.diag_format,
    }
    .init()?;

    tracing::info!(
        "{} v{} starting",
        http_server::APPLICATION_DESCRIPTION,
        env!("CARGO_PKG_VERSION")
    );

    let config = DaemonConfig::load(&opts.config)?;

    let store = SqliteStore::open(&config.database.path, config.database.busy_timeout)?;
    store.ping().await?;
    tracing::info!(path = %config.database.path, "lookup database ready");

    let registry = prometheus::default_registry().clone();
    let metrics = Arc::new(PrometheusMetrics::register(&registry)?);
    let engine = Arc::new(AuthEngine::new(
        config.engine_config(opts.log_secrets),
        Arc::new(store),
        metrics.clone(),
    ));
    let settings = Arc::new(ArcSwap::from_pointee(config.handler_settings()));

    if opts.verbose {
        spawn_metrics_logger(metrics.clone(), METRICS_LOG_INTERVAL);
    }

    let state = AppState::new(
        &config.http,
        engine.clone(),
        metrics,
        registry,
        settings.clone(),
    );
    let http = config.http.clone();

    ConfigReloader {
        path: opts.config.clone(),
        log_secrets: opts.log_secrets,
        engine,
        settings,
        current: config,
    }
    .spawn_on_sighup()?;

    let handle = Handle::new();
    tokio::spawn(shutdown_on_signal(handle.clone()));

    http.serve(state, handle).await?;
    tracing::info!("Shutdown completed OK!");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig_term) => {
                tokio::select! {
                    _ = sig_term.recv() => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            Err(err) => {
                tracing::error!("unable to listen for SIGTERM: {err:#}");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Stops accepting connections once asked to, giving requests that
/// are already running a grace period to complete
async fn shutdown_on_signal(handle: Handle) {
    wait_for_signal().await;
    tracing::info!("Shutdown requested, waiting up to {SHUTDOWN_GRACE:?} for in-flight requests");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}
