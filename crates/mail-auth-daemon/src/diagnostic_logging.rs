use anyhow::Context;
use clap::ValueEnum;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Overrides the default diagnostic filter when set
pub const FILTER_ENV_VAR: &str = "NGINX_MAIL_AUTH_LOG";

type FilterReloader = Box<dyn Fn(EnvFilter) -> anyhow::Result<()> + Send + Sync>;

/// Installed once by [LoggingConfig::init]. Holds a closure over the
/// subscriber's reload handle, whose concrete type can't be spelled out.
static FILTER_RELOADER: OnceLock<FilterReloader> = OnceLock::new();

pub fn set_diagnostic_log_filter(new_filter: &str) -> anyhow::Result<()> {
    let filter = parse_filter(new_filter)?;
    let reload = FILTER_RELOADER
        .get()
        .ok_or_else(|| anyhow::anyhow!("diagnostic logging has not been initialized"))?;
    reload(filter)
}

fn parse_filter(filter: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(filter).with_context(|| format!("parsing log filter '{filter}'"))
}

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SetDiagnosticFilterRequest {
    /// An EnvFilter directive, eg: `nginx_mail_auth_server=debug`
    pub filter: String,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum DiagnosticFormat {
    Pretty,
    Full,
    Compact,
    Json,
}

pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
    pub verbose: bool,
    pub diag_format: DiagnosticFormat,
}

impl LoggingConfig {
    /// Installs the global subscriber.
    /// When logging to files, the returned guard must outlive all logging.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let (writer, flusher) = make_writer(self.log_dir.as_deref());

        let layer = fmt::layer().with_thread_names(true).with_writer(writer);
        let layer = match self.diag_format {
            DiagnosticFormat::Pretty => layer.pretty().boxed(),
            DiagnosticFormat::Full => layer.boxed(),
            DiagnosticFormat::Compact => layer.compact().boxed(),
            DiagnosticFormat::Json => layer.json().boxed(),
        };

        let initial = match std::env::var(FILTER_ENV_VAR) {
            Ok(filter) => parse_filter(&filter).with_context(|| format!("in ${FILTER_ENV_VAR}"))?,
            Err(_) => parse_filter(default_filter(self.verbose))?,
        };
        let (filter, handle) = tracing_subscriber::reload::Layer::new(initial);
        tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
            .context("installing diagnostic log subscriber")?;

        FILTER_RELOADER
            .set(Box::new(move |filter: EnvFilter| {
                handle.reload(filter).context("applying new log filter")
            }))
            .map_err(|_| anyhow::anyhow!("diagnostic logging was already initialized"))?;

        Ok(flusher)
    }
}

/// stderr, or an hourly rolling file written from a background thread
fn make_writer(log_dir: Option<&Path>) -> (BoxMakeWriter, Option<WorkerGuard>) {
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::hourly(dir, "log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(non_blocking), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    }
}

/// The filter used when the environment doesn't supply one
pub fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "nginx_mail_auth_server=debug,mail_auth_engine=debug,tower_http=debug"
    } else {
        "nginx_mail_auth_server=info,mail_auth_engine=info"
    }
}
