use crate::http_server::HttpListenerParams;
use anyhow::Context;
use arc_swap::ArcSwap;
use mail_auth_engine::{AuthEngine, EngineConfig, QuerySet, Redactor, RelayPolicy};
use serde::{Deserialize, Deserializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(default)]
    pub http: HttpListenerParams,
    pub database: DatabaseParams,
    #[serde(default)]
    pub auth: AuthParams,

    /// Older JSON configs put the listen address at the top level.
    /// When present it replaces `http.listen`.
    #[serde(default)]
    listen: Option<String>,
    /// Older JSON configs name a log file; diagnostics are controlled by
    /// `--diag-log-dir` instead, so this is only reported.
    #[serde(default)]
    logfile: Option<PathBuf>,
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DatabaseParams {
    /// Path to the sqlite database, or `:memory:`
    #[serde(alias = "uri")]
    pub path: String,

    /// Only sqlite is supported; accepted so that older configs still load
    #[serde(default)]
    pub driver: Option<String>,

    /// Milliseconds to wait on a locked database
    #[serde(default = "DatabaseParams::default_busy_timeout")]
    pub busy_timeout: usize,

    #[serde(default)]
    pub auth_lookup_queries: Vec<String>,
    #[serde(default)]
    pub relay_lookup_queries: Vec<String>,
}

impl DatabaseParams {
    fn default_busy_timeout() -> usize {
        500
    }
}

#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AuthParams {
    #[serde(default)]
    pub relay_policy: RelayPolicy,

    /// Upper bound on resolving a single request, eg: "10s"
    #[serde(
        default = "AuthParams::default_lookup_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub lookup_timeout: Duration,

    /// Log passwords in clear text
    #[serde(default)]
    pub show_secrets: bool,
}

impl AuthParams {
    fn default_lookup_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

impl Default for AuthParams {
    fn default() -> Self {
        Self {
            relay_policy: RelayPolicy::default(),
            lookup_timeout: Self::default_lookup_timeout(),
            show_secrets: false,
        }
    }
}

/// Accepts either a number of seconds or a humantime string
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Spec {
        Seconds(u64),
        Human(String),
    }

    match Spec::deserialize(deserializer)? {
        Spec::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Spec::Human(s) => humantime::parse_duration(&s)
            .map_err(|err| serde::de::Error::custom(format!("invalid duration '{s}': {err}"))),
    }
}

/// Settings consulted by the HTTP handler on every request
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSettings {
    pub lookup_timeout: Duration,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading configuration file {}", path.display()))?;
        let is_json = path.extension().map(|ext| ext == "json").unwrap_or(false);
        let config = if is_json {
            Self::from_json(&data)
        } else {
            Self::from_toml(&data)
        }
        .with_context(|| format!("loading configuration file {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml(data: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(data)?;
        config.finish()
    }

    pub fn from_json(data: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.finish()
    }

    fn finish(mut self) -> anyhow::Result<Self> {
        if let Some(listen) = self.listen.take() {
            self.http.listen = listen;
        }
        if let Some(logfile) = self.logfile.take() {
            tracing::warn!(
                logfile = %logfile.display(),
                "ignoring logfile setting; use --diag-log-dir to log to files"
            );
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.http
            .listen
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid http listen address '{}'", self.http.listen))?;
        if let Some(driver) = &self.database.driver {
            anyhow::ensure!(
                matches!(driver.as_str(), "sqlite" | "sqlite3"),
                "database driver '{driver}' is not supported; only sqlite is available"
            );
        }
        anyhow::ensure!(
            !self.database.path.is_empty(),
            "database path must not be empty"
        );
        anyhow::ensure!(
            !self.queries().is_empty(),
            "at least one of auth_lookup_queries or relay_lookup_queries must be set"
        );
        for (kind, list) in [
            ("auth_lookup_queries", &self.database.auth_lookup_queries),
            ("relay_lookup_queries", &self.database.relay_lookup_queries),
        ] {
            if let Some(index) = list.iter().position(|q| q.trim().is_empty()) {
                anyhow::bail!("{kind} entry #{index} is blank");
            }
        }
        anyhow::ensure!(
            !self.auth.lookup_timeout.is_zero(),
            "lookup_timeout must be greater than zero"
        );
        Ok(())
    }

    pub fn queries(&self) -> QuerySet {
        QuerySet::new(
            self.database.auth_lookup_queries.clone(),
            self.database.relay_lookup_queries.clone(),
        )
    }

    /// `log_secrets` comes from the command line and can only widen
    /// what the config file allows.
    pub fn engine_config(&self, log_secrets: bool) -> EngineConfig {
        EngineConfig {
            queries: self.queries(),
            relay_policy: self.auth.relay_policy,
            redactor: Redactor::new(log_secrets || self.auth.show_secrets),
        }
    }

    pub fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings {
            lookup_timeout: self.auth.lookup_timeout,
        }
    }
}

/// Re-reads the configuration file and applies what can change at runtime:
/// lookup statements, relay policy, secret display and the lookup timeout.
/// Changes to the listener or the database require a restart.
pub struct ConfigReloader {
    pub path: PathBuf,
    pub log_secrets: bool,
    pub engine: Arc<AuthEngine>,
    pub settings: Arc<ArcSwap<HandlerSettings>>,
    pub current: DaemonConfig,
}

impl ConfigReloader {
    pub fn reload(&mut self) -> anyhow::Result<()> {
        let config = DaemonConfig::load(&self.path)?;
        self.apply(config);
        Ok(())
    }

    fn apply(&mut self, config: DaemonConfig) {
        if config.http.listen != self.current.http.listen
            || config.http.trusted_hosts != self.current.http.trusted_hosts
        {
            tracing::warn!("http listener changes take effect after a restart");
        }
        if config.database.path != self.current.database.path
            || config.database.busy_timeout != self.current.database.busy_timeout
        {
            tracing::warn!("database connection changes take effect after a restart");
        }

        self.engine.reload(config.engine_config(self.log_secrets));
        self.settings.store(Arc::new(config.handler_settings()));
        tracing::info!(
            auth_lookup_queries = config.database.auth_lookup_queries.len(),
            relay_lookup_queries = config.database.relay_lookup_queries.len(),
            relay_policy = ?config.auth.relay_policy,
            lookup_timeout = ?config.auth.lookup_timeout,
            "configuration reloaded"
        );
        self.current = config;
    }

    /// Reloads whenever the process receives SIGHUP.
    /// A configuration that fails to load leaves the previous one in place.
    #[cfg(unix)]
    pub fn spawn_on_sighup(mut self) -> anyhow::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                tracing::info!(path = %self.path.display(), "SIGHUP received, reloading configuration");
                if let Err(err) = self.reload() {
                    tracing::error!("failed to reload configuration: {err:#}");
                }
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn spawn_on_sighup(self) -> anyhow::Result<()> {
        Ok(())
    }
}
