use crate::address::{normalize_recipient, normalize_sender};
use crate::error::AuthError;
use crate::lookup::{execute, BackingStore, LookupOutcome, QueryParameters};
use crate::metrics::{MetricsSink, INTERNAL_ERRORS};
use crate::mode::{select_mode, Mode, RelayPolicy};
use crate::queries::QuerySet;
use crate::request::AuthRequest;
use crate::secret::Redactor;
use crate::verdict::{translate, AuthResult};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// The reloadable part of the engine's configuration.
/// Reload replaces the whole snapshot; requests already in flight keep
/// using the one they started with.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub queries: QuerySet,
    pub relay_policy: RelayPolicy,
    pub redactor: Redactor,
}

impl EngineConfig {
    pub fn select_mode(&self, request: &AuthRequest) -> Mode {
        select_mode(
            self.relay_policy,
            &request.user,
            &request.pass,
            &request.rcpt_to,
        )
    }
}

/// The verdict for a request, plus the underlying error if one occurred.
/// The error has already been counted and logged; it is only here so
/// that the caller can inspect it.
#[derive(Debug)]
pub struct Resolution {
    pub mode: Mode,
    pub result: AuthResult,
    pub error: Option<AuthError>,
}

pub struct AuthEngine {
    config: ArcSwap<EngineConfig>,
    store: Arc<dyn BackingStore>,
    metrics: Arc<dyn MetricsSink>,
}

impl AuthEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn BackingStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            store,
            metrics,
        }
    }

    pub fn config(&self) -> Arc<EngineConfig> {
        self.config.load_full()
    }

    pub fn reload(&self, config: EngineConfig) {
        self.config.store(Arc::new(config));
    }

    /// The mode `authenticate` would pick for `request` under the current
    /// configuration
    pub fn select_mode(&self, request: &AuthRequest) -> Mode {
        self.config.load().select_mode(request)
    }

    pub async fn authenticate(&self, request: &AuthRequest) -> Resolution {
        let config = self.config();
        let redactor = config.redactor;

        tracing::info!(
            user = %request.user,
            pass = %redactor.wrap(&request.pass),
            protocol = %request.protocol,
            mail_from = %request.mail_from,
            rcpt_to = %request.rcpt_to,
            client_ip = %request.client_ip,
            "processing authentication request"
        );

        let mode = config.select_mode(request);
        self.metrics.increment(mode.counter_name(), 1);

        let outcome = self.resolve(mode, request, &config).await;

        match &outcome {
            Ok(LookupOutcome::Found { record, index }) => {
                tracing::info!(
                    ?mode,
                    user = %request.user,
                    rcpt_to = %request.rcpt_to,
                    upstream_address = %record.address,
                    upstream_port = record.port,
                    query_index = index,
                    "found upstream"
                );
            }
            Ok(LookupOutcome::NotFound) => {
                tracing::info!(
                    ?mode,
                    user = %request.user,
                    pass = %redactor.wrap(&request.pass),
                    mail_from = %request.mail_from,
                    rcpt_to = %request.rcpt_to,
                    "no results after lookup"
                );
            }
            Err(err) => {
                self.metrics.increment(INTERNAL_ERRORS, 1);
                tracing::error!(
                    ?mode,
                    user = %request.user,
                    pass = %redactor.wrap(&request.pass),
                    mail_from = %request.mail_from,
                    rcpt_to = %request.rcpt_to,
                    error = err as &(dyn std::error::Error + 'static),
                    "can't authenticate"
                );
            }
        }

        let result = translate(mode, &outcome);
        Resolution {
            mode,
            result,
            error: outcome.err(),
        }
    }

    async fn resolve(
        &self,
        mode: Mode,
        request: &AuthRequest,
        config: &EngineConfig,
    ) -> Result<LookupOutcome, AuthError> {
        let mut params = QueryParameters {
            user: request.user.clone(),
            pass: request.pass.clone(),
            client_ip: request.client_ip.clone(),
            ..QueryParameters::default()
        };

        match mode {
            Mode::Indeterminate => return Err(AuthError::ModeIndeterminate),
            Mode::Relay => {
                tracing::debug!("authenticating by relay access");
                params.mail_from = normalize_sender(&request.mail_from)?;
                params.rcpt_to = normalize_recipient(&request.rcpt_to)?;
            }
            Mode::Login => {
                tracing::debug!("authenticating by credentials");
            }
        }

        tracing::debug!(?params, "lookup query parameters prepared");
        execute(&*self.store, config.queries.resolve(mode), &params).await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::lookup::test::{Canned, SpyStore};
    use crate::metrics::test::CountingSink;
    use crate::metrics::*;
    use crate::verdict::*;
    use serde_json::json;

    const LOGIN: &str = "SELECT address, port FROM users WHERE user = :User AND pass = :Pass";
    const LOGIN_FALLBACK: &str = "SELECT address, port FROM legacy_users WHERE user = :User";
    const RELAY: &str = "SELECT address, port FROM relays WHERE rcpt = :RcptTo";

    fn make_engine(store: SpyStore) -> (AuthEngine, Arc<SpyStore>, Arc<CountingSink>) {
        let store = Arc::new(store);
        let metrics = Arc::new(CountingSink::default());
        let engine = AuthEngine::new(
            EngineConfig {
                queries: QuerySet::new(
                    vec![LOGIN.to_string(), LOGIN_FALLBACK.to_string()],
                    vec![RELAY.to_string()],
                ),
                ..EngineConfig::default()
            },
            store.clone(),
            metrics.clone(),
        );
        (engine, store, metrics)
    }

    fn relay_request(mail_from: &str, rcpt_to: &str) -> AuthRequest {
        AuthRequest {
            protocol: "smtp".to_string(),
            mail_from: mail_from.to_string(),
            rcpt_to: rcpt_to.to_string(),
            client_ip: "192.0.2.10".to_string(),
            ..AuthRequest::default()
        }
    }

    fn login_request(user: &str, pass: &str) -> AuthRequest {
        AuthRequest {
            user: user.to_string(),
            pass: pass.to_string(),
            protocol: "imap".to_string(),
            client_ip: "192.0.2.10".to_string(),
            ..AuthRequest::default()
        }
    }

    #[tokio::test]
    async fn login_finds_upstream() {
        let (engine, store, metrics) = make_engine(
            SpyStore::default().with(LOGIN, Canned::Row(json!({"address": "10.0.0.5", "port": 25}))),
        );

        let resolution = engine.authenticate(&login_request("alice", "secret")).await;

        k9::assert_equal!(resolution.mode, Mode::Login);
        assert!(resolution.error.is_none());
        k9::assert_equal!(
            resolution.result,
            AuthResult::upstream(Mode::Login, "10.0.0.5".to_string(), 25)
        );
        assert!(resolution.result.error_code.is_none());

        // short circuit: the fallback statement never ran
        k9::assert_equal!(store.call_count(LOGIN), 1);
        k9::assert_equal!(store.call_count(LOGIN_FALLBACK), 0);

        let (_, params) = &store.calls()[0];
        k9::assert_equal!(params.user, "alice");
        k9::assert_equal!(params.pass, "secret");
        k9::assert_equal!(params.rcpt_to, "");
        k9::assert_equal!(params.mail_from, "");
        k9::assert_equal!(params.client_ip, "192.0.2.10");

        k9::assert_equal!(metrics.get(AUTH_REQUESTS_LOGIN), 1);
        k9::assert_equal!(metrics.get(INTERNAL_ERRORS), 0);
    }

    #[tokio::test]
    async fn login_wins_over_relay() {
        let (engine, store, metrics) = make_engine(SpyStore::default());
        let request = AuthRequest {
            rcpt_to: "<bob@example.com>".to_string(),
            ..login_request("alice", "")
        };

        let resolution = engine.authenticate(&request).await;

        k9::assert_equal!(resolution.mode, Mode::Login);
        assert!(resolution.result.via_login);
        assert!(!resolution.result.via_relay);
        // empty password is handed to the statement, not rejected up front
        k9::assert_equal!(store.calls()[0].1.pass, "");
        k9::assert_equal!(metrics.get(AUTH_REQUESTS_LOGIN), 1);
        k9::assert_equal!(metrics.get(AUTH_REQUESTS_RELAY), 0);
    }

    #[tokio::test]
    async fn relay_bounce_sender() {
        let (engine, store, metrics) = make_engine(
            SpyStore::default().with(RELAY, Canned::Row(json!({"address": "10.0.0.7", "port": 25}))),
        );

        let resolution = engine
            .authenticate(&relay_request("<>", "<bob@example.com>"))
            .await;

        k9::assert_equal!(resolution.mode, Mode::Relay);
        assert!(resolution.result.is_ok());
        assert!(resolution.result.via_relay);

        let calls = store.calls();
        k9::assert_equal!(calls.len(), 1);
        let (statement, params) = &calls[0];
        k9::assert_equal!(statement, RELAY);
        k9::assert_equal!(params.mail_from, "");
        k9::assert_equal!(params.rcpt_to, "bob@example.com");
        k9::assert_equal!(metrics.get(AUTH_REQUESTS_RELAY), 1);
    }

    #[tokio::test]
    async fn relay_strips_verp() {
        let (engine, store, _metrics) = make_engine(SpyStore::default());

        let resolution = engine
            .authenticate(&relay_request(
                "<alice+bounce123@example.com>",
                "<bob+tag@example.org>",
            ))
            .await;

        // nothing configured to match: permanent failure, not temporary
        k9::assert_equal!(resolution.result, AuthResult::auth_failed(Mode::Relay));
        let (_, params) = &store.calls()[0];
        k9::assert_equal!(params.mail_from, "alice@example.com");
        k9::assert_equal!(params.rcpt_to, "bob@example.org");
    }

    #[tokio::test]
    async fn malformed_recipient_is_temporary() {
        let (engine, store, metrics) = make_engine(SpyStore::default());

        let resolution = engine
            .authenticate(&relay_request("<alice@example.com>", "<bob>"))
            .await;

        k9::assert_equal!(resolution.result, AuthResult::temporary_failure(Mode::Relay));
        assert!(matches!(
            resolution.error,
            Some(AuthError::AddressNormalization(_))
        ));
        k9::assert_equal!(store.calls().len(), 0);
        k9::assert_equal!(metrics.get(INTERNAL_ERRORS), 1);
    }

    #[tokio::test]
    async fn malformed_sender_is_temporary() {
        let (engine, store, metrics) = make_engine(SpyStore::default());

        let resolution = engine
            .authenticate(&relay_request("garbage", "<bob@example.com>"))
            .await;

        k9::assert_equal!(resolution.result.error_code.as_deref(), Some("451 4.3.0"));
        k9::assert_equal!(store.calls().len(), 0);
        k9::assert_equal!(metrics.get(INTERNAL_ERRORS), 1);
    }

    #[tokio::test]
    async fn indeterminate() {
        let (engine, store, metrics) = make_engine(SpyStore::default());

        let resolution = engine.authenticate(&AuthRequest::default()).await;

        k9::assert_equal!(resolution.mode, Mode::Indeterminate);
        k9::assert_equal!(resolution.result.status, STATUS_TEMPORARY_FAILURE);
        k9::assert_equal!(resolution.result.error_code.as_deref(), Some("451 4.3.0"));
        assert!(matches!(resolution.error, Some(AuthError::ModeIndeterminate)));
        assert!(!resolution.result.via_login && !resolution.result.via_relay);
        k9::assert_equal!(store.calls().len(), 0);
        k9::assert_equal!(metrics.get(AUTH_REQUESTS_INDETERMINATE), 1);
        k9::assert_equal!(metrics.get(INTERNAL_ERRORS), 1);
    }

    #[tokio::test]
    async fn store_error() {
        let store = SpyStore::default().with(RELAY, Canned::Fail("connection refused"));
        let (engine, _store, metrics) = make_engine(store);

        let resolution = engine
            .authenticate(&relay_request("<alice@example.com>", "<bob@example.com>"))
            .await;

        k9::snapshot!(
            &resolution.result,
            r#"
AuthResult {
    status: "Temporary server problem, try again later",
    server: None,
    port: None,
    wait: Some(
        5,
    ),
    error_code: Some(
        "451 4.3.0",
    ),
    via_relay: true,
    via_login: false,
}
"#
        );
        k9::assert_equal!(
            format!("{:#}", anyhow::Error::from(resolution.error.unwrap())),
            "error while executing lookup query #0: connection refused"
        );
        k9::assert_equal!(metrics.get(INTERNAL_ERRORS), 1);
        // one mode counter and one internal error, nothing else
        k9::assert_equal!(metrics.snapshot().values().sum::<u64>(), 2);
    }

    #[tokio::test]
    async fn not_found_is_not_an_internal_error() {
        let (engine, store, metrics) = make_engine(SpyStore::default());

        let resolution = engine.authenticate(&login_request("alice", "wrong")).await;

        k9::assert_equal!(resolution.result.status, STATUS_AUTH_FAILED);
        k9::assert_equal!(resolution.result.error_code.as_deref(), Some("535 5.7.8"));
        assert!(resolution.error.is_none());
        k9::assert_equal!(store.calls().len(), 2);
        k9::assert_equal!(metrics.get(INTERNAL_ERRORS), 0);
    }

    #[tokio::test]
    async fn reload_swaps_queries() {
        let (engine, store, _metrics) = make_engine(
            SpyStore::default().with("SELECT 'new'", Canned::Row(json!({"address": "10.0.0.9", "port": 587}))),
        );

        engine.reload(EngineConfig {
            queries: QuerySet::new(vec!["SELECT 'new'".to_string()], vec![]),
            relay_policy: RelayPolicy::IgnorePassword,
            redactor: Redactor::new(true),
        });
        k9::assert_equal!(engine.config().relay_policy, RelayPolicy::IgnorePassword);

        let resolution = engine.authenticate(&login_request("alice", "secret")).await;
        k9::assert_equal!(resolution.result.port, Some(587));
        k9::assert_equal!(store.call_count(LOGIN), 0);

        // relay list is now empty, so relay requests find nothing
        let resolution = engine
            .authenticate(&AuthRequest {
                pass: "stray".to_string(),
                ..relay_request("<>", "<bob@example.com>")
            })
            .await;
        k9::assert_equal!(resolution.mode, Mode::Relay);
        k9::assert_equal!(resolution.result, AuthResult::auth_failed(Mode::Relay));
    }

    #[tokio::test]
    async fn select_mode_agrees_with_authenticate() {
        let (engine, _store, _metrics) = make_engine(SpyStore::default());
        for request in [
            relay_request("<>", "<bob@example.com>"),
            login_request("alice", "secret"),
            AuthRequest::default(),
        ] {
            let mode = engine.select_mode(&request);
            k9::assert_equal!(engine.authenticate(&request).await.mode, mode);
        }

        engine.reload(EngineConfig {
            relay_policy: RelayPolicy::IgnorePassword,
            ..EngineConfig::default()
        });
        let stray_password = AuthRequest {
            pass: "hunter2".to_string(),
            ..relay_request("<>", "<bob@example.com>")
        };
        k9::assert_equal!(engine.select_mode(&stray_password), Mode::Relay);
    }
}
