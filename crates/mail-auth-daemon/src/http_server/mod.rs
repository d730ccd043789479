use crate::config::HandlerSettings;
use crate::diagnostic_logging::{set_diagnostic_log_filter, SetDiagnosticFilterRequest};
use crate::metrics::PrometheusMetrics;
use anyhow::Context;
use arc_swap::ArcSwap;
use axum::extract::{ConnectInfo, Json, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::Handle;
use cidr::IpCidr;
use mail_auth_engine::AuthEngine;
use prometheus::Registry;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub mod auth_v1;

pub const APPLICATION_DESCRIPTION: &str = "Nginx Mail Auth HTTP Server";

#[derive(Deserialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct HttpListenerParams {
    #[serde(default = "HttpListenerParams::default_listen")]
    pub listen: String,

    /// Peers allowed to talk to us; normally just the mail proxy
    #[serde(default = "HttpListenerParams::default_trusted_hosts")]
    pub trusted_hosts: Vec<IpCidr>,
}

impl Default for HttpListenerParams {
    fn default() -> Self {
        Self {
            listen: Self::default_listen(),
            trusted_hosts: Self::default_trusted_hosts(),
        }
    }
}

impl HttpListenerParams {
    fn default_listen() -> String {
        "127.0.0.1:8000".to_string()
    }

    fn default_trusted_hosts() -> Vec<IpCidr> {
        vec![
            IpCidr::new_host(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            IpCidr::new_host(IpAddr::V6(Ipv6Addr::LOCALHOST)),
        ]
    }

    pub fn is_trusted(&self, addr: IpAddr) -> bool {
        self.trusted_hosts.iter().any(|cidr| cidr.contains(&addr))
    }

    /// Serves until `handle` is told to shut down
    pub async fn serve(self, state: AppState, handle: Handle) -> anyhow::Result<()> {
        let app = make_router(state);

        let socket = TcpListener::bind(&self.listen)
            .with_context(|| format!("listen on {}", self.listen))?;
        socket.set_nonblocking(true)?;
        let addr = socket.local_addr()?;

        tracing::info!("http listener on {addr:?}");
        axum_server::from_tcp(socket)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .with_context(|| format!("serving http on {addr:?}"))
    }
}

#[derive(Clone)]
pub struct AppState {
    listener: Arc<HttpListenerParams>,
    engine: Arc<AuthEngine>,
    metrics: Arc<PrometheusMetrics>,
    registry: Registry,
    settings: Arc<ArcSwap<HandlerSettings>>,
}

impl AppState {
    pub fn new(
        params: &HttpListenerParams,
        engine: Arc<AuthEngine>,
        metrics: Arc<PrometheusMetrics>,
        registry: Registry,
        settings: Arc<ArcSwap<HandlerSettings>>,
    ) -> Self {
        Self {
            listener: Arc::new(params.clone()),
            engine,
            metrics,
            registry,
            settings,
        }
    }

    pub fn is_trusted_host(&self, addr: IpAddr) -> bool {
        self.listener.is_trusted(addr)
    }
}

pub fn make_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/auth", get(auth_v1::auth_v1).post(auth_v1::auth_v1))
        .route("/metrics", get(report_metrics))
        .route(
            "/api/admin/set_diagnostic_log_filter/v1",
            post(set_diagnostic_log_filter_v1),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            trusted_host_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Turns away peers that are not in the trusted host list
async fn trusted_host_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);

    match remote_addr {
        Some(addr) if state.is_trusted_host(addr.ip()) => next.run(request).await,
        Some(addr) => {
            tracing::warn!(peer = %addr, "rejecting request from untrusted host");
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
        None => (StatusCode::FORBIDDEN, "Unknown peer").into_response(),
    }
}

#[derive(Debug)]
pub struct AppError(anyhow::Error);

// Tell axum how to convert `AppError` into a response.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!("{:#}", self.0);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error: {:#}", self.0),
        )
            .into_response()
    }
}

// This enables using `?` on functions that return `Result<_, anyhow::Error>` to turn them into
// `Result<_, AppError>`. That way you don't need to do that manually.
impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

async fn index() -> String {
    format!(
        "{APPLICATION_DESCRIPTION} v{}\n",
        env!("CARGO_PKG_VERSION")
    )
}

async fn report_metrics(State(state): State<AppState>) -> Result<String, AppError> {
    let report = prometheus::TextEncoder::new().encode_to_string(&state.registry.gather())?;
    Ok(report)
}

/// Changes the diagnostic log filter dynamically
async fn set_diagnostic_log_filter_v1(
    // Note: Json<> must be last in the param list
    Json(request): Json<SetDiagnosticFilterRequest>,
) -> Result<(), AppError> {
    set_diagnostic_log_filter(&request.filter)?;
    tracing::info!(filter = %request.filter, "diagnostic log filter changed");
    Ok(())
}
