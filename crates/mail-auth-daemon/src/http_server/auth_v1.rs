use crate::http_server::{AppError, AppState};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use mail_auth_engine::metrics::{
    AUTH_REQUESTS, AUTH_REQUESTS_FAILED, AUTH_REQUESTS_FAILED_LOGIN, AUTH_REQUESTS_FAILED_RELAY,
    AUTH_REQUESTS_SUCCESS, AUTH_REQUESTS_SUCCESS_LOGIN, AUTH_REQUESTS_SUCCESS_RELAY,
    INTERNAL_ERRORS,
};
use mail_auth_engine::{AuthRequest, AuthResult, MetricsSink, Mode};
use percent_encoding::percent_decode_str;

const AUTH_METHOD: &str = "auth-method";
const AUTH_USER: &str = "auth-user";
const AUTH_PASS: &str = "auth-pass";
const AUTH_PROTOCOL: &str = "auth-protocol";
const AUTH_LOGIN_ATTEMPT: &str = "auth-login-attempt";
const AUTH_SMTP_HELO: &str = "auth-smtp-helo";
const AUTH_SMTP_FROM: &str = "auth-smtp-from";
const AUTH_SMTP_TO: &str = "auth-smtp-to";
const CLIENT_IP: &str = "client-ip";
const CLIENT_HOST: &str = "client-host";

const AUTH_STATUS: HeaderName = HeaderName::from_static("auth-status");
const AUTH_SERVER: HeaderName = HeaderName::from_static("auth-server");
const AUTH_PORT: HeaderName = HeaderName::from_static("auth-port");
const AUTH_WAIT: HeaderName = HeaderName::from_static("auth-wait");
const AUTH_ERROR_CODE: HeaderName = HeaderName::from_static("auth-error-code");

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .unwrap_or_default()
}

/// nginx url-encodes the credentials it forwards
fn header_decoded(headers: &HeaderMap, name: &str) -> String {
    let raw = header_str(headers, name);
    percent_decode_str(&raw).decode_utf8_lossy().into_owned()
}

pub fn request_from_headers(headers: &HeaderMap) -> AuthRequest {
    AuthRequest {
        user: header_decoded(headers, AUTH_USER),
        pass: header_decoded(headers, AUTH_PASS),
        protocol: header_str(headers, AUTH_PROTOCOL),
        mail_from: header_str(headers, AUTH_SMTP_FROM),
        rcpt_to: header_str(headers, AUTH_SMTP_TO),
        client_ip: header_str(headers, CLIENT_IP),
        method: header_str(headers, AUTH_METHOD),
        login_attempt: header_str(headers, AUTH_LOGIN_ATTEMPT),
        helo: header_str(headers, AUTH_SMTP_HELO),
        client_host: header_str(headers, CLIENT_HOST),
    }
}

pub fn response_headers(result: &AuthResult) -> anyhow::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTH_STATUS, HeaderValue::try_from(result.status.as_str())?);

    if result.is_ok() {
        if let (Some(server), Some(port)) = (&result.server, result.port) {
            headers.insert(AUTH_SERVER, HeaderValue::try_from(server.as_str())?);
            headers.insert(AUTH_PORT, HeaderValue::from(port));
        }
    } else {
        if let Some(wait) = result.wait {
            headers.insert(AUTH_WAIT, HeaderValue::from(wait));
        }
        if let Some(code) = result.error_code.as_deref().filter(|code| !code.is_empty()) {
            headers.insert(AUTH_ERROR_CODE, HeaderValue::try_from(code)?);
        }
    }
    Ok(headers)
}

fn record_outcome(metrics: &dyn MetricsSink, result: &AuthResult) {
    if result.is_ok() {
        metrics.increment(AUTH_REQUESTS_SUCCESS, 1);
        if result.via_login {
            metrics.increment(AUTH_REQUESTS_SUCCESS_LOGIN, 1);
        }
        if result.via_relay {
            metrics.increment(AUTH_REQUESTS_SUCCESS_RELAY, 1);
        }
    } else {
        metrics.increment(AUTH_REQUESTS_FAILED, 1);
        if result.via_login {
            metrics.increment(AUTH_REQUESTS_FAILED_LOGIN, 1);
        }
        if result.via_relay {
            metrics.increment(AUTH_REQUESTS_FAILED_RELAY, 1);
        }
    }
}

/// Answers an nginx `auth_http` subrequest.
/// The verdict is carried in the response headers; the status is always
/// 200 unless the verdict itself cannot be rendered.
pub async fn auth_v1(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, HeaderMap), AppError> {
    state.metrics.increment(AUTH_REQUESTS, 1);

    let request = request_from_headers(&headers);
    let redactor = state.engine.config().redactor;
    tracing::debug!(
        method = %request.method,
        login_attempt = %request.login_attempt,
        helo = %request.helo,
        client_host = %request.client_host,
        "incoming auth request"
    );

    // Decided up front so that a timed out request still fails in its mode
    let mode = state.engine.select_mode(&request);
    let lookup_timeout = state.settings.load().lookup_timeout;
    let result =
        match tokio::time::timeout(lookup_timeout, state.engine.authenticate(&request)).await {
            Ok(resolution) => resolution.result,
            Err(_) => {
                state.metrics.increment(INTERNAL_ERRORS, 1);
                tracing::error!(
                    ?mode,
                    user = %request.user,
                    pass = %redactor.wrap(&request.pass),
                    rcpt_to = %request.rcpt_to,
                    ?lookup_timeout,
                    "authentication did not complete in time"
                );
                AuthResult::temporary_failure(mode)
            }
        };

    record_outcome(state.metrics.as_ref(), &result);
    tracing::info!(
        user = %request.user,
        rcpt_to = %request.rcpt_to,
        client_ip = %request.client_ip,
        status = %result.status,
        via_login = result.via_login,
        via_relay = result.via_relay,
        "auth request completed"
    );

    Ok((StatusCode::OK, response_headers(&result)?))
}
