//! Maps a resolution onto the nginx mail auth response vocabulary.
use crate::error::AuthError;
use crate::lookup::LookupOutcome;
use crate::mode::Mode;

pub const STATUS_OK: &str = "OK";
pub const STATUS_TEMPORARY_FAILURE: &str = "Temporary server problem, try again later";
pub const STATUS_AUTH_FAILED: &str = "Error: authentication failed.";

/// Transient; the mail server should try again later
pub const ERROR_CODE_TEMPORARY: &str = "451 4.3.0";
/// Permanent authentication failure
pub const ERROR_CODE_AUTH_FAILED: &str = "535 5.7.8";

/// How long the client is asked to wait after a failure
pub const FAILURE_WAIT_SECONDS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub status: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub wait: Option<u32>,
    pub error_code: Option<String>,
    pub via_relay: bool,
    pub via_login: bool,
}

impl AuthResult {
    fn for_mode(mode: Mode, status: &str) -> Self {
        Self {
            status: status.to_string(),
            server: None,
            port: None,
            wait: None,
            error_code: None,
            via_relay: mode == Mode::Relay,
            via_login: mode == Mode::Login,
        }
    }

    fn failure(mode: Mode, status: &str, error_code: &str) -> Self {
        Self {
            wait: Some(FAILURE_WAIT_SECONDS),
            error_code: Some(error_code.to_string()),
            ..Self::for_mode(mode, status)
        }
    }

    /// `451 4.3.0`: something went wrong on our side
    pub fn temporary_failure(mode: Mode) -> Self {
        Self::failure(mode, STATUS_TEMPORARY_FAILURE, ERROR_CODE_TEMPORARY)
    }

    /// `535 5.7.8`: the lookup ran and found no match
    pub fn auth_failed(mode: Mode) -> Self {
        Self::failure(mode, STATUS_AUTH_FAILED, ERROR_CODE_AUTH_FAILED)
    }

    pub fn upstream(mode: Mode, address: String, port: u16) -> Self {
        Self {
            server: Some(address),
            port: Some(port),
            ..Self::for_mode(mode, STATUS_OK)
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

pub fn translate(mode: Mode, outcome: &Result<LookupOutcome, AuthError>) -> AuthResult {
    if mode == Mode::Indeterminate {
        return AuthResult::temporary_failure(mode);
    }
    match outcome {
        Err(_) => AuthResult::temporary_failure(mode),
        Ok(LookupOutcome::NotFound) => AuthResult::auth_failed(mode),
        Ok(LookupOutcome::Found { record, .. }) => {
            AuthResult::upstream(mode, record.address.clone(), record.port)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::AddressError;
    use crate::lookup::UpstreamRecord;

    #[test]
    fn found() {
        let outcome = Ok(LookupOutcome::Found {
            record: UpstreamRecord {
                address: "10.0.0.5".to_string(),
                port: 25,
            },
            index: 0,
        });
        k9::snapshot!(
            translate(Mode::Login, &outcome),
            r#"
AuthResult {
    status: "OK",
    server: Some(
        "10.0.0.5",
    ),
    port: Some(
        25,
    ),
    wait: None,
    error_code: None,
    via_relay: false,
    via_login: true,
}
"#
        );
    }

    #[test]
    fn not_found_is_permanent() {
        let result = translate(Mode::Relay, &Ok(LookupOutcome::NotFound));
        k9::snapshot!(
            &result,
            r#"
AuthResult {
    status: "Error: authentication failed.",
    server: None,
    port: None,
    wait: Some(
        5,
    ),
    error_code: Some(
        "535 5.7.8",
    ),
    via_relay: true,
    via_login: false,
}
"#
        );
        assert!(!result.is_ok());
    }

    #[test]
    fn errors_are_temporary() {
        let errors = [
            AuthError::ModeIndeterminate,
            AuthError::AddressNormalization(AddressError::MalformedRecipient("<>".to_string())),
            AuthError::LookupExecution {
                index: 0,
                source: anyhow::anyhow!("connection refused"),
            },
        ];
        for err in errors {
            let result = translate(Mode::Relay, &Err(err));
            k9::assert_equal!(result.status, STATUS_TEMPORARY_FAILURE);
            k9::assert_equal!(result.error_code.as_deref(), Some("451 4.3.0"));
            k9::assert_equal!(result.wait, Some(5));
            assert!(result.server.is_none());
            assert!(result.via_relay);
        }
    }

    #[test]
    fn indeterminate_sets_no_mode_flag() {
        // the lookup outcome is irrelevant once the mode is indeterminate
        let result = translate(Mode::Indeterminate, &Ok(LookupOutcome::NotFound));
        k9::assert_equal!(result, AuthResult::temporary_failure(Mode::Indeterminate));
        assert!(!result.via_relay);
        assert!(!result.via_login);
    }
}
