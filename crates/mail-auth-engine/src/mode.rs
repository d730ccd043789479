use serde::Deserialize;

/// How an incoming subrequest will be authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Credentials were supplied
    Login,
    /// No credentials, but there is a recipient to relay to
    Relay,
    /// Neither; this always fails without touching the backing store
    Indeterminate,
}

impl Mode {
    /// The metrics event that counts requests resolved in this mode
    pub fn counter_name(&self) -> &'static str {
        match self {
            Self::Login => crate::metrics::AUTH_REQUESTS_LOGIN,
            Self::Relay => crate::metrics::AUTH_REQUESTS_RELAY,
            Self::Indeterminate => crate::metrics::AUTH_REQUESTS_INDETERMINATE,
        }
    }
}

/// Which requests are eligible for relay access
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayPolicy {
    /// Relay only when both user and password are absent
    #[default]
    Strict,
    /// Relay whenever the user is absent, ignoring any password
    IgnorePassword,
}

pub fn select_mode(policy: RelayPolicy, user: &str, pass: &str, rcpt_to: &str) -> Mode {
    let no_credentials = match policy {
        RelayPolicy::Strict => user.is_empty() && pass.is_empty(),
        RelayPolicy::IgnorePassword => user.is_empty(),
    };

    if !rcpt_to.is_empty() && no_credentials {
        Mode::Relay
    } else if !user.is_empty() {
        Mode::Login
    } else {
        Mode::Indeterminate
    }
}
