use std::fmt;

/// One authentication subrequest, as sent by the mail proxy.
/// An empty string means the attribute was not provided.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthRequest {
    pub user: String,
    pub pass: String,
    pub protocol: String,
    pub mail_from: String,
    pub rcpt_to: String,
    pub client_ip: String,

    // The remaining fields are only ever logged
    pub method: String,
    pub login_attempt: String,
    pub helo: String,
    pub client_host: String,
}

impl fmt::Debug for AuthRequest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("AuthRequest")
            .field("user", &self.user)
            .field("pass", &crate::secret::Redactor::default().wrap(&self.pass))
            .field("protocol", &self.protocol)
            .field("mail_from", &self.mail_from)
            .field("rcpt_to", &self.rcpt_to)
            .field("client_ip", &self.client_ip)
            .field("method", &self.method)
            .field("login_attempt", &self.login_attempt)
            .field("helo", &self.helo)
            .field("client_host", &self.client_host)
            .finish()
    }
}
