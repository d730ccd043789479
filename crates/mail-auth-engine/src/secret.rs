use std::fmt;

const REDACTED: &str = "<redacted>";

/// Decides whether credentials may appear in logs.
/// Passwords are hidden unless the operator explicitly opted in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Redactor {
    pub show_secrets: bool,
}

impl Redactor {
    pub fn new(show_secrets: bool) -> Self {
        Self { show_secrets }
    }

    pub fn wrap<'a>(&self, value: &'a str) -> Secret<'a> {
        Secret {
            value,
            show: self.show_secrets,
        }
    }
}

/// A credential on its way into a log record.
/// An empty value stays empty so that "not provided" is still visible.
#[derive(Clone, Copy)]
pub struct Secret<'a> {
    value: &'a str,
    show: bool,
}

impl fmt::Display for Secret<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.show || self.value.is_empty() {
            f.write_str(self.value)
        } else {
            f.write_str(REDACTED)
        }
    }
}

impl fmt::Debug for Secret<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}
