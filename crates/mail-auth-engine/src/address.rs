//! Envelope address normalization.
//!
//! nginx passes the envelope as it saw it on the wire: either a bare
//! `<local@domain>` or the whole SMTP command, eg:
//! `MAIL FROM:<alice+bounce123@example.com> SIZE=1024`.
//! We pick out the first angle-bracketed `local(+tag)@domain` and drop
//! the VERP tag, because the backing store only knows the plain mailbox.
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// `<local(+tag)?@domain>`, searched rather than anchored.
/// `local` cannot contain `+`, so the first `+` always begins the tag.
static ENVELOPE_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<([^<>@+\s]+)(\+[^<>@\s]*)?@([^<>@\s]+)>").expect("valid envelope regex")
});

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("unable to parse MAIL FROM address '{0}'")]
    MalformedSender(String),
    #[error("unable to parse RCPT TO address '{0}'")]
    MalformedRecipient(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedAddress {
    /// `local@domain`, without the VERP tag
    pub canonical: String,
    /// The stripped tag, including its leading `+`
    pub verp_tag: Option<String>,
}

pub fn normalize(raw: &str) -> Option<NormalizedAddress> {
    let captures = ENVELOPE_ADDRESS.captures(raw)?;
    let local = captures.get(1)?.as_str();
    let domain = captures.get(3)?.as_str();
    Some(NormalizedAddress {
        canonical: format!("{local}@{domain}"),
        verp_tag: captures.get(2).map(|tag| tag.as_str().to_string()),
    })
}

/// A null reverse path `<>` is how bounces are sent.
/// Only the first angle-bracketed token counts.
fn is_null_path(raw: &str) -> bool {
    let raw = raw.trim();
    if raw.is_empty() {
        return true;
    }
    raw.find('<')
        .map(|start| raw[start..].starts_with("<>"))
        .unwrap_or(false)
}

/// Normalizes the MAIL FROM value.
/// Bounce senders (blank or `<>`) produce an empty address rather
/// than an error; anything else that doesn't parse is an error.
pub fn normalize_sender(raw: &str) -> Result<String, AddressError> {
    match normalize(raw) {
        Some(addr) => {
            tracing::debug!(
                raw,
                canonical = %addr.canonical,
                verp_tag = ?addr.verp_tag,
                "parsed MAIL FROM address"
            );
            Ok(addr.canonical)
        }
        None if is_null_path(raw) => {
            tracing::debug!(raw, "MAIL FROM is empty (could be an incoming bounce)");
            Ok(String::new())
        }
        None => Err(AddressError::MalformedSender(raw.to_string())),
    }
}

/// Normalizes the RCPT TO value. Relay authorization is keyed on the
/// recipient, so there is no acceptable empty form.
pub fn normalize_recipient(raw: &str) -> Result<String, AddressError> {
    let addr = normalize(raw).ok_or_else(|| AddressError::MalformedRecipient(raw.to_string()))?;
    tracing::debug!(
        raw,
        canonical = %addr.canonical,
        verp_tag = ?addr.verp_tag,
        "parsed RCPT TO address"
    );
    Ok(addr.canonical)
}
