use crate::error::AuthError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Values that lookup statements may reference by name.
///
/// In login mode `rcpt_to` and `mail_from` are empty; in relay mode they
/// hold the normalized envelope addresses.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryParameters {
    #[serde(rename = "User")]
    pub user: String,
    #[serde(rename = "Pass")]
    pub pass: String,
    #[serde(rename = "RcptTo")]
    pub rcpt_to: String,
    #[serde(rename = "MailFrom")]
    pub mail_from: String,
    #[serde(rename = "ClientIP")]
    pub client_ip: String,
}

impl QueryParameters {
    pub const NAMES: [&'static str; 5] = ["User", "Pass", "RcptTo", "MailFrom", "ClientIP"];

    /// Returns the value bound to a placeholder name
    pub fn get(&self, name: &str) -> Option<&str> {
        match name {
            "User" => Some(&self.user),
            "Pass" => Some(&self.pass),
            "RcptTo" => Some(&self.rcpt_to),
            "MailFrom" => Some(&self.mail_from),
            "ClientIP" => Some(&self.client_ip),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> {
        Self::NAMES
            .into_iter()
            .filter_map(|name| self.get(name).map(|value| (name, value)))
    }
}

// Hand written so that the password never lands in a log by accident
impl fmt::Debug for QueryParameters {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("QueryParameters")
            .field("user", &self.user)
            .field("pass", &crate::secret::Redactor::default().wrap(&self.pass))
            .field("rcpt_to", &self.rcpt_to)
            .field("mail_from", &self.mail_from)
            .field("client_ip", &self.client_ip)
            .finish()
    }
}

/// The mail backend that an authorized client should be routed to
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UpstreamRecord {
    pub address: String,
    pub port: u16,
}

/// Something that can run a named-parameter statement.
///
/// Only the first result row matters, so implementations should stop
/// reading after it. A row is a JSON object keyed by column name.
#[async_trait]
pub trait BackingStore: Send + Sync {
    async fn first_row(
        &self,
        statement: &str,
        params: &QueryParameters,
    ) -> anyhow::Result<Option<Value>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupOutcome {
    Found {
        record: UpstreamRecord,
        /// Which statement produced the record
        index: usize,
    },
    NotFound,
}

/// Runs `statements` in order, stopping at the first one that yields
/// a row. An error from any statement ends the sequence.
pub async fn execute(
    store: &dyn BackingStore,
    statements: &[String],
    params: &QueryParameters,
) -> Result<LookupOutcome, AuthError> {
    for (index, statement) in statements.iter().enumerate() {
        tracing::debug!(index, statement = %statement, "submitting lookup query");

        let row = store
            .first_row(statement, params)
            .await
            .map_err(|source| AuthError::LookupExecution { index, source })?;

        let Some(row) = row else {
            tracing::debug!(index, "lookup query returned no rows");
            continue;
        };

        let record: UpstreamRecord =
            serde_json::from_value(row).map_err(|source| AuthError::RowDecode { index, source })?;

        tracing::debug!(
            index,
            address = %record.address,
            port = record.port,
            "lookup query found upstream"
        );
        return Ok(LookupOutcome::Found { record, index });
    }

    Ok(LookupOutcome::NotFound)
}
