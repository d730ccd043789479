//! Resolution engine for the nginx mail auth protocol.
//!
//! nginx's mail proxy delegates authentication to an HTTP service: for
//! each client it sends the credentials and/or SMTP envelope it saw and
//! expects back either an upstream server to route the client to, or an
//! error with a retry hint. This crate turns such a request into a
//! verdict: it picks login or relay mode, normalizes envelope addresses,
//! runs the configured lookup statements against a [BackingStore] and
//! translates the outcome into an [AuthResult].
//!
//! Transport, configuration files and the concrete database live in the
//! daemon; the engine only sees the [BackingStore] and [MetricsSink]
//! traits.

pub mod address;
pub mod engine;
mod error;
pub mod lookup;
pub mod metrics;
pub mod mode;
pub mod queries;
mod request;
pub mod secret;
pub mod verdict;

pub use engine::{AuthEngine, EngineConfig, Resolution};
pub use error::AuthError;
pub use lookup::{BackingStore, LookupOutcome, QueryParameters, UpstreamRecord};
pub use metrics::MetricsSink;
pub use mode::{Mode, RelayPolicy};
pub use queries::QuerySet;
pub use request::AuthRequest;
pub use secret::Redactor;
pub use verdict::AuthResult;
