use crate::address::AddressError;
use thiserror::Error;

/// Reasons a resolution could not reach a verdict from the backing store.
///
/// All of these are answered with a temporary failure; a lookup that ran
/// cleanly but found nothing is not an error (see `LookupOutcome::NotFound`).
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("can't authenticate via relay nor login")]
    ModeIndeterminate,
    #[error(transparent)]
    AddressNormalization(#[from] AddressError),
    #[error("error while executing lookup query #{index}")]
    LookupExecution {
        index: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("error while decoding the result of lookup query #{index}")]
    RowDecode {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
}
