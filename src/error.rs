use std::{sync::Arc, time::Duration};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Statsig client core.
///
/// Only [`Error::InvalidArgument`] and [`Error::Uninitialized`] are ever returned from query
/// methods. Everything else describes a failure to *improve* the local state (a failed fetch, a
/// bad delta, a storage failure) and is reported to the
/// [`ErrorReporter`](crate::ErrorReporter) while the previous state stays in place.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The host passed an invalid name, key, or value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A query or update was issued before the client was initialized.
    #[error("uninitialized: {0}")]
    Uninitialized(String),

    /// Server payload is not an object or does not have the expected shape.
    #[error("malformed response: {0}")]
    ResponseFormat(String),

    /// Storage read or write failed.
    #[error("persistence failure: {0}")]
    Persistence(String),

    /// A delta response could not be merged into the stored snapshot.
    #[error("cannot merge delta: {0}")]
    Merge(String),

    /// Invalid api base URL configuration.
    #[error("invalid api configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid SDK key.
    #[error("unauthorized, sdk key is likely invalid")]
    Unauthorized,

    /// Waiting for a fetch exceeded the configured bound. The fetch itself keeps running.
    #[error("fetch did not complete within {0:?}")]
    Timeout(Duration),

    /// The background fetch task panicked. This should normally never happen.
    #[error("fetch task panicked")]
    FetchTaskPanicked,

    /// Network error.
    #[error(transparent)]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    Network(Arc<reqwest::Error>),

    /// Serialization error.
    #[error(transparent)]
    Json(Arc<serde_json::Error>),
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
