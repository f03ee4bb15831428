use std::sync::Arc;

/// Represents a result type for operations in the flagsync runtime.
///
/// This `Result` type is a standard Rust `Result` type where the error variant is defined by the
/// crate-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the flagsync runtime.
///
/// None of these errors is fatal to flag reads: the in-memory store stays authoritative and
/// [`Client::get_flag`](crate::Client::get_flag) keeps serving the last known values.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL or stream URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The server rejected the environment key.
    #[error("unauthorized, environment key is likely invalid")]
    Unauthorized,

    /// A transport-level failure while talking to the flag service.
    #[error(transparent)]
    Transport(TransportError),

    /// A flag payload could not be decoded. The payload is dropped.
    #[error("malformed flag payload: {0}")]
    MalformedPayload(String),

    /// Failed to serialize or deserialize a cache record.
    #[error(transparent)]
    // serde_json::Error is not clonable, so we're wrapping it in an Arc.
    Serialization(Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Storage keys must be non-empty and consist of ASCII alphanumerics, `-`, or `_`.
    #[error("invalid storage key: {0:?}")]
    InvalidStorageKey(String),

    /// The HTTP client could not be set up.
    #[error("failed to build HTTP client")]
    // reqwest::Error is not clonable, so we're wrapping it in an Arc.
    HttpClient(#[source] Arc<reqwest::Error>),

    /// A background thread panicked. This should normally never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// A bounded wait (e.g., the final cache flush) did not complete in time.
    #[error("timed out waiting for background work to finish")]
    ShutdownTimeout,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::HttpClient(Arc::new(value.without_url()))
    }
}

impl From<TransportError> for Error {
    fn from(value: TransportError) -> Self {
        if value.is_unauthorized() {
            Error::Unauthorized
        } else {
            Error::Transport(value)
        }
    }
}

/// Errors reported by a [`Transport`](crate::transport::Transport) implementation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransportError {
    /// The server responded with a non-successful HTTP status.
    #[error("received non-200 response: {0}")]
    Status(u16),

    /// The streaming endpoint must not be used for the rest of the session. The data source
    /// falls back to polling.
    #[error("streaming endpoint is not available")]
    StreamingUnavailable,

    /// Connection refused, timeout, reset, or any other network-level failure.
    #[error("network error: {0}")]
    Network(String),
}

impl TransportError {
    /// Returns `true` if the request may succeed when retried later.
    ///
    /// Client errors are not retried, except for bad request, request timeout and too many
    /// requests.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TransportError::Status(code) => {
                !(400..500).contains(code) || matches!(code, 400 | 408 | 429)
            }
            TransportError::StreamingUnavailable | TransportError::Network(_) => true,
        }
    }

    /// Returns `true` if the server rejected our credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Status(401 | 403))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(value: reqwest::Error) -> Self {
        match value.status() {
            Some(status) => TransportError::Status(status.as_u16()),
            None => TransportError::Network(value.without_url().to_string()),
        }
    }
}
