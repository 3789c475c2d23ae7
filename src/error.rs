//! Error types for pipeline sends and client calls.
//!
//! Every failure surfaced by the pipeline is a variant of [`Error`]. The
//! [`ErrorKind`] discriminant lets callers (and the retry policy) branch on the
//! failure class without string parsing.

use crate::headers::Headers;
use http::StatusCode;
use std::fmt;

/// Boxed source error carried by transport and authentication failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for pipeline sends and client calls.
///
/// # Examples
///
/// ```no_run
/// use skypipe::{Client, Error, ErrorKind};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?;
///
/// match client.get::<serde_json::Value>("/endpoint").await {
///     Ok(response) => println!("Success: {:?}", response.data),
///     Err(e) if e.kind() == ErrorKind::Authentication => {
///         eprintln!("Credential rejected, reconfigure: {}", e);
///     }
///     Err(Error::HttpError { status, raw_response, .. }) => {
///         eprintln!("HTTP error {}: {}", status, raw_response);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The operation was aborted because its context was cancelled or its
    /// deadline passed.
    #[error("Operation cancelled")]
    Cancelled,

    /// A connection-level failure (name resolution, TLS, socket read/write).
    ///
    /// These are transient and retried by the retry policy.
    #[error("Transport error ({kind}): {message}")]
    Transport {
        /// The failure class.
        kind: TransportErrorKind,
        /// Human readable description.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The server returned a non-success HTTP status code.
    #[error("HTTP error {status} {reason}: {raw_response}")]
    HttpError {
        /// The HTTP status code
        status: StatusCode,
        /// The reason phrase sent by the server
        reason: String,
        /// The raw response body
        raw_response: String,
        /// The response headers
        headers: Headers,
    },

    /// The credential rejected the request or no token could be obtained.
    ///
    /// Never retried by the retry policy.
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Human readable description.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// A retry was warranted but the request body could not be rewound.
    #[error("Request body cannot be rewound for retry: {0}")]
    RewindFailed(String),

    /// Failed to deserialize the response body into the expected type.
    #[error("Failed to deserialize response (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
        /// The HTTP status code
        status: StatusCode,
    },

    /// Failed to serialize the request body.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// Invalid configuration was provided (bad header, missing base URL,
    /// pipeline without a terminal stage, ...).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Discriminant of an [`Error`], for programmatic branching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`Error::Cancelled`].
    Cancelled,
    /// See [`Error::Transport`].
    Transport,
    /// See [`Error::HttpError`].
    HttpStatus,
    /// See [`Error::Authentication`].
    Authentication,
    /// See [`Error::RewindFailed`].
    RewindFailed,
    /// See [`Error::DeserializationFailed`].
    Deserialization,
    /// See [`Error::SerializationFailed`].
    Serialization,
    /// See [`Error::ConfigurationError`] and [`Error::InvalidUrl`].
    Configuration,
}

/// Connection-level failure classes reported by transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportErrorKind {
    /// DNS resolution failed.
    Resolve,
    /// The TCP connection could not be established or was reset.
    Connect,
    /// TLS handshake or certificate validation failed.
    Tls,
    /// The transport's own timeout fired.
    Timeout,
    /// Writing the request failed.
    Write,
    /// Reading or decoding the response failed.
    Read,
    /// Anything else.
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportErrorKind::Resolve => "resolve",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::Tls => "tls",
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Write => "write",
            TransportErrorKind::Read => "read",
            TransportErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Creates a transport error without an underlying source.
    pub fn transport(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Error::Transport {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an authentication error without an underlying source.
    pub fn authentication(message: impl Into<String>) -> Self {
        Error::Authentication {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Transport { .. } => ErrorKind::Transport,
            Error::HttpError { .. } => ErrorKind::HttpStatus,
            Error::Authentication { .. } => ErrorKind::Authentication,
            Error::RewindFailed(_) => ErrorKind::RewindFailed,
            Error::DeserializationFailed { .. } => ErrorKind::Deserialization,
            Error::SerializationFailed(_) => ErrorKind::Serialization,
            Error::ConfigurationError(_) | Error::InvalidUrl(_) => ErrorKind::Configuration,
        }
    }

    /// Returns `true` if this error is potentially retryable.
    ///
    /// Transport failures and 408/429/5xx HTTP errors are retryable.
    /// Cancellation, authentication and rewind failures never are.
    ///
    /// # Examples
    ///
    /// ```
    /// use skypipe::{Error, Headers};
    /// use http::StatusCode;
    ///
    /// let err = Error::HttpError {
    ///     status: StatusCode::SERVICE_UNAVAILABLE,
    ///     reason: "Service Unavailable".to_string(),
    ///     raw_response: String::new(),
    ///     headers: Headers::new(),
    /// };
    /// assert!(err.is_retryable());
    ///
    /// assert!(!Error::Cancelled.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::HttpError { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Error::Cancelled
            | Error::Authentication { .. }
            | Error::RewindFailed(_)
            | Error::DeserializationFailed { .. }
            | Error::SerializationFailed(_)
            | Error::ConfigurationError(_)
            | Error::InvalidUrl(_) => false,
        }
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::HttpError { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::HttpError { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns the transport failure class if this is a transport error.
    pub fn transport_kind(&self) -> Option<TransportErrorKind> {
        match self {
            Error::Transport { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = classify_reqwest_error(&err);
        Error::Transport {
            kind,
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

/// Maps a `reqwest` failure onto a [`TransportErrorKind`].
///
/// reqwest only exposes coarse predicates, so resolution and TLS failures are
/// told apart from plain connect failures by inspecting the source chain.
fn classify_reqwest_error(err: &reqwest::Error) -> TransportErrorKind {
    if err.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if err.is_connect() {
        let chain = source_chain(err).to_ascii_lowercase();
        if chain.contains("dns") || chain.contains("resolve") {
            return TransportErrorKind::Resolve;
        }
        if chain.contains("tls") || chain.contains("certificate") || chain.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }
    if err.is_body() || err.is_decode() {
        return TransportErrorKind::Read;
    }
    if err.is_request() {
        return TransportErrorKind::Write;
    }
    TransportErrorKind::Other
}

fn source_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(source) = current {
        out.push_str(": ");
        out.push_str(&source.to_string());
        current = source.source();
    }
    out
}

/// A specialized `Result` type for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn http_error(code: u16) -> Error {
        Error::HttpError {
            status: StatusCode::from_u16(code).unwrap(),
            reason: String::new(),
            raw_response: String::new(),
            headers: Headers::new(),
        }
    }

    #[test]
    fn test_kind_discriminants() {
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::transport(TransportErrorKind::Connect, "reset").kind(),
            ErrorKind::Transport
        );
        assert_eq!(http_error(404).kind(), ErrorKind::HttpStatus);
        assert_eq!(
            Error::authentication("nope").kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            Error::RewindFailed("socket".into()).kind(),
            ErrorKind::RewindFailed
        );
        assert_eq!(
            Error::ConfigurationError("x".into()).kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_retryable_statuses() {
        for code in [408, 429, 500, 502, 503, 504] {
            assert!(http_error(code).is_retryable(), "{} should retry", code);
        }
        for code in [400, 401, 403, 404, 409] {
            assert!(!http_error(code).is_retryable(), "{} should not retry", code);
        }
    }

    #[test]
    fn test_non_retryable_kinds() {
        assert!(Error::transport(TransportErrorKind::Tls, "bad cert").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::authentication("denied").is_retryable());
        assert!(!Error::RewindFailed("stream".into()).is_retryable());
    }

    #[test]
    fn test_accessors() {
        let err = Error::HttpError {
            status: StatusCode::NOT_FOUND,
            reason: "Not Found".into(),
            raw_response: "missing".into(),
            headers: Headers::new(),
        };
        assert_eq!(err.status(), Some(StatusCode::NOT_FOUND));
        assert_eq!(err.raw_response(), Some("missing"));
        assert_eq!(err.transport_kind(), None);

        let err = Error::transport(TransportErrorKind::Resolve, "no such host");
        assert_eq!(err.transport_kind(), Some(TransportErrorKind::Resolve));
        assert_eq!(err.to_string(), "Transport error (resolve): no such host");
    }
}
