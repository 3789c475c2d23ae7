//! Typed response returned by the [`Client`](crate::Client) JSON helpers.

use crate::headers::Headers;
use http::StatusCode;
use std::time::Duration;

/// A successful, deserialized response plus what is known about the exchange.
///
/// # Examples
///
/// ```no_run
/// use serde::Deserialize;
/// use skypipe::Client;
///
/// #[derive(Deserialize)]
/// struct Secret {
///     name: String,
///     value: String,
/// }
///
/// # async fn example() -> Result<(), skypipe::Error> {
/// let client = Client::builder()
///     .base_url("https://vault.example.net")?
///     .build()?;
///
/// let secret = client.get::<Secret>("/secrets/db-password").await?;
/// println!("{} took {:?} over {} attempt(s)", secret.name, secret.latency, secret.attempts);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Response<T> {
    /// The deserialized body.
    pub data: T,

    /// The body as received, for diagnostics.
    pub raw_body: String,

    /// HTTP status code of the final response.
    pub status: StatusCode,

    /// Response headers.
    pub headers: Headers,

    /// Time from the first try until the final response, backoff included.
    pub latency: Duration,

    /// Number of tries the pipeline made, `1` when no retry was needed.
    pub attempts: usize,
}

impl<T> Response<T> {
    /// Creates a new response.
    pub fn new(
        data: T,
        raw_body: String,
        status: StatusCode,
        headers: Headers,
        latency: Duration,
        attempts: usize,
    ) -> Self {
        Self {
            data,
            raw_body,
            status,
            headers,
            latency,
            attempts,
        }
    }

    /// Maps the data, keeping the response details.
    ///
    /// ```
    /// # use skypipe::{Headers, Response};
    /// # use http::StatusCode;
    /// # use std::time::Duration;
    /// let response = Response::new(
    ///     42,
    ///     "42".to_string(),
    ///     StatusCode::OK,
    ///     Headers::new(),
    ///     Duration::from_millis(100),
    ///     1,
    /// );
    /// assert_eq!(response.map(|n| n.to_string()).data, "42");
    /// ```
    pub fn map<U, F>(self, f: F) -> Response<U>
    where
        F: FnOnce(T) -> U,
    {
        Response {
            data: f(self.data),
            raw_body: self.raw_body,
            status: self.status,
            headers: self.headers,
            latency: self.latency,
            attempts: self.attempts,
        }
    }

    /// Returns `true` if the pipeline retried at least once.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Returns a header value, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

impl<T> AsRef<T> for Response<T> {
    fn as_ref(&self) -> &T {
        &self.data
    }
}

impl<T> std::ops::Deref for Response<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(attempts: usize) -> Response<u32> {
        let mut headers = Headers::new();
        headers.insert("Content-Type", "application/json");
        Response::new(
            7,
            "7".to_string(),
            StatusCode::OK,
            headers,
            Duration::from_millis(5),
            attempts,
        )
    }

    #[test]
    fn test_was_retried() {
        assert!(!response(1).was_retried());
        assert!(response(3).was_retried());
    }

    #[test]
    fn test_header_and_deref() {
        let response = response(1);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(*response + 1, 8);
    }
}
