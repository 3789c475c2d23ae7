//! The outgoing HTTP request threaded through the pipeline.

use crate::body::{BodyStream, MemoryBodyStream};
use crate::headers::{self, Headers};
use crate::Result;
use bytes::Bytes;
use http::Method;
use url::Url;

/// An HTTP request as seen by pipeline policies.
///
/// Policies may add or overwrite headers while the request travels down the
/// chain. Headers are kept in two layers: the base layer, and a per-attempt
/// layer that is active once the retry policy calls [`Request::start_try`].
/// Headers written by policies below the retry policy land in the per-attempt
/// layer and are discarded before the next attempt; headers written above it
/// (telemetry, authentication) persist across attempts.
///
/// # Examples
///
/// ```
/// use skypipe::Request;
/// use http::Method;
///
/// let mut request = Request::new(Method::GET, "https://example.com/items".parse()?);
/// request.set_header("Accept", "application/json")?;
///
/// assert_eq!(request.header("accept"), Some("application/json"));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    url: Url,
    headers: Headers,
    retry_headers: Headers,
    in_retry: bool,
    body: Option<Box<dyn BodyStream>>,
    buffer_response: bool,
}

impl Request {
    /// Creates a request without a body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Headers::new(),
            retry_headers: Headers::new(),
            in_retry: false,
            body: None,
            buffer_response: true,
        }
    }

    /// Creates a request with the given body stream.
    pub fn with_body(method: Method, url: Url, body: impl BodyStream + 'static) -> Self {
        let mut request = Self::new(method, url);
        request.body = Some(Box::new(body));
        request
    }

    /// Creates a request whose body is held in memory.
    pub fn with_bytes(method: Method, url: Url, body: impl Into<Bytes>) -> Self {
        Self::with_body(method, url, MemoryBodyStream::new(body))
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The target URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Mutable access to the target URL.
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Replaces the target URL.
    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    /// Sets a header, replacing any previous value for the same name.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the name or value is not valid HTTP.
    pub fn set_header(&mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<()> {
        let (name, value) = (name.as_ref(), value.as_ref());
        headers::validate(name, value)?;
        if self.in_retry {
            self.retry_headers.insert(name, value);
        } else {
            self.headers.insert(name, value);
        }
        Ok(())
    }

    /// Returns the value of a header, per-attempt layer first.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.retry_headers
            .get(name)
            .or_else(|| self.headers.get(name))
    }

    /// Removes a header from both layers.
    pub fn remove_header(&mut self, name: &str) {
        self.headers.remove(name);
        self.retry_headers.remove(name);
    }

    /// The effective header set: base headers overlaid with per-attempt ones.
    pub fn headers(&self) -> Headers {
        let mut merged = self.headers.clone();
        merged.extend_from(&self.retry_headers);
        merged
    }

    /// Marks the start of a (re)try.
    ///
    /// Clears the headers added during the previous attempt and routes
    /// subsequent [`Request::set_header`] calls to the per-attempt layer.
    pub fn start_try(&mut self) {
        self.in_retry = true;
        self.retry_headers.clear();
    }

    /// Marks the end of the tries started with [`Request::start_try`].
    ///
    /// Subsequent [`Request::set_header`] calls write to the base layer
    /// again, so a request sent a second time picks up fresh headers from
    /// policies above the retry policy. Headers of the last attempt stay
    /// visible until the next [`Request::start_try`].
    pub fn end_try(&mut self) {
        self.in_retry = false;
    }

    /// Mutable access to the body stream, if any.
    pub fn body_mut(&mut self) -> Option<&mut (dyn BodyStream + 'static)> {
        self.body.as_deref_mut()
    }

    /// Returns `true` if the request carries a body.
    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    /// Replaces the body stream.
    pub fn set_body(&mut self, body: impl BodyStream + 'static) {
        self.body = Some(Box::new(body));
    }

    /// Rewinds the body so it can be sent again. A request without a body
    /// always succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::RewindFailed`] for non-rewindable bodies.
    pub fn rewind_body(&mut self) -> Result<()> {
        match self.body.as_mut() {
            Some(body) => body.rewind(),
            None => Ok(()),
        }
    }

    /// Whether the transport policy drains the response body into memory.
    pub fn buffer_response(&self) -> bool {
        self.buffer_response
    }

    /// Set to `false` to receive the response body as a live stream.
    pub fn set_buffer_response(&mut self, buffer: bool) {
        self.buffer_response = buffer;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ReaderBodyStream;
    use crate::Error;

    fn url() -> Url {
        Url::parse("https://example.com/resource").unwrap()
    }

    #[test]
    fn test_header_case_insensitive_and_casing_preserved() {
        let mut request = Request::new(Method::PUT, url());
        request.set_header("Content-Length", "5").unwrap();

        assert_eq!(request.header("content-length"), Some("5"));
        let headers = request.headers();
        assert_eq!(headers.iter().next(), Some(("Content-Length", "5")));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut request = Request::new(Method::GET, url());
        assert!(matches!(
            request.set_header("bad header", "v"),
            Err(Error::ConfigurationError(_))
        ));
        assert!(request.set_header("x-ok", "line\nbreak").is_err());
    }

    #[test]
    fn test_per_attempt_headers_reset_on_start_try() {
        let mut request = Request::new(Method::GET, url());
        request.set_header("Authorization", "Bearer abc").unwrap();

        request.start_try();
        request.set_header("x-ms-client-request-id", "first").unwrap();
        assert_eq!(request.header("x-ms-client-request-id"), Some("first"));

        request.start_try();
        assert_eq!(request.header("x-ms-client-request-id"), None);
        assert_eq!(request.header("authorization"), Some("Bearer abc"));
    }

    #[test]
    fn test_per_attempt_layer_shadows_base() {
        let mut request = Request::new(Method::GET, url());
        request.set_header("x-value", "base").unwrap();
        request.start_try();
        request.set_header("X-Value", "attempt").unwrap();

        assert_eq!(request.header("x-value"), Some("attempt"));
        assert_eq!(request.headers().get("x-value"), Some("attempt"));
    }

    #[test]
    fn test_end_try_routes_writes_to_base_layer() {
        let mut request = Request::new(Method::GET, url());
        request.start_try();
        request.set_header("x-ms-client-request-id", "first").unwrap();
        request.end_try();

        request.set_header("Authorization", "Bearer rotated").unwrap();
        request.start_try();

        assert_eq!(request.header("authorization"), Some("Bearer rotated"));
        assert_eq!(request.header("x-ms-client-request-id"), None);
    }

    #[test]
    fn test_rewind_body() {
        let mut request = Request::new(Method::GET, url());
        assert!(request.rewind_body().is_ok());

        let mut request = Request::with_bytes(Method::POST, url(), "abc");
        assert!(request.rewind_body().is_ok());

        let mut request = Request::with_body(
            Method::POST,
            url(),
            ReaderBodyStream::new(&b"abc"[..], Some(3)),
        );
        assert!(matches!(request.rewind_body(), Err(Error::RewindFailed(_))));
    }
}
