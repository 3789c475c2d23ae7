//! The untyped HTTP response returned up the pipeline.

use crate::body::{self, BodyStream};
use crate::context::Context;
use crate::headers::Headers;
use crate::{Error, Result};
use bytes::Bytes;
use http::StatusCode;

#[derive(Debug)]
enum Body {
    Buffered(Bytes),
    Stream(Box<dyn BodyStream>),
}

/// An HTTP response: status, reason phrase, headers and a body that is either
/// buffered in memory or still attached to the connection.
///
/// Responses are moved up the policy chain, never copied.
#[derive(Debug)]
pub struct RawResponse {
    status: StatusCode,
    reason: String,
    headers: Headers,
    body: Body,
}

impl RawResponse {
    /// Creates a response with an empty buffered body.
    pub fn new(status: StatusCode, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            headers: Headers::new(),
            body: Body::Buffered(Bytes::new()),
        }
    }

    /// Creates a response using the canonical reason phrase for `status`.
    pub fn from_status(status: StatusCode) -> Self {
        Self::new(status, status.canonical_reason().unwrap_or_default())
    }

    /// The status code.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase.
    pub fn reason_phrase(&self) -> &str {
        &self.reason
    }

    /// Returns `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// The response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the response headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// Returns a header value, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The buffered body. Empty while the body is still a stream.
    pub fn body(&self) -> &[u8] {
        match &self.body {
            Body::Buffered(bytes) => bytes,
            Body::Stream(_) => &[],
        }
    }

    /// Returns `true` if the body has been read into memory.
    pub fn is_buffered(&self) -> bool {
        matches!(self.body, Body::Buffered(_))
    }

    /// Replaces the body with buffered bytes.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = Body::Buffered(body.into());
    }

    /// Attaches a live body stream.
    pub fn set_body_stream(&mut self, stream: impl BodyStream + 'static) {
        self.body = Body::Stream(Box::new(stream));
    }

    /// Detaches the body stream for lazy consumption by the caller.
    ///
    /// Returns `None` if the body was already buffered.
    pub fn take_body_stream(&mut self) -> Option<Box<dyn BodyStream>> {
        match std::mem::replace(&mut self.body, Body::Buffered(Bytes::new())) {
            Body::Stream(stream) => Some(stream),
            buffered => {
                self.body = buffered;
                None
            }
        }
    }

    /// Drains an attached stream into memory. No-op if already buffered.
    pub async fn buffer(&mut self, ctx: &Context) -> Result<()> {
        if let Body::Stream(stream) = &mut self.body {
            let bytes = body::read_to_end(stream.as_mut(), ctx).await?;
            self.body = Body::Buffered(bytes);
        }
        Ok(())
    }

    /// Consumes the response, returning the full body.
    pub async fn into_bytes(mut self, ctx: &Context) -> Result<Bytes> {
        self.buffer(ctx).await?;
        match self.body {
            Body::Buffered(bytes) => Ok(bytes),
            Body::Stream(_) => Ok(Bytes::new()),
        }
    }

    /// Turns a non-success response into [`Error::HttpError`], buffering the
    /// body for diagnostics.
    pub async fn error_for_status(mut self, ctx: &Context) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        self.buffer(ctx).await?;
        Err(self.into_http_error())
    }

    pub(crate) fn into_http_error(self) -> Error {
        let raw_response = String::from_utf8_lossy(self.body()).into_owned();
        Error::HttpError {
            status: self.status,
            reason: self.reason,
            raw_response,
            headers: self.headers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::MemoryBodyStream;

    #[tokio::test]
    async fn test_buffer_stream_body() {
        let ctx = Context::new();
        let mut response = RawResponse::from_status(StatusCode::OK);
        response.set_body_stream(MemoryBodyStream::new("streamed"));
        assert!(!response.is_buffered());
        assert!(response.body().is_empty());

        response.buffer(&ctx).await.unwrap();
        assert!(response.is_buffered());
        assert_eq!(response.body(), b"streamed");
    }

    #[test]
    fn test_take_body_stream_keeps_buffered_body() {
        let mut response = RawResponse::from_status(StatusCode::OK);
        response.set_body("kept");
        assert!(response.take_body_stream().is_none());
        assert_eq!(response.body(), b"kept");

        response.set_body_stream(MemoryBodyStream::new("lazy"));
        assert!(response.take_body_stream().is_some());
        assert!(response.body().is_empty());
    }

    #[tokio::test]
    async fn test_error_for_status() {
        let ctx = Context::new();
        let mut response = RawResponse::new(StatusCode::NOT_FOUND, "Not Found");
        response.headers_mut().insert("x-ms-request-id", "abc");
        response.set_body("missing");

        match response.error_for_status(&ctx).await {
            Err(Error::HttpError {
                status,
                reason,
                raw_response,
                headers,
            }) => {
                assert_eq!(status, StatusCode::NOT_FOUND);
                assert_eq!(reason, "Not Found");
                assert_eq!(raw_response, "missing");
                assert_eq!(headers.get("X-MS-REQUEST-ID"), Some("abc"));
            }
            other => panic!("Expected HttpError, got {:?}", other),
        }

        let ok = RawResponse::from_status(StatusCode::NO_CONTENT);
        assert!(ok.error_for_status(&ctx).await.is_ok());
    }
}
