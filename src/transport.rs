//! The terminal pipeline stage and the pluggable transports behind it.
//!
//! [`HttpTransport`] is the seam where bytes hit the network. The default
//! implementation, [`ReqwestTransport`], is built on `reqwest`; tests plug in
//! doubles that return canned responses.

use crate::body::{self, BodyStream};
use crate::context::Context;
use crate::headers::Headers;
use crate::pipeline::{Next, Policy};
use crate::{Error, RawResponse, Request, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Sends a single request over the wire.
///
/// Implementations must observe `ctx`: a cancelled context aborts the
/// in-flight call with [`Error::Cancelled`]. Connection-level failures are
/// reported as [`Error::Transport`]; a transport never fabricates a response.
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    /// Sends `request` and returns the response with its body attached.
    async fn send(&self, request: &mut Request, ctx: &Context) -> Result<RawResponse>;
}

/// The innermost pipeline stage: hands the request to an [`HttpTransport`].
///
/// When [`Request::buffer_response`] is set (the default) the response body
/// is drained into memory before the response travels back up the chain;
/// otherwise the live stream is left for the caller.
#[derive(Debug, Clone)]
pub struct TransportPolicy {
    transport: Arc<dyn HttpTransport>,
}

impl TransportPolicy {
    /// Wraps `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// A transport policy over a default [`ReqwestTransport`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn reqwest() -> Result<Self> {
        Ok(Self::new(Arc::new(ReqwestTransport::new()?)))
    }

    /// The wrapped transport.
    pub fn transport(&self) -> &Arc<dyn HttpTransport> {
        &self.transport
    }
}

#[async_trait]
impl Policy for TransportPolicy {
    async fn send(
        &self,
        request: &mut Request,
        ctx: &Context,
        _next: Next<'_>,
    ) -> Result<RawResponse> {
        ctx.check_cancelled()?;
        let mut response = self.transport.send(request, ctx).await?;
        if request.buffer_response() {
            response.buffer(ctx).await?;
        }
        Ok(response)
    }
}

/// [`HttpTransport`] backed by a pooled `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with default connection settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the TLS backend fails to initialize.
    pub fn new() -> Result<Self> {
        Self::with_connect_timeout(None)
    }

    /// Creates a transport that gives up connecting after `timeout`.
    pub fn with_connect_timeout(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.connect_timeout(timeout);
        }
        let client = builder.build().map_err(|e| {
            Error::ConfigurationError(format!("Failed to build HTTP client: {}", e))
        })?;
        Ok(Self { client })
    }

    /// Uses an existing `reqwest::Client`.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &mut Request, ctx: &Context) -> Result<RawResponse> {
        ctx.check_cancelled()?;

        let headers = request.headers().to_header_map()?;
        let body = match request.body_mut() {
            Some(stream) => Some(body::read_to_end(stream, ctx).await?),
            None => None,
        };

        let mut builder = self
            .client
            .request(request.method().clone(), request.url().clone())
            .headers(headers);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        if let Some(remaining) = ctx.remaining() {
            builder = builder.timeout(remaining);
        }

        tracing::debug!(
            method = %request.method(),
            url = %request.url(),
            "Executing HTTP request"
        );

        let response = tokio::select! {
            result = builder.send() => result.map_err(|e| {
                if ctx.is_cancelled() {
                    Error::Cancelled
                } else {
                    Error::from(e)
                }
            })?,
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };

        let status = response.status();
        let mut raw = RawResponse::from_status(status);
        *raw.headers_mut() = Headers::from_header_map(response.headers());
        raw.set_body_stream(ResponseBodyStream::new(response));
        Ok(raw)
    }
}

/// A response body still attached to the connection. Cannot rewind.
pub struct ResponseBodyStream {
    response: reqwest::Response,
    pending: Bytes,
    length: Option<u64>,
}

impl ResponseBodyStream {
    fn new(response: reqwest::Response) -> Self {
        let length = response.content_length();
        Self {
            response,
            pending: Bytes::new(),
            length,
        }
    }
}

impl fmt::Debug for ResponseBodyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBodyStream")
            .field("status", &self.response.status())
            .field("length", &self.length)
            .finish()
    }
}

#[async_trait]
impl BodyStream for ResponseBodyStream {
    async fn read(&mut self, ctx: &Context, buf: &mut [u8]) -> Result<usize> {
        while self.pending.is_empty() {
            let chunk = tokio::select! {
                chunk = self.response.chunk() => chunk?,
                _ = ctx.cancelled() => return Err(Error::Cancelled),
            };
            match chunk {
                Some(chunk) => self.pending = chunk,
                None => return Ok(0),
            }
        }
        let n = self.pending.len().min(buf.len());
        let head = self.pending.split_to(n);
        buf[..n].copy_from_slice(&head);
        Ok(n)
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn rewind(&mut self) -> Result<()> {
        Err(Error::RewindFailed(
            "response body stream is read from the network".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::MemoryBodyStream;
    use crate::pipeline::Pipeline;
    use http::{Method, StatusCode};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct StreamingTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpTransport for StreamingTransport {
        async fn send(&self, _request: &mut Request, _ctx: &Context) -> Result<RawResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut response = RawResponse::from_status(StatusCode::OK);
            response.set_body_stream(MemoryBodyStream::new("payload"));
            Ok(response)
        }
    }

    fn request() -> Request {
        Request::new(Method::GET, "https://example.com/".parse().unwrap())
    }

    #[tokio::test]
    async fn test_buffers_response_by_default() {
        let pipeline = Pipeline::new(
            Vec::new(),
            TransportPolicy::new(Arc::new(StreamingTransport::default())),
        );
        let response = pipeline.send(&mut request(), &Context::new()).await.unwrap();
        assert!(response.is_buffered());
        assert_eq!(response.body(), b"payload");
    }

    #[tokio::test]
    async fn test_leaves_stream_when_not_buffering() {
        let pipeline = Pipeline::new(
            Vec::new(),
            TransportPolicy::new(Arc::new(StreamingTransport::default())),
        );
        let mut request = request();
        request.set_buffer_response(false);

        let mut response = pipeline.send(&mut request, &Context::new()).await.unwrap();
        assert!(!response.is_buffered());
        let mut stream = response.take_body_stream().unwrap();
        let bytes = body::read_to_end(stream.as_mut(), &Context::new())
            .await
            .unwrap();
        assert_eq!(&bytes[..], b"payload");
    }

    #[tokio::test]
    async fn test_cancelled_context_never_reaches_transport() {
        let transport = Arc::new(StreamingTransport::default());
        let pipeline = Pipeline::new(Vec::new(), TransportPolicy::new(transport.clone()));
        let ctx = Context::new();
        ctx.cancel();

        let result = pipeline.send(&mut request(), &ctx).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }
}
