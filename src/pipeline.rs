//! The policy chain every request is threaded through.
//!
//! A [`Pipeline`] is an ordered list of [`Policy`] stages terminated by a
//! [`TransportPolicy`]. Each policy receives the request on the way down,
//! may mutate it, short-circuit, or forward it through [`Next`], and then sees
//! the response (or error) on the way back up. Given policies `[A, B]` the
//! call order is `A → B → transport → B → A`.
//!
//! # Examples
//!
//! ```no_run
//! use async_trait::async_trait;
//! use skypipe::context::Context;
//! use skypipe::pipeline::{Next, Pipeline, Policy};
//! use skypipe::transport::TransportPolicy;
//! use skypipe::{RawResponse, Request, Result};
//! use std::sync::Arc;
//!
//! #[derive(Debug)]
//! struct TagPolicy;
//!
//! #[async_trait]
//! impl Policy for TagPolicy {
//!     async fn send(
//!         &self,
//!         request: &mut Request,
//!         ctx: &Context,
//!         next: Next<'_>,
//!     ) -> Result<RawResponse> {
//!         request.set_header("x-tag", "demo")?;
//!         next.send(request, ctx).await
//!     }
//! }
//!
//! # async fn example() -> Result<()> {
//! let pipeline = Pipeline::new(vec![Arc::new(TagPolicy)], TransportPolicy::reqwest()?);
//! let mut request = Request::new(http::Method::GET, "https://example.com".parse()?);
//! let response = pipeline.send(&mut request, &Context::new()).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

use crate::context::Context;
use crate::transport::TransportPolicy;
use crate::{Error, RawResponse, Request, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// One stage of the pipeline.
///
/// Policies are built once and shared by every concurrent send, so `send`
/// takes `&self`; any mutable state must live behind the policy's own lock.
#[async_trait]
pub trait Policy: Send + Sync + fmt::Debug {
    /// Processes `request`, usually by forwarding it through `next`.
    ///
    /// `next` may be invoked zero times (short-circuit), once, or, for retry
    /// style policies, repeatedly.
    async fn send(&self, request: &mut Request, ctx: &Context, next: Next<'_>)
        -> Result<RawResponse>;
}

/// Handle to the remainder of the chain after the current policy.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    policies: &'a [Arc<dyn Policy>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(policies: &'a [Arc<dyn Policy>]) -> Self {
        Self { policies }
    }

    /// Sends `request` through the remaining policies.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the chain has no stage left, which
    /// means it was assembled without a terminal transport policy.
    pub async fn send(&self, request: &mut Request, ctx: &Context) -> Result<RawResponse> {
        match self.policies.split_first() {
            Some((policy, rest)) => policy.send(request, ctx, Next::new(rest)).await,
            None => Err(Error::ConfigurationError(
                "pipeline reached its end without a transport policy".to_string(),
            )),
        }
    }

    /// Number of stages remaining, including the transport.
    pub fn remaining(&self) -> usize {
        self.policies.len()
    }
}

impl fmt::Debug for Next<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.policies.len())
            .finish()
    }
}

/// An immutable, shareable chain of policies ending in a transport.
#[derive(Clone)]
pub struct Pipeline {
    policies: Arc<[Arc<dyn Policy>]>,
}

impl Pipeline {
    /// Builds a pipeline from `policies`, in order, followed by `transport`.
    pub fn new(policies: Vec<Arc<dyn Policy>>, transport: TransportPolicy) -> Self {
        let mut chain = policies;
        chain.push(Arc::new(transport));
        Self {
            policies: chain.into(),
        }
    }

    /// Sends `request` through every policy and returns the final response.
    ///
    /// Non-success statuses are returned as responses, not errors; see
    /// [`RawResponse::error_for_status`].
    pub async fn send(&self, request: &mut Request, ctx: &Context) -> Result<RawResponse> {
        tracing::trace!(
            method = %request.method(),
            url = %request.url(),
            stages = self.policies.len(),
            "Sending request through pipeline"
        );
        request.end_try();
        Next::new(&self.policies).send(request, ctx).await
    }

    /// The configured policies, transport last.
    pub fn policies(&self) -> &[Arc<dyn Policy>] {
        &self.policies
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.policies.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::HttpTransport;
    use http::{Method, StatusCode};
    use std::sync::Mutex;

    type Journal = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct Recording {
        name: &'static str,
        journal: Journal,
    }

    #[async_trait]
    impl Policy for Recording {
        async fn send(
            &self,
            request: &mut Request,
            ctx: &Context,
            next: Next<'_>,
        ) -> Result<RawResponse> {
            self.journal.lock().unwrap().push(format!("{}:down", self.name));
            let response = next.send(request, ctx).await;
            self.journal.lock().unwrap().push(format!("{}:up", self.name));
            response
        }
    }

    #[derive(Debug)]
    struct RecordingTransport {
        journal: Journal,
    }

    #[async_trait]
    impl HttpTransport for RecordingTransport {
        async fn send(&self, _request: &mut Request, _ctx: &Context) -> Result<RawResponse> {
            self.journal.lock().unwrap().push("transport".to_string());
            Ok(RawResponse::from_status(StatusCode::OK))
        }
    }

    #[derive(Debug)]
    struct ShortCircuit;

    #[async_trait]
    impl Policy for ShortCircuit {
        async fn send(
            &self,
            _request: &mut Request,
            _ctx: &Context,
            _next: Next<'_>,
        ) -> Result<RawResponse> {
            Ok(RawResponse::from_status(StatusCode::NOT_MODIFIED))
        }
    }

    fn request() -> Request {
        Request::new(Method::GET, "https://example.com/".parse().unwrap())
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let journal: Journal = Arc::default();
        let pipeline = Pipeline::new(
            vec![
                Arc::new(Recording {
                    name: "A",
                    journal: journal.clone(),
                }),
                Arc::new(Recording {
                    name: "B",
                    journal: journal.clone(),
                }),
            ],
            TransportPolicy::new(Arc::new(RecordingTransport {
                journal: journal.clone(),
            })),
        );

        let response = pipeline.send(&mut request(), &Context::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["A:down", "B:down", "transport", "B:up", "A:up"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_transport() {
        let journal: Journal = Arc::default();
        let pipeline = Pipeline::new(
            vec![Arc::new(ShortCircuit)],
            TransportPolicy::new(Arc::new(RecordingTransport {
                journal: journal.clone(),
            })),
        );

        let response = pipeline.send(&mut request(), &Context::new()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert!(journal.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_next_past_end_is_configuration_error() {
        let next = Next::new(&[]);
        let result = next.send(&mut request(), &Context::new()).await;
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }
}
