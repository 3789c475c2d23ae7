//! Policies that identify the caller to the service: the `User-Agent` header
//! and a per-try client request id.

use crate::context::Context;
use crate::pipeline::{Next, Policy};
use crate::{RawResponse, Request, Result};
use async_trait::async_trait;
use uuid::Uuid;

/// Header carrying the per-try client request id.
pub const CLIENT_REQUEST_ID_HEADER: &str = "x-ms-client-request-id";

const MAX_APPLICATION_ID_LEN: usize = 24;

/// Options for [`TelemetryPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TelemetryOptions {
    /// Prefix identifying the calling application. Truncated to 24 characters.
    pub application_id: Option<String>,
}

impl TelemetryOptions {
    /// Sets the application id.
    pub fn application_id(mut self, id: impl Into<String>) -> Self {
        self.application_id = Some(id.into());
        self
    }
}

/// Sets `User-Agent` to
/// `[<application-id> ]skypipe-<component>/<version> (<os>; <arch>)`.
#[derive(Debug, Clone)]
pub struct TelemetryPolicy {
    user_agent: String,
}

impl TelemetryPolicy {
    /// Builds the user agent once for the lifetime of the policy.
    pub fn new(component: &str, version: &str, options: TelemetryOptions) -> Self {
        let platform = format!("({}; {})", std::env::consts::OS, std::env::consts::ARCH);
        let mut user_agent = String::new();
        if let Some(id) = options.application_id.as_deref().filter(|id| !id.is_empty()) {
            user_agent.extend(id.chars().take(MAX_APPLICATION_ID_LEN));
            user_agent.push(' ');
        }
        user_agent.push_str(&format!("skypipe-{}/{} {}", component, version, platform));
        Self { user_agent }
    }

    /// The computed `User-Agent` value.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

#[async_trait]
impl Policy for TelemetryPolicy {
    async fn send(&self, request: &mut Request, ctx: &Context, next: Next<'_>) -> Result<RawResponse> {
        request.set_header("User-Agent", self.user_agent.as_str())?;
        next.send(request, ctx).await
    }
}

/// Stamps every try with a fresh UUID v4 in `x-ms-client-request-id`.
///
/// Placed below the retry policy, so each attempt is distinguishable in
/// service-side logs.
#[derive(Debug, Clone, Default)]
pub struct RequestIdPolicy;

impl RequestIdPolicy {
    /// Creates the policy.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Policy for RequestIdPolicy {
    async fn send(&self, request: &mut Request, ctx: &Context, next: Next<'_>) -> Result<RawResponse> {
        request.set_header(CLIENT_REQUEST_ID_HEADER, Uuid::new_v4().to_string())?;
        next.send(request, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Pipeline;
    use crate::transport::{HttpTransport, TransportPolicy};
    use http::{Method, StatusCode};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Default)]
    struct HeaderCapture {
        name: &'static str,
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl HttpTransport for HeaderCapture {
        async fn send(&self, request: &mut Request, _ctx: &Context) -> Result<RawResponse> {
            self.seen
                .lock()
                .unwrap()
                .push(request.header(self.name).map(str::to_string));
            Ok(RawResponse::from_status(StatusCode::OK))
        }
    }

    fn request() -> Request {
        Request::new(Method::GET, "https://example.com/".parse().unwrap())
    }

    #[test]
    fn test_user_agent_format() {
        let policy = TelemetryPolicy::new("keyvault", "1.2.0", TelemetryOptions::default());
        let expected = format!(
            "skypipe-keyvault/1.2.0 ({}; {})",
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        assert_eq!(policy.user_agent(), expected);
    }

    #[test]
    fn test_application_id_is_truncated() {
        let options = TelemetryOptions::default().application_id("a-very-long-application-identifier");
        let policy = TelemetryPolicy::new("storage", "0.1.0", options);
        assert!(policy
            .user_agent()
            .starts_with("a-very-long-application- skypipe-storage/0.1.0 ("));
    }

    #[tokio::test]
    async fn test_sets_user_agent_header() {
        let transport = Arc::new(HeaderCapture {
            name: "user-agent",
            ..Default::default()
        });
        let policy = TelemetryPolicy::new(
            "core",
            "0.1.0",
            TelemetryOptions::default().application_id("myapp"),
        );
        let expected = policy.user_agent().to_string();
        let pipeline = Pipeline::new(vec![Arc::new(policy)], TransportPolicy::new(transport.clone()));

        pipeline.send(&mut request(), &Context::new()).await.unwrap();
        assert_eq!(*transport.seen.lock().unwrap(), vec![Some(expected)]);
    }

    #[tokio::test]
    async fn test_request_id_is_fresh_per_send() {
        let transport = Arc::new(HeaderCapture {
            name: CLIENT_REQUEST_ID_HEADER,
            ..Default::default()
        });
        let pipeline = Pipeline::new(
            vec![Arc::new(RequestIdPolicy::new())],
            TransportPolicy::new(transport.clone()),
        );

        let mut request = request();
        pipeline.send(&mut request, &Context::new()).await.unwrap();
        request.start_try();
        pipeline.send(&mut request, &Context::new()).await.unwrap();

        let seen = transport.seen.lock().unwrap();
        let first = seen[0].as_deref().unwrap();
        let second = seen[1].as_deref().unwrap();
        assert_ne!(first, second);
        assert!(Uuid::parse_str(first).is_ok());
    }
}
