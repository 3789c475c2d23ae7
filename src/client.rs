//! HTTP client assembled from the standard policy pipeline.
//!
//! [`Client`] is the high-level entry point: it owns a [`Pipeline`] built by
//! [`ClientBuilder`] and layers JSON (de)serialization on top of it. Callers
//! that need the raw exchange use [`Client::send`].

use crate::auth::{BearerTokenPolicy, ChallengeHandler, TokenCredential, TokenRequestContext};
use crate::context::{Context, Key};
use crate::log::{LogOptions, LogPolicy};
use crate::pipeline::{Next, Pipeline, Policy};
use crate::retry::{RetryOptions, RetryPolicy};
use crate::telemetry::{RequestIdPolicy, TelemetryOptions, TelemetryPolicy};
use crate::transport::{HttpTransport, ReqwestTransport, TransportPolicy};
use crate::{headers, metadata::RequestMetadata, Error, Headers, RawResponse, Request, Response, Result};
use async_trait::async_trait;
use http::Method;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use url::Url;

/// A reusable HTTP client.
///
/// Cloning is cheap; clones share the pipeline, including the bearer token
/// cache and the connection pool.
///
/// # Examples
///
/// ```no_run
/// use serde::{Deserialize, Serialize};
/// use skypipe::{Client, Response, RetryOptions};
/// use std::time::Duration;
///
/// #[derive(Serialize)]
/// struct SetSecret {
///     value: String,
/// }
///
/// #[derive(Deserialize)]
/// struct Secret {
///     id: String,
///     value: String,
/// }
///
/// # async fn example() -> Result<(), skypipe::Error> {
/// let client = Client::builder()
///     .base_url("https://vault.example.net")?
///     .timeout(Duration::from_secs(30))
///     .retry_options(RetryOptions::default().max_retries(5))
///     .build()?;
///
/// let secret: Response<Secret> = client.get("/secrets/db-password").await?;
/// println!("Secret: {}", secret.data.id);
///
/// let body = SetSecret { value: "hunter2".to_string() };
/// let updated: Response<Secret> = client.put("/secrets/db-password", &body).await?;
/// println!("Updated: {}", updated.data.id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    pipeline: Pipeline,
    base_url: Url,
    default_headers: Headers,
    timeout: Option<Duration>,
    buffer_responses: bool,
}

fn attempts_key() -> &'static Key<Arc<AtomicUsize>> {
    static KEY: OnceLock<Key<Arc<AtomicUsize>>> = OnceLock::new();
    KEY.get_or_init(Key::new)
}

/// Counts tries for [`Response::attempts`]. Sits below the retry policy.
#[derive(Debug, Clone, Default)]
struct AttemptCounter;

#[async_trait]
impl Policy for AttemptCounter {
    async fn send(&self, request: &mut Request, ctx: &Context, next: Next<'_>) -> Result<RawResponse> {
        if let Some(counter) = ctx.value(attempts_key()) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        next.send(request, ctx).await
    }
}

impl Client {
    /// Creates a new [`ClientBuilder`].
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The assembled pipeline.
    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// The base URL relative paths are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// Creates a request for `path` carrying the client's default headers.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a default header is invalid.
    pub fn request(&self, method: Method, path: &str) -> Result<Request> {
        let mut request = Request::new(method, self.resolve(path));
        for (name, value) in &self.inner.default_headers {
            request.set_header(name, value)?;
        }
        request.set_buffer_response(self.inner.buffer_responses);
        Ok(request)
    }

    /// Sends `request` through the pipeline and returns the raw response.
    ///
    /// Non-success statuses are returned as responses; the configured client
    /// timeout is applied on top of `ctx`.
    pub async fn send(&self, request: &mut Request, ctx: &Context) -> Result<RawResponse> {
        let ctx = self.scoped(ctx);
        self.inner.pipeline.send(request, &ctx).await
    }

    /// Makes a typed call under the application context.
    ///
    /// Serializes `body` as JSON, sends it through the pipeline, and
    /// deserializes a 2xx body into `Res`. An empty body deserializes as JSON
    /// `null`, so `Res = ()` works for `204 No Content`.
    ///
    /// # Errors
    ///
    /// - [`Error::HttpError`] for a non-2xx final response
    /// - [`Error::DeserializationFailed`] if the body does not match `Res`
    /// - any error raised by the pipeline
    pub async fn call<Req, Res>(
        &self,
        metadata: RequestMetadata,
        body: Option<&Req>,
    ) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.call_with_context(&Context::application(), metadata, body)
            .await
    }

    /// Like [`Client::call`] but under `ctx`, which may carry a deadline or be
    /// cancelled by the caller.
    pub async fn call_with_context<Req, Res>(
        &self,
        ctx: &Context,
        metadata: RequestMetadata,
        body: Option<&Req>,
    ) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let mut request = self.build_request(&metadata, body)?;
        let attempts = Arc::new(AtomicUsize::new(0));
        let ctx = self
            .scoped(ctx)
            .with_value(attempts_key(), Arc::clone(&attempts));

        let start_time = Instant::now();
        let response = self.inner.pipeline.send(&mut request, &ctx).await;
        let latency = start_time.elapsed();
        let attempts = attempts.load(Ordering::Relaxed);

        let mut response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    attempts = attempts,
                    method = %metadata.method,
                    path = %metadata.path,
                    "Request failed"
                );
                return Err(e);
            }
        };
        response.buffer(&ctx).await?;

        tracing::info!(
            status = response.status().as_u16(),
            latency_ms = latency.as_millis(),
            attempts = attempts,
            "Received HTTP response"
        );

        let status = response.status();
        if !response.is_success() {
            let raw_response = String::from_utf8_lossy(response.body());
            if status.is_client_error() {
                tracing::error!(
                    status = status.as_u16(),
                    response = %raw_response,
                    "Client error (4xx)"
                );
            } else if status.is_server_error() {
                tracing::warn!(
                    status = status.as_u16(),
                    response = %raw_response,
                    "Server error (5xx)"
                );
            }
            return Err(response.into_http_error());
        }

        let raw_body = String::from_utf8_lossy(response.body()).into_owned();
        let text = if raw_body.trim().is_empty() {
            "null"
        } else {
            raw_body.as_str()
        };

        match serde_json::from_str::<Res>(text) {
            Ok(data) => Ok(Response::new(
                data,
                raw_body,
                status,
                response.headers().clone(),
                latency,
                attempts,
            )),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    raw_response = %raw_body,
                    "Failed to deserialize response"
                );

                Err(Error::DeserializationFailed {
                    raw_response: raw_body,
                    serde_error: e.to_string(),
                    status,
                })
            }
        }
    }

    fn build_request<Req>(&self, metadata: &RequestMetadata, body: Option<&Req>) -> Result<Request>
    where
        Req: Serialize,
    {
        let mut request = self.request(metadata.method.clone(), &metadata.path)?;
        if !metadata.query_params.is_empty() {
            let mut pairs = request.url_mut().query_pairs_mut();
            for (key, value) in &metadata.query_params {
                pairs.append_pair(key, value);
            }
        }
        for (name, value) in &metadata.headers {
            request.set_header(name, value)?;
        }
        if request.header("accept").is_none() {
            request.set_header("Accept", "application/json")?;
        }
        if let Some(body) = body {
            let json =
                serde_json::to_vec(body).map_err(|e| Error::SerializationFailed(e.to_string()))?;
            if request.header("content-type").is_none() {
                request.set_header("Content-Type", "application/json")?;
            }
            request.set_body(crate::body::MemoryBodyStream::new(json));
        }
        request.set_buffer_response(true);
        Ok(request)
    }

    fn resolve(&self, path: &str) -> Url {
        let mut url = self.inner.base_url.clone();
        if !path.is_empty() {
            let joined = format!(
                "{}/{}",
                url.path().trim_end_matches('/'),
                path.trim_start_matches('/')
            );
            url.set_path(&joined);
        }
        url
    }

    fn scoped(&self, ctx: &Context) -> Context {
        match self.inner.timeout {
            Some(timeout) => ctx.with_timeout(timeout),
            None => ctx.clone(),
        }
    }

    /// Makes a GET request to `path`.
    pub async fn get<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::GET, path);
        self.call::<(), Res>(metadata, None).await
    }

    /// Makes a POST request to `path` with a JSON body.
    pub async fn post<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::POST, path);
        self.call(metadata, Some(body)).await
    }

    /// Makes a PUT request to `path` with a JSON body.
    pub async fn put<Req, Res>(&self, path: impl Into<String>, body: &Req) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::PUT, path);
        self.call(metadata, Some(body)).await
    }

    /// Makes a DELETE request to `path`.
    pub async fn delete<Res>(&self, path: impl Into<String>) -> Result<Response<Res>>
    where
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::DELETE, path);
        self.call::<(), Res>(metadata, None).await
    }

    /// Makes a PATCH request to `path` with a JSON body.
    pub async fn patch<Req, Res>(
        &self,
        path: impl Into<String>,
        body: &Req,
    ) -> Result<Response<Res>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let metadata = RequestMetadata::new(Method::PATCH, path);
        self.call(metadata, Some(body)).await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_str())
            .field("pipeline", &self.inner.pipeline)
            .finish()
    }
}

/// Builder for a [`Client`].
///
/// The pipeline is assembled in this order:
///
/// 1. per-call policies
/// 2. [`TelemetryPolicy`]
/// 3. [`BearerTokenPolicy`], if a credential is configured
/// 4. [`RetryPolicy`]
/// 5. per-retry policies
/// 6. [`RequestIdPolicy`]
/// 7. [`LogPolicy`]
/// 8. the transport
///
/// # Examples
///
/// ```no_run
/// use skypipe::{ClientBuilder, LogOptions, RetryOptions, TelemetryOptions};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), skypipe::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://vault.example.net")?
///     .component("keyvault-secrets", "4.2.0")
///     .telemetry_options(TelemetryOptions::default().application_id("inventory-svc"))
///     .retry_options(RetryOptions::default().base_delay(Duration::from_millis(800)))
///     .log_options(LogOptions::default().allow_query_parameter("api-version"))
///     .default_header("x-ms-version", "2023-11-03")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: Headers,
    retry_options: RetryOptions,
    telemetry_options: TelemetryOptions,
    component: (String, String),
    log_options: LogOptions,
    credential: Option<(Arc<dyn TokenCredential>, TokenRequestContext)>,
    allow_insecure_auth: bool,
    challenge_handler: Option<Arc<dyn ChallengeHandler>>,
    timeout: Option<Duration>,
    transport: Option<Arc<dyn HttpTransport>>,
    per_call_policies: Vec<Arc<dyn Policy>>,
    per_retry_policies: Vec<Arc<dyn Policy>>,
    buffer_responses: bool,
}

impl ClientBuilder {
    /// Creates a builder with default settings.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: Headers::new(),
            retry_options: RetryOptions::default(),
            telemetry_options: TelemetryOptions::default(),
            component: ("core".to_string(), env!("CARGO_PKG_VERSION").to_string()),
            log_options: LogOptions::default(),
            credential: None,
            allow_insecure_auth: false,
            challenge_handler: None,
            timeout: None,
            transport: None,
            per_call_policies: Vec::new(),
            per_retry_policies: Vec::new(),
            buffer_responses: true,
        }
    }

    /// Sets the base URL for all requests.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a header sent with every request.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        headers::validate(name.as_ref(), value.as_ref())?;
        self.default_headers.insert(name.as_ref(), value.as_ref());
        Ok(self)
    }

    /// Sets retry behaviour. Use [`RetryOptions::none`] to disable retries.
    pub fn retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = options;
        self
    }

    /// Sets the application id reported in `User-Agent`.
    pub fn telemetry_options(mut self, options: TelemetryOptions) -> Self {
        self.telemetry_options = options;
        self
    }

    /// Names the component and version reported in `User-Agent`.
    pub fn component(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.component = (name.into(), version.into());
        self
    }

    /// Sets which header and query values appear in request logs.
    pub fn log_options(mut self, options: LogOptions) -> Self {
        self.log_options = options;
        self
    }

    /// Authorizes requests with bearer tokens from `credential` for `scopes`.
    pub fn credential<I, S>(mut self, credential: Arc<dyn TokenCredential>, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.credential = Some((credential, TokenRequestContext::new(scopes)));
        self
    }

    /// Permits bearer tokens over plain `http`. Only for local test servers.
    pub fn allow_insecure_auth(mut self, allow: bool) -> Self {
        self.allow_insecure_auth = allow;
        self
    }

    /// Answers `401` authentication challenges for the configured credential.
    pub fn challenge_handler(mut self, handler: Arc<dyn ChallengeHandler>) -> Self {
        self.challenge_handler = Some(handler);
        self
    }

    /// Bounds each call, retries and backoff included.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the default `reqwest` transport.
    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Adds a policy that runs once per call, before telemetry.
    pub fn per_call_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.per_call_policies.push(policy);
        self
    }

    /// Adds a policy that runs on every try, just below the retry policy.
    pub fn per_retry_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.per_retry_policies.push(policy);
        self
    }

    /// Whether requests created by [`Client::request`] buffer their response
    /// body. Typed calls always buffer.
    pub fn buffer_responses(mut self, buffer: bool) -> Self {
        self.buffer_responses = buffer;
        self
    }

    /// Builds the configured [`Client`].
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no base URL was provided, if a
    /// credential is configured for a non-`https` base URL without
    /// [`allow_insecure_auth`](Self::allow_insecure_auth), or if the default
    /// transport cannot be created.
    pub fn build(self) -> Result<Client> {
        let base_url = self
            .base_url
            .ok_or_else(|| Error::ConfigurationError("Base URL is required".to_string()))?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        let (component, version) = &self.component;
        let mut policies: Vec<Arc<dyn Policy>> = self.per_call_policies;
        policies.push(Arc::new(TelemetryPolicy::new(
            component,
            version,
            self.telemetry_options,
        )));
        if let Some((credential, scopes)) = self.credential {
            if base_url.scheme() != "https" && !self.allow_insecure_auth {
                return Err(Error::ConfigurationError(
                    "Bearer token authentication requires an https base URL".to_string(),
                ));
            }
            let mut bearer = BearerTokenPolicy::new(credential, scopes)
                .allow_insecure_http(self.allow_insecure_auth);
            if let Some(handler) = self.challenge_handler {
                bearer = bearer.challenge_handler(handler);
            }
            policies.push(Arc::new(bearer));
        }
        policies.push(Arc::new(RetryPolicy::new(self.retry_options)));
        policies.extend(self.per_retry_policies);
        policies.push(Arc::new(AttemptCounter));
        policies.push(Arc::new(RequestIdPolicy::new()));
        policies.push(Arc::new(LogPolicy::new(self.log_options)));

        let pipeline = Pipeline::new(policies, TransportPolicy::new(transport));
        tracing::debug!(base_url = %base_url, pipeline = ?pipeline, "Built client");

        Ok(Client {
            inner: Arc::new(ClientInner {
                pipeline,
                base_url,
                default_headers: self.default_headers,
                timeout: self.timeout,
                buffer_responses: self.buffer_responses,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_requires_base_url() {
        let result = ClientBuilder::new().build();
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn test_invalid_default_header() {
        let result = ClientBuilder::new().default_header("bad header", "v");
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }

    #[test]
    fn test_resolve_keeps_base_path() {
        let client = Client::builder()
            .base_url("https://example.com/api/")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(
            client.resolve("/users/7").as_str(),
            "https://example.com/api/users/7"
        );
        assert_eq!(client.resolve("").as_str(), "https://example.com/api/");
    }

    #[test]
    fn test_request_carries_default_headers() {
        let client = Client::builder()
            .base_url("https://example.com")
            .unwrap()
            .default_header("X-Tenant", "contoso")
            .unwrap()
            .buffer_responses(false)
            .build()
            .unwrap();
        let request = client.request(Method::GET, "/items").unwrap();
        assert_eq!(request.header("x-tenant"), Some("contoso"));
        assert!(!request.buffer_response());
    }

    #[test]
    fn test_default_pipeline_order() {
        let client = Client::builder()
            .base_url("https://example.com")
            .unwrap()
            .build()
            .unwrap();
        let names: Vec<String> = client
            .pipeline()
            .policies()
            .iter()
            .map(|p| format!("{:?}", p))
            .collect();
        let position = |prefix: &str| names.iter().position(|n| n.starts_with(prefix)).unwrap();
        assert!(position("TelemetryPolicy") < position("RetryPolicy"));
        assert!(position("RetryPolicy") < position("RequestIdPolicy"));
        assert!(position("RequestIdPolicy") < position("LogPolicy"));
        assert!(position("LogPolicy") < position("TransportPolicy"));
    }

    #[test]
    fn test_credential_requires_https() {
        #[derive(Debug)]
        struct NoCredential;

        #[async_trait]
        impl TokenCredential for NoCredential {
            async fn get_token(
                &self,
                _request: &TokenRequestContext,
                _ctx: &Context,
            ) -> Result<crate::auth::AccessToken> {
                Err(Error::authentication("unused"))
            }
        }

        let result = Client::builder()
            .base_url("http://localhost:8080")
            .unwrap()
            .credential(Arc::new(NoCredential), ["api://default"])
            .build();
        assert!(matches!(result, Err(Error::ConfigurationError(_))));
    }
}
