//! Bearer-token authentication.
//!
//! [`BearerTokenPolicy`] asks a [`TokenCredential`] for an access token,
//! caches it, and attaches `Authorization: Bearer <token>` to every request.
//! The token is refreshed shortly before it expires. Fetches are serialized
//! so concurrent requests sharing one policy trigger a single credential call.
//!
//! Services that answer `401 Unauthorized` with a `WWW-Authenticate`
//! challenge (naming another tenant or scope) are handled by a
//! [`ChallengeHandler`]: when it returns a new [`TokenRequestContext`], the
//! request is authorized again and re-sent once.

use crate::context::Context;
use crate::pipeline::{Next, Policy};
use crate::{Error, RawResponse, Request, Result};
use async_trait::async_trait;
use http::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;

/// How long before expiry a cached token is considered stale.
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(120);

/// A bearer token and the moment it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// The opaque token string.
    pub token: String,
    /// Absolute expiry time.
    pub expires_on: SystemTime,
}

impl AccessToken {
    /// Creates a token.
    pub fn new(token: impl Into<String>, expires_on: SystemTime) -> Self {
        Self {
            token: token.into(),
            expires_on,
        }
    }

    /// Returns `true` if the token expires within `skew` from now.
    pub fn expires_within(&self, skew: Duration) -> bool {
        match SystemTime::now().checked_add(skew) {
            Some(horizon) => horizon >= self.expires_on,
            None => true,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// What a token is requested for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenRequestContext {
    /// Authorization scopes, e.g. `https://vault.example.net/.default`.
    pub scopes: Vec<String>,
    /// Tenant to authenticate against, if not the credential's default.
    pub tenant_id: Option<String>,
}

impl TokenRequestContext {
    /// Creates a request for `scopes`.
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scopes: scopes.into_iter().map(Into::into).collect(),
            tenant_id: None,
        }
    }

    /// Sets the tenant.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// A source of access tokens.
///
/// Concrete flows (client secret, managed identity, CLI, ...) implement this.
/// A rejected or unobtainable token should be reported as
/// [`Error::Authentication`].
#[async_trait]
pub trait TokenCredential: Send + Sync + fmt::Debug {
    /// Obtains a token for `request`. May block on network I/O.
    async fn get_token(&self, request: &TokenRequestContext, ctx: &Context)
        -> Result<AccessToken>;
}

/// Decides how to answer an authentication challenge.
///
/// Called when a response is `401 Unauthorized` and carries a
/// `WWW-Authenticate` header. Returning `Some` re-authorizes the request with
/// the given token request and sends it once more; `None` hands the `401`
/// back to the caller.
pub trait ChallengeHandler: Send + Sync + fmt::Debug {
    /// Maps the raw `WWW-Authenticate` value to a token request, if the
    /// challenge can be satisfied.
    fn token_request_for_challenge(
        &self,
        challenge: &str,
        request: &Request,
    ) -> Option<TokenRequestContext>;
}

struct CachedToken {
    token: AccessToken,
    request: TokenRequestContext,
}

/// Pipeline stage that authorizes requests with a bearer token.
///
/// Sits above the retry policy, so credential failures surface immediately
/// instead of being retried.
pub struct BearerTokenPolicy {
    credential: Arc<dyn TokenCredential>,
    token_request: TokenRequestContext,
    refresh_skew: Duration,
    allow_insecure_http: bool,
    challenge_handler: Option<Arc<dyn ChallengeHandler>>,
    cache: Mutex<Option<CachedToken>>,
}

impl BearerTokenPolicy {
    /// Creates a policy requesting tokens for `token_request`.
    pub fn new(credential: Arc<dyn TokenCredential>, token_request: TokenRequestContext) -> Self {
        Self {
            credential,
            token_request,
            refresh_skew: DEFAULT_REFRESH_SKEW,
            allow_insecure_http: false,
            challenge_handler: None,
            cache: Mutex::new(None),
        }
    }

    /// Overrides how long before expiry the cached token is refreshed.
    pub fn refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    /// Allows sending tokens over plain `http` (local test servers only).
    pub fn allow_insecure_http(mut self, allow: bool) -> Self {
        self.allow_insecure_http = allow;
        self
    }

    /// Answers `401` challenges with `handler`. Without one, a challenge
    /// response is returned as is.
    pub fn challenge_handler(mut self, handler: Arc<dyn ChallengeHandler>) -> Self {
        self.challenge_handler = Some(handler);
        self
    }

    /// The token request to retry with, if `response` is a challenge the
    /// handler can satisfy.
    fn challenge_token_request(
        &self,
        request: &Request,
        response: &RawResponse,
    ) -> Option<TokenRequestContext> {
        let handler = self.challenge_handler.as_ref()?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return None;
        }
        let challenge = response.header("www-authenticate")?;
        tracing::debug!(challenge = challenge, "Received authentication challenge");
        handler.token_request_for_challenge(challenge, request)
    }

    /// Sets the `Authorization` header on `request` using a token for
    /// `token_request`, fetching a new token if the cached one is missing,
    /// stale, or was issued for other scopes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Authentication`] if the URL is not `https` (unless
    /// allowed) or the credential fails, and [`Error::Cancelled`] if `ctx`
    /// is cancelled while waiting.
    pub async fn authorize_request(
        &self,
        request: &mut Request,
        ctx: &Context,
        token_request: &TokenRequestContext,
    ) -> Result<()> {
        if request.url().scheme() != "https" && !self.allow_insecure_http {
            return Err(Error::authentication(
                "Bearer token authentication is not permitted for non TLS protected (https) endpoints",
            ));
        }
        let token = self.token(ctx, token_request).await?;
        request.set_header("Authorization", format!("Bearer {}", token))
    }

    async fn token(&self, ctx: &Context, token_request: &TokenRequestContext) -> Result<String> {
        ctx.check_cancelled()?;
        let mut cache = tokio::select! {
            guard = self.cache.lock() => guard,
            _ = ctx.cancelled() => return Err(Error::Cancelled),
        };

        if let Some(cached) = &*cache {
            if cached.request == *token_request && !cached.token.expires_within(self.refresh_skew) {
                return Ok(cached.token.token.clone());
            }
        }

        tracing::debug!(scopes = ?token_request.scopes, "Acquiring access token");
        let token = self
            .credential
            .get_token(token_request, ctx)
            .await
            .map_err(into_authentication_error)?;
        let value = token.token.clone();
        *cache = Some(CachedToken {
            token,
            request: token_request.clone(),
        });
        Ok(value)
    }
}

fn into_authentication_error(err: Error) -> Error {
    match err {
        Error::Authentication { .. } | Error::Cancelled => err,
        other => Error::Authentication {
            message: format!("Failed to acquire access token: {}", other),
            source: Some(Box::new(other)),
        },
    }
}

impl Clone for BearerTokenPolicy {
    /// Clones share the credential but start with an empty token cache.
    fn clone(&self) -> Self {
        Self {
            credential: Arc::clone(&self.credential),
            token_request: self.token_request.clone(),
            refresh_skew: self.refresh_skew,
            allow_insecure_http: self.allow_insecure_http,
            challenge_handler: self.challenge_handler.clone(),
            cache: Mutex::new(None),
        }
    }
}

impl fmt::Debug for BearerTokenPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerTokenPolicy")
            .field("credential", &self.credential)
            .field("scopes", &self.token_request.scopes)
            .field("refresh_skew", &self.refresh_skew)
            .field("challenge_handler", &self.challenge_handler)
            .finish()
    }
}

#[async_trait]
impl Policy for BearerTokenPolicy {
    async fn send(&self, request: &mut Request, ctx: &Context, next: Next<'_>) -> Result<RawResponse> {
        self.authorize_request(request, ctx, &self.token_request)
            .await?;
        let response = next.send(request, ctx).await?;

        let token_request = match self.challenge_token_request(request, &response) {
            Some(token_request) => token_request,
            None => return Ok(response),
        };
        drop(response);
        request.rewind_body()?;
        self.authorize_request(request, ctx, &token_request).await?;
        next.send(request, ctx).await
    }
}
