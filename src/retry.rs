//! Retry policy for transient failures.
//!
//! The [`RetryPolicy`] re-sends a request after a connection-level failure or
//! a response whose status is in [`RetryOptions::status_codes`]. Delays grow
//! exponentially with jitter unless the server says how long to wait.

use crate::context::{Context, Key};
use crate::headers::Headers;
use crate::pipeline::{Next, Policy};
use crate::{Error, ErrorKind, RawResponse, Request, Result};
use async_trait::async_trait;
use http::StatusCode;
use rand::Rng;
use std::collections::HashSet;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

/// Configures when and how requests are retried.
///
/// # Examples
///
/// ```
/// use skypipe::RetryOptions;
/// use std::time::Duration;
///
/// // Backoff without jitter: 100ms, 200ms, 400ms, 800ms...
/// let options = RetryOptions::default()
///     .max_retries(5)
///     .base_delay(Duration::from_millis(100))
///     .max_delay(Duration::from_secs(30))
///     .jitter(false);
///
/// assert_eq!(options.backoff(1), Duration::from_millis(100));
/// assert_eq!(options.backoff(3), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct RetryOptions {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    status_codes: HashSet<StatusCode>,
    jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(120),
            status_codes: [
                StatusCode::REQUEST_TIMEOUT,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ]
            .into_iter()
            .collect(),
            jitter: true,
        }
    }
}

impl RetryOptions {
    /// Disables retries entirely.
    pub fn none() -> Self {
        Self::default().max_retries(0)
    }

    /// Maximum number of retries after the first attempt.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before the first retry; doubles for each retry after that.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Upper bound on any computed delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Replaces the set of retryable status codes.
    pub fn status_codes(mut self, codes: impl IntoIterator<Item = StatusCode>) -> Self {
        self.status_codes = codes.into_iter().collect();
        self
    }

    /// Whether to add random jitter to computed delays (recommended).
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// The configured retry limit.
    pub fn retry_limit(&self) -> u32 {
        self.max_retries
    }

    /// Returns `true` if `status` is retryable under these options.
    pub fn is_retryable_status(&self, status: StatusCode) -> bool {
        self.status_codes.contains(&status)
    }

    /// Backoff before retry number `retry` (1 = first retry), without jitter:
    /// `min(max_delay, base_delay * 2^(retry - 1))`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let multiplier = 2u32.saturating_pow(retry.saturating_sub(1));
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Backoff plus jitter drawn uniformly from `[0, backoff]`, capped at
    /// `max_delay`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let backoff = self.backoff(retry);
        if !self.jitter {
            return backoff;
        }
        let factor = rand::thread_rng().gen_range(0.0..=1.0);
        let jitter = Duration::try_from_secs_f64(backoff.as_secs_f64() * factor)
            .unwrap_or(Duration::ZERO);
        backoff.saturating_add(jitter).min(self.max_delay)
    }

    /// Delay before retrying after `response` on attempt `attempt` (1-based),
    /// or `None` if the response is final.
    ///
    /// A server-provided retry hint takes precedence over the computed
    /// backoff.
    pub fn retry_delay_for_response(&self, response: &RawResponse, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries || !self.is_retryable_status(response.status()) {
            return None;
        }
        Some(retry_after(response.headers()).unwrap_or_else(|| self.delay_for_retry(attempt)))
    }

    /// Delay before retrying after `error` on attempt `attempt` (1-based), or
    /// `None` if the error is final.
    ///
    /// Only transport failures are retried; cancellation, authentication and
    /// rewind failures never are.
    pub fn retry_delay_for_error(&self, error: &Error, attempt: u32) -> Option<Duration> {
        if attempt > self.max_retries {
            return None;
        }
        match error.kind() {
            ErrorKind::Transport => Some(self.delay_for_retry(attempt)),
            ErrorKind::Cancelled
            | ErrorKind::HttpStatus
            | ErrorKind::Authentication
            | ErrorKind::RewindFailed
            | ErrorKind::Deserialization
            | ErrorKind::Serialization
            | ErrorKind::Configuration => None,
        }
    }
}

fn retry_key() -> &'static Key<i32> {
    static KEY: OnceLock<Key<i32>> = OnceLock::new();
    KEY.get_or_init(Key::new)
}

/// Zero-based retry number of 1-based `attempt`, saturating at `i32::MAX`.
fn retry_number_of(attempt: u32) -> i32 {
    i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX)
}

/// Pipeline stage that retries transient failures.
///
/// Place it below authentication and telemetry (their headers persist across
/// attempts) and above per-attempt policies such as request-id and logging.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    options: RetryOptions,
}

impl RetryPolicy {
    /// Creates a retry policy.
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    /// The policy's options.
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// The retry number of the attempt `ctx` belongs to.
    ///
    /// `-1` outside a retry policy, `0` for the first try, `1` for the first
    /// retry, and so on. Policies below the retry policy can use it.
    pub fn retry_number(ctx: &Context) -> i32 {
        ctx.value(retry_key()).copied().unwrap_or(-1)
    }

    async fn send_tries(
        &self,
        request: &mut Request,
        ctx: &Context,
        next: Next<'_>,
    ) -> Result<RawResponse> {
        let original_url = request.url().clone();
        let mut attempt: u32 = 1;

        loop {
            ctx.check_cancelled()?;
            request.start_try();
            let attempt_ctx = ctx.with_value(retry_key(), retry_number_of(attempt));

            let (delay, last) = match next.send(request, &attempt_ctx).await {
                Ok(response) => match self.options.retry_delay_for_response(&response, attempt) {
                    Some(delay) => {
                        tracing::info!(
                            status = response.status().as_u16(),
                            attempt = attempt,
                            "HTTP status code will be retried"
                        );
                        (delay, Ok(response))
                    }
                    None => {
                        if !response.is_success() {
                            tracing::debug!(
                                status = response.status().as_u16(),
                                attempt = attempt,
                                "HTTP status code won't be retried"
                            );
                        }
                        return Ok(response);
                    }
                },
                Err(error) => {
                    tracing::warn!(error = %error, attempt = attempt, "HTTP request failed");
                    match self.options.retry_delay_for_error(&error, attempt) {
                        Some(delay) => (delay, Err(error)),
                        None => return Err(error),
                    }
                }
            };

            if let Some(remaining) = ctx.remaining() {
                if delay >= remaining {
                    tracing::warn!(
                        delay_ms = delay.as_millis(),
                        remaining_ms = remaining.as_millis(),
                        "Retry delay exceeds the context deadline, giving up"
                    );
                    return last;
                }
            }

            if let Err(rewind) = request.rewind_body() {
                tracing::warn!(error = %rewind, "Cannot retry: request body is not rewindable");
                return Err(rewind);
            }
            request.set_url(original_url.clone());

            tracing::info!(
                delay_ms = delay.as_millis(),
                attempt = attempt,
                "Retrying request after delay"
            );
            if !delay.is_zero() {
                ctx.sleep(delay).await?;
            }
            attempt = attempt.saturating_add(1);
        }
    }
}

#[async_trait]
impl Policy for RetryPolicy {
    async fn send(&self, request: &mut Request, ctx: &Context, next: Next<'_>) -> Result<RawResponse> {
        let result = self.send_tries(request, ctx, next).await;
        request.end_try();
        result
    }
}

/// Parses a server retry hint.
///
/// Checks `retry-after-ms` and `x-ms-retry-after-ms` (milliseconds), then
/// `Retry-After`, which is either delay-seconds or an HTTP date.
pub fn retry_after(headers: &Headers) -> Option<Duration> {
    for name in ["retry-after-ms", "x-ms-retry-after-ms"] {
        if let Some(value) = headers.get(name) {
            if let Ok(millis) = value.trim().parse::<u64>() {
                return Some(Duration::from_millis(millis));
            }
        }
    }

    let header = headers.get("retry-after")?.trim();

    if let Ok(seconds) = header.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    // RFC 7231 HTTP date
    if let Ok(date_time) = httpdate::parse_http_date(header) {
        if let Ok(duration) = date_time.duration_since(SystemTime::now()) {
            return Some(duration);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;

    fn options() -> RetryOptions {
        RetryOptions::default()
            .max_retries(5)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .jitter(false)
    }

    fn response(status: StatusCode) -> RawResponse {
        RawResponse::from_status(status)
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let options = options();
        assert_eq!(options.backoff(1), Duration::from_millis(100));
        assert_eq!(options.backoff(2), Duration::from_millis(200));
        assert_eq!(options.backoff(3), Duration::from_millis(400));
        assert_eq!(options.backoff(4), Duration::from_millis(800));
        assert_eq!(options.backoff(5), Duration::from_secs(1));
        assert_eq!(options.backoff(40), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_non_decreasing_and_bounded() {
        let options = RetryOptions::default()
            .base_delay(Duration::from_millis(3))
            .max_delay(Duration::from_millis(700));
        let mut previous = Duration::ZERO;
        for retry in 1..64 {
            let delay = options.backoff(retry);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(700));
            previous = delay;
        }
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let options = options().jitter(true);
        for retry in 1..8 {
            let backoff = options.backoff(retry);
            for _ in 0..50 {
                let delay = options.delay_for_retry(retry);
                assert!(delay >= backoff);
                assert!(delay <= (backoff * 2).min(Duration::from_secs(1)));
            }
        }
    }

    #[test]
    fn test_retry_eligibility_by_status() {
        let options = options();
        assert!(options
            .retry_delay_for_response(&response(StatusCode::NOT_FOUND), 1)
            .is_none());
        assert!(options
            .retry_delay_for_response(&response(StatusCode::OK), 1)
            .is_none());
        for status in [408u16, 429, 500, 502, 503, 504] {
            let status = StatusCode::from_u16(status).unwrap();
            assert_eq!(
                options.retry_delay_for_response(&response(status), 1),
                Some(Duration::from_millis(100))
            );
        }
    }

    #[test]
    fn test_retries_exhausted() {
        let options = options().max_retries(2);
        let unavailable = response(StatusCode::SERVICE_UNAVAILABLE);
        assert!(options.retry_delay_for_response(&unavailable, 2).is_some());
        assert!(options.retry_delay_for_response(&unavailable, 3).is_none());

        let err = Error::transport(TransportErrorKind::Connect, "reset");
        assert!(options.retry_delay_for_error(&err, 2).is_some());
        assert!(options.retry_delay_for_error(&err, 3).is_none());
    }

    #[test]
    fn test_only_transport_errors_retried() {
        let options = options();
        assert!(options
            .retry_delay_for_error(&Error::transport(TransportErrorKind::Resolve, "dns"), 1)
            .is_some());
        assert!(options.retry_delay_for_error(&Error::Cancelled, 1).is_none());
        assert!(options
            .retry_delay_for_error(&Error::authentication("denied"), 1)
            .is_none());
        assert!(options
            .retry_delay_for_error(&Error::RewindFailed("socket".into()), 1)
            .is_none());
    }

    #[test]
    fn test_retry_after_header_takes_precedence() {
        let options = options();
        let mut throttled = response(StatusCode::TOO_MANY_REQUESTS);
        throttled.headers_mut().insert("Retry-After", "7");
        assert_eq!(
            options.retry_delay_for_response(&throttled, 1),
            Some(Duration::from_secs(7))
        );
    }

    #[test]
    fn test_parse_retry_after_variants() {
        let mut headers = Headers::new();
        headers.insert("retry-after", "60");
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(60)));

        headers.insert("x-ms-retry-after-ms", "250");
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(250)));

        headers.insert("Retry-After-Ms", "10");
        assert_eq!(retry_after(&headers), Some(Duration::from_millis(10)));

        let mut headers = Headers::new();
        headers.insert("retry-after", "soon");
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_parse_retry_after_http_date() {
        let future = SystemTime::now() + Duration::from_secs(120);
        let mut headers = Headers::new();
        headers.insert("Retry-After", httpdate::fmt_http_date(future));

        let delay = retry_after(&headers).unwrap();
        assert!(delay > Duration::from_secs(110) && delay <= Duration::from_secs(120));

        let past = SystemTime::now() - Duration::from_secs(120);
        headers.insert("Retry-After", httpdate::fmt_http_date(past));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn test_unbounded_retry_limit_does_not_overflow() {
        assert_eq!(retry_number_of(1), 0);
        assert_eq!(retry_number_of(3), 2);
        assert_eq!(retry_number_of(u32::MAX), i32::MAX);

        let options = options().max_retries(u32::MAX);
        let unavailable = response(StatusCode::SERVICE_UNAVAILABLE);
        assert!(options
            .retry_delay_for_response(&unavailable, u32::MAX)
            .is_some());
        assert_eq!(options.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_retry_number_outside_policy() {
        assert_eq!(RetryPolicy::retry_number(&Context::new()), -1);
    }
}
