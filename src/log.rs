//! Request/response logging with header and query-string redaction.
//!
//! Each send produces two `info` events: the outgoing request line with its
//! headers, and the response status with elapsed time. Header values and
//! query parameter values not on an allow-list are printed as `REDACTED`.

use crate::context::Context;
use crate::headers::Headers;
use crate::pipeline::{Next, Policy};
use crate::{RawResponse, Request, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt::Write as _;
use std::time::Instant;
use url::{form_urlencoded, Url};

const REDACTED: &str = "REDACTED";

const DEFAULT_ALLOWED_HEADERS: &[&str] = &[
    "accept",
    "cache-control",
    "connection",
    "content-length",
    "content-type",
    "date",
    "etag",
    "expires",
    "if-match",
    "if-modified-since",
    "if-none-match",
    "if-unmodified-since",
    "last-modified",
    "pragma",
    "request-id",
    "retry-after",
    "server",
    "traceparent",
    "tracestate",
    "transfer-encoding",
    "user-agent",
    "x-ms-client-request-id",
    "x-ms-request-id",
    "x-ms-return-client-request-id",
];

/// Which header and query parameter values may appear in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    /// Header names whose values are logged. Compared case-insensitively.
    pub allowed_headers: HashSet<String>,
    /// Query parameter names whose values are logged. Compared exactly,
    /// after percent-decoding.
    pub allowed_query_parameters: HashSet<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            allowed_headers: DEFAULT_ALLOWED_HEADERS
                .iter()
                .map(|h| h.to_string())
                .collect(),
            allowed_query_parameters: HashSet::new(),
        }
    }
}

impl LogOptions {
    /// Options with empty allow-lists: every value is redacted.
    pub fn redact_all() -> Self {
        Self {
            allowed_headers: HashSet::new(),
            allowed_query_parameters: HashSet::new(),
        }
    }

    /// Adds a header to the allow-list.
    pub fn allow_header(mut self, name: impl Into<String>) -> Self {
        self.allowed_headers.insert(name.into());
        self
    }

    /// Adds a query parameter to the allow-list.
    pub fn allow_query_parameter(mut self, name: impl Into<String>) -> Self {
        self.allowed_query_parameters.insert(name.into());
        self
    }
}

/// Logs each try through `tracing`.
#[derive(Debug, Clone)]
pub struct LogPolicy {
    allowed_headers: HashSet<String>,
    allowed_query_parameters: HashSet<String>,
}

impl LogPolicy {
    /// Creates a logging policy with the given allow-lists.
    pub fn new(options: LogOptions) -> Self {
        Self {
            allowed_headers: options
                .allowed_headers
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            allowed_query_parameters: options.allowed_query_parameters,
        }
    }

    /// Renders the request the way it is logged, with redaction applied.
    pub fn request_message(&self, request: &Request) -> String {
        let mut message = format!(
            "HTTP Request : {} {}",
            request.method(),
            self.redact_url(request.url())
        );
        for line in self.redact_headers(&request.headers()) {
            let _ = write!(message, "\n{}", line);
        }
        message
    }

    fn redact_url(&self, url: &Url) -> String {
        let mut base = url.clone();
        base.set_query(None);
        base.set_fragment(None);
        let mut out = base.to_string();

        let query = match url.query() {
            Some(query) if !query.is_empty() => query,
            _ => return out,
        };

        let mut pairs: Vec<(&str, Option<&str>)> = query
            .split('&')
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.split_once('=') {
                Some((name, value)) => (name, Some(value)),
                None => (segment, None),
            })
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));

        for (i, (raw_name, raw_value)) in pairs.into_iter().enumerate() {
            out.push(if i == 0 { '?' } else { '&' });
            out.push_str(raw_name);
            // bare flags like `?comp` have no value to redact
            let Some(raw_value) = raw_value else { continue };
            let allowed = form_urlencoded::parse(raw_name.as_bytes())
                .next()
                .map(|(name, _)| self.allowed_query_parameters.contains(&*name))
                .unwrap_or(false);
            out.push('=');
            out.push_str(if allowed { raw_value } else { REDACTED });
        }
        out
    }

    fn redact_headers(&self, headers: &Headers) -> Vec<String> {
        // Headers iterate in lowercase-name order.
        headers
            .iter()
            .map(|(name, value)| {
                let lower = name.to_ascii_lowercase();
                let shown = if self.allowed_headers.contains(&lower) {
                    value
                } else {
                    REDACTED
                };
                format!("{} : {}", lower, shown)
            })
            .collect()
    }
}

impl Default for LogPolicy {
    fn default() -> Self {
        Self::new(LogOptions::default())
    }
}

#[async_trait]
impl Policy for LogPolicy {
    async fn send(&self, request: &mut Request, ctx: &Context, next: Next<'_>) -> Result<RawResponse> {
        if tracing::enabled!(tracing::Level::INFO) {
            tracing::info!("{}", self.request_message(request));
        }

        let start = Instant::now();
        let result = next.send(request, ctx).await;
        let elapsed = start.elapsed().as_millis();

        match &result {
            Ok(response) => tracing::info!(
                status = response.status().as_u16(),
                "HTTP Response ({}ms) : {} {}",
                elapsed,
                response.status().as_u16(),
                response.reason_phrase()
            ),
            Err(e) => tracing::warn!(
                error = %e,
                "HTTP Response ({}ms) : failed: {}",
                elapsed,
                e
            ),
        }
        result
    }
}
