//! # skypipe - HTTP request pipeline core for cloud service clients
//!
//! Every request travels through an ordered chain of policies (telemetry,
//! bearer-token auth, retry, request id, logging) before a pluggable transport
//! puts it on the wire. A [`Context`](context::Context) carried alongside the
//! request bounds the whole exchange with a deadline and can cancel it,
//! including any backoff sleep in between retries.
//!
//! ## Quick Start
//!
//! ```no_run
//! use serde::Deserialize;
//! use skypipe::{Client, RetryOptions};
//! use std::time::Duration;
//!
//! #[derive(Deserialize)]
//! struct Secret {
//!     id: String,
//!     value: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), skypipe::Error> {
//!     let client = Client::builder()
//!         .base_url("https://vault.example.net")?
//!         .timeout(Duration::from_secs(30))
//!         .retry_options(RetryOptions::default().max_retries(5))
//!         .build()?;
//!
//!     let secret = client.get::<Secret>("/secrets/db-password").await?;
//!     println!("{} ({} attempt(s), {:?})", secret.id, secret.attempts, secret.latency);
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Policy pipeline** - onion-ordered middleware; plug in your own [`Policy`](pipeline::Policy)
//! - **Retry** - exponential backoff with jitter, `Retry-After` aware, deadline aware
//! - **Bearer-token auth** - cached tokens refreshed before expiry, one fetch under contention
//! - **Cancellation** - hierarchical contexts with deadlines and values
//! - **Redacted logging** - structured `tracing` events with header/query allow-lists
//! - **Pluggable transport** - `reqwest` by default, fakes in tests
//!
//! ## Error Handling
//!
//! Failures carry a discriminant that drives retry decisions:
//!
//! ```no_run
//! use skypipe::{Client, Error, ErrorKind};
//!
//! # async fn example() -> Result<(), Error> {
//! # let client = Client::builder().base_url("https://vault.example.net")?.build()?;
//! match client.get::<serde_json::Value>("/secrets/missing").await {
//!     Ok(response) => println!("Success: {:?}", response.data),
//!     Err(Error::HttpError { status, raw_response, .. }) => {
//!         eprintln!("HTTP error {}: {}", status, raw_response);
//!     }
//!     Err(e) if e.kind() == ErrorKind::Cancelled => eprintln!("Gave up"),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod auth;
pub mod body;
mod client;
pub mod context;
mod error;
pub mod headers;
pub mod log;
pub mod metadata;
pub mod pipeline;
mod raw_response;
pub mod request;
mod response;
pub mod retry;
pub mod telemetry;
pub mod transport;

pub use auth::{
    AccessToken, BearerTokenPolicy, ChallengeHandler, TokenCredential, TokenRequestContext,
};
pub use client::{Client, ClientBuilder};
pub use context::{reset_application_context, Context, Key};
pub use error::{BoxError, Error, ErrorKind, Result, TransportErrorKind};
pub use headers::Headers;
pub use log::{LogOptions, LogPolicy};
pub use pipeline::{Next, Pipeline, Policy};
pub use raw_response::RawResponse;
pub use request::Request;
pub use response::Response;
pub use retry::{RetryOptions, RetryPolicy};
pub use telemetry::{RequestIdPolicy, TelemetryOptions, TelemetryPolicy};
pub use transport::{HttpTransport, ReqwestTransport, TransportPolicy};
