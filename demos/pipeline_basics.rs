//! Walkthrough of the client and the pipeline underneath it.
//!
//! This example shows how to:
//! - Build a client with retry, telemetry and logging options
//! - Plug a custom policy into the pipeline
//! - Attach bearer tokens from a credential
//! - Bound a call with a deadline and cancel it
//! - Drop down to raw requests and responses
//!
//! Run with: `cargo run --example pipeline_basics`

use async_trait::async_trait;
use serde::Deserialize;
use skypipe::{
    AccessToken, Client, Context, Error, LogOptions, Next, Policy, RawResponse, Request,
    RetryOptions, TelemetryOptions, TokenCredential, TokenRequestContext,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct Post {
    #[serde(rename = "userId")]
    user_id: u32,
    id: u32,
    title: String,
}

/// Tags every call with the name of the calling feature.
#[derive(Debug, Clone)]
struct FeatureTag(&'static str);

#[async_trait]
impl Policy for FeatureTag {
    async fn send(
        &self,
        request: &mut Request,
        ctx: &Context,
        next: Next<'_>,
    ) -> skypipe::Result<RawResponse> {
        request.set_header("x-feature", self.0)?;
        next.send(request, ctx).await
    }
}

/// Hands out a fixed token. Real applications use an identity library.
#[derive(Debug)]
struct DemoCredential;

#[async_trait]
impl TokenCredential for DemoCredential {
    async fn get_token(
        &self,
        request: &TokenRequestContext,
        _ctx: &Context,
    ) -> skypipe::Result<AccessToken> {
        println!("  (fetching token for {:?})", request.scopes);
        Ok(AccessToken::new(
            "demo-token",
            SystemTime::now() + Duration::from_secs(3600),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter("skypipe=info,pipeline_basics=info")
        .init();

    let client = Client::builder()
        .base_url("https://jsonplaceholder.typicode.com")?
        .component("demo", env!("CARGO_PKG_VERSION"))
        .telemetry_options(TelemetryOptions::default().application_id("pipeline-basics"))
        .retry_options(RetryOptions::default().max_retries(2).base_delay(Duration::from_millis(500)))
        .log_options(LogOptions::default().allow_header("x-feature"))
        .credential(Arc::new(DemoCredential), ["api://demo/.default"])
        .per_call_policy(Arc::new(FeatureTag("walkthrough")))
        .timeout(Duration::from_secs(20))
        .build()?;

    println!("=== Typed GET ===");
    let post = client.get::<Post>("/posts/1").await?;
    println!("Post {}: {}", post.id, post.title);
    println!("Attempts: {}, latency: {:?}", post.attempts, post.latency);
    println!();

    println!("=== Second call reuses the cached token ===");
    let post = client.get::<Post>("/posts/2").await?;
    println!("Post {}: {}", post.id, post.title);
    println!();

    println!("=== HTTP errors ===");
    match client.get::<Post>("/posts/does-not-exist").await {
        Ok(post) => println!("Unexpected success: {:?}", post.data),
        Err(e) => println!("{} (retryable: {})", e, e.is_retryable()),
    }
    println!();

    println!("=== Cancellation ===");
    let ctx = Context::new().with_cancellation();
    ctx.cancel();
    let metadata = skypipe::metadata::RequestMetadata::new(http::Method::GET, "/posts/3");
    match client
        .call_with_context::<(), Post>(&ctx, metadata, None)
        .await
    {
        Err(Error::Cancelled) => println!("Call was cancelled before it started"),
        other => println!("Unexpected: {:?}", other.map(|r| r.data)),
    }
    println!();

    println!("=== Raw request ===");
    let mut request = client.request(http::Method::GET, "/posts/1/comments")?;
    let ctx = Context::new().with_timeout(Duration::from_secs(5));
    let response = client.send(&mut request, &ctx).await?;
    println!(
        "{} {} ({} bytes, content-type: {})",
        response.status().as_u16(),
        response.reason_phrase(),
        response.body().len(),
        response.header("content-type").unwrap_or("unknown")
    );

    Ok(())
}
