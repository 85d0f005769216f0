use std::io::Write;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use metrics::{counter, histogram};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::event::OutboundBatch;

/// Bodies larger than this are gzipped before being sent.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 2048;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchResult {
    pub status: StatusCode,
    pub body: Value,
    pub elapsed: Duration,
    pub events_processed: usize,
    pub compressed: bool,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("upstream API answered with status {status}")]
    Upstream {
        status: StatusCode,
        body: Value,
        elapsed: Duration,
    },
    #[error("no answer from the upstream API within {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("failed to reach the upstream API: {0}")]
    Transport(String),
    #[error("failed to encode batch: {0}")]
    Serialization(String),
}

impl DispatchError {
    /// Whether sending the same batch later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Timeout { .. } | DispatchError::Transport(_) => true,
            DispatchError::Upstream { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            DispatchError::Serialization(_) => false,
        }
    }

    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            DispatchError::Upstream { .. } => "upstream",
            DispatchError::Timeout { .. } => "timeout",
            DispatchError::Transport(_) => "transport",
            DispatchError::Serialization(_) => "serialization",
        }
    }
}

#[async_trait]
pub trait Dispatcher {
    async fn dispatch(&self, batch: &OutboundBatch) -> Result<DispatchResult, DispatchError>;
}

/// Serializes the batch and gzips it when it is over `threshold` bytes.
/// Returns the body and whether it was compressed.
pub fn encode_body(batch: &OutboundBatch, threshold: usize) -> Result<(Vec<u8>, bool), DispatchError> {
    let json =
        serde_json::to_vec(batch).map_err(|e| DispatchError::Serialization(e.to_string()))?;
    if json.len() <= threshold {
        return Ok((json, false));
    }

    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 4), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| DispatchError::Serialization(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| DispatchError::Serialization(e.to_string()))?;

    Ok((compressed, true))
}

/// Sends batches to the Conversions API events endpoint of one pixel.
#[derive(Clone)]
pub struct GraphApiDispatcher {
    client: reqwest::Client,
    endpoint: Url,
    access_token: String,
    timeout: Duration,
    compression_threshold: usize,
}

impl GraphApiDispatcher {
    pub fn new(
        base_url: &str,
        api_version: &str,
        pixel_id: &str,
        access_token: String,
        timeout: Duration,
        compression_threshold: usize,
    ) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&format!(
            "{}/{}/{}/events",
            base_url.trim_end_matches('/'),
            api_version.trim_matches('/'),
            pixel_id
        ))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("capi-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            endpoint,
            access_token,
            timeout,
            compression_threshold,
        })
    }

    /// The events URL, without credentials. Safe to log.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    async fn send(&self, body: Vec<u8>, compressed: bool) -> Result<(StatusCode, Value), DispatchError> {
        let mut request = self
            .client
            .post(self.endpoint.clone())
            .query(&[("access_token", self.access_token.as_str())])
            .body(body);
        if compressed {
            request = request.header(header::CONTENT_ENCODING, "gzip");
        }

        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(classify)?;

        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));

        Ok((status, body))
    }
}

fn classify(error: reqwest::Error) -> DispatchError {
    // Never render the request URL: it carries the access token.
    let error = error.without_url();
    DispatchError::Transport(error.to_string())
}

#[async_trait]
impl Dispatcher for GraphApiDispatcher {
    #[instrument(skip_all, fields(events = batch.data.len(), compressed))]
    async fn dispatch(&self, batch: &OutboundBatch) -> Result<DispatchResult, DispatchError> {
        let start = Instant::now();
        let (body, compressed) = encode_body(batch, self.compression_threshold)?;
        tracing::Span::current().record("compressed", compressed);
        debug!(bytes = body.len(), "sending batch upstream");

        // Dropping the in-flight future on expiry cancels the request.
        let outcome = tokio::time::timeout(self.timeout, self.send(body, compressed)).await;
        let elapsed = start.elapsed();
        histogram!("capi_relay_dispatch_duration_seconds").record(elapsed.as_secs_f64());

        let result = match outcome {
            Err(_) => Err(DispatchError::Timeout {
                timeout: self.timeout,
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok((status, body))) if status.is_success() => Ok(DispatchResult {
                status,
                body,
                elapsed,
                events_processed: batch.data.len(),
                compressed,
            }),
            Ok(Ok((status, body))) => Err(DispatchError::Upstream {
                status,
                body,
                elapsed,
            }),
        };

        match &result {
            Ok(_) => {
                counter!("capi_relay_events_dispatched_total").increment(batch.data.len() as u64)
            }
            Err(e) => {
                counter!("capi_relay_dispatch_failures_total", "kind" => e.to_metric_tag())
                    .increment(1)
            }
        }

        result
    }
}
