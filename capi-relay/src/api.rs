use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::dispatch::DispatchError;

/// Seconds a rate limited client is told to wait before retrying.
pub const RETRY_AFTER_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("request holds no event")]
    EmptyBatch,
    #[error("batch holds {count} events, at most {max} are accepted")]
    TooManyEvents { count: usize, max: usize },
    #[error("request body exceeds {max} bytes")]
    PayloadTooLarge { max: usize },

    #[error("rate limit exceeded")]
    RateLimited,
    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("upstream API answered with status {status}")]
    Upstream {
        status: StatusCode,
        body: Value,
        elapsed: Duration,
    },
    #[error("timed out after {timeout:?} waiting for the upstream API")]
    Timeout { timeout: Duration },
    #[error("failed to reach the upstream API: {0}")]
    Transport(String),

    #[error("internal error: {message}")]
    Internal { message: String, expose: bool },
}

impl RelayError {
    pub fn internal(message: impl Into<String>, expose: bool) -> Self {
        RelayError::Internal {
            message: message.into(),
            expose,
        }
    }

    pub fn to_metric_tag(&self) -> &'static str {
        match self {
            RelayError::InvalidPayload(_) => "invalid_payload",
            RelayError::EmptyBatch => "empty_batch",
            RelayError::TooManyEvents { .. } => "too_many_events",
            RelayError::PayloadTooLarge { .. } => "payload_too_large",
            RelayError::RateLimited => "rate_limited",
            RelayError::MethodNotAllowed => "method_not_allowed",
            RelayError::Upstream { .. } => "upstream",
            RelayError::Timeout { .. } => "timeout",
            RelayError::Transport(_) => "transport",
            RelayError::Internal { .. } => "internal",
        }
    }
}

impl From<DispatchError> for RelayError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Upstream {
                status,
                body,
                elapsed,
            } => RelayError::Upstream {
                status,
                body,
                elapsed,
            },
            DispatchError::Timeout { timeout } => RelayError::Timeout { timeout },
            DispatchError::Transport(message) => RelayError::Transport(message),
            DispatchError::Serialization(e) => RelayError::internal(e.to_string(), false),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            RelayError::InvalidPayload(_)
            | RelayError::EmptyBatch
            | RelayError::TooManyEvents { .. } => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
            }

            RelayError::PayloadTooLarge { .. } => {
                (StatusCode::PAYLOAD_TOO_LARGE, Json(json!({ "error": message })))
            }

            RelayError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": message, "retry_after": RETRY_AFTER_SECS })),
            ),

            RelayError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                Json(json!({ "error": message })),
            ),

            RelayError::Upstream {
                status,
                body,
                elapsed,
            } => (
                status,
                Json(json!({
                    "error": "upstream API rejected the batch",
                    "details": body,
                    "processing_time_ms": elapsed.as_millis() as u64,
                })),
            ),

            RelayError::Timeout { timeout } => (
                StatusCode::REQUEST_TIMEOUT,
                Json(json!({
                    "error": "timed out sending events upstream",
                    "timeout_ms": timeout.as_millis() as u64,
                })),
            ),

            RelayError::Transport(_) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": message }))),

            RelayError::Internal { expose, .. } => {
                let error = if expose {
                    message
                } else {
                    String::from("internal server error")
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": error })),
                )
            }
        }
        .into_response()
    }
}

/// Inbound request body: `{ data: Event[], pixel_id?, test_event_code? }`.
///
/// `data` is kept as raw JSON so that shape errors surface as a 400 with a
/// readable message rather than an extractor rejection.
#[derive(Debug, Default, Deserialize)]
pub struct RelayRequest {
    pub data: Option<Value>,
    pub pixel_id: Option<String>,
    pub test_event_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyMetadata {
    pub processing_time_ms: u64,
    pub events_processed: usize,
    pub events_dropped: usize,
    pub compression_used: bool,
    pub timestamp: String,
}

/// Merges the upstream answer with our own metadata. Non-object upstream
/// bodies are kept under `response`.
pub fn merge_proxy_metadata(upstream: Value, metadata: &ProxyMetadata) -> Value {
    let metadata = serde_json::to_value(metadata).unwrap_or(Value::Null);
    match upstream {
        Value::Object(mut map) => {
            map.insert(String::from("proxy_metadata"), metadata);
            Value::Object(map)
        }
        Value::Null => json!({ "proxy_metadata": metadata }),
        other => json!({ "response": other, "proxy_metadata": metadata }),
    }
}
