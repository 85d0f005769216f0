use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use axum_client_ip::InsecureClientIp;
use http_body_util::LengthLimitError;
use serde_json::Value;
use tracing::{instrument, warn, Span};

use crate::api::{RelayError, RelayRequest};
use crate::enrich::RequestContext;
use crate::prometheus::{report_failed_request, report_rate_limited};
use crate::router;

const UNKNOWN_CLIENT: &str = "unknown";

#[instrument(skip_all, fields(client_ip, user_agent, body_size))]
pub async fn event(
    State(state): State<router::State>,
    ip: Option<InsecureClientIp>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<Value>, RelayError> {
    let client_ip = ip
        .map(|InsecureClientIp(ip)| ip.to_string())
        .unwrap_or_else(|| String::from(UNKNOWN_CLIENT));
    let user_agent = headers
        .get("user-agent")
        .map_or("unknown", |v| v.to_str().unwrap_or("unknown"));
    Span::current().record("client_ip", client_ip.as_str());
    Span::current().record("user_agent", user_agent);

    if !state.limiter.admit(&client_ip) {
        report_rate_limited();
        warn!("client over its request budget");
        return Err(RelayError::RateLimited);
    }

    let max = state.max_body_bytes;
    let declared = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared.is_some_and(|len| len > max) {
        return Err(RelayError::PayloadTooLarge { max });
    }

    let body = axum::body::to_bytes(body, max).await.map_err(|e| {
        if e.into_inner().downcast_ref::<LengthLimitError>().is_some() {
            RelayError::PayloadTooLarge { max }
        } else {
            RelayError::InvalidPayload(String::from("failed to read request body"))
        }
    })?;
    Span::current().record("body_size", body.len());

    let request: RelayRequest = serde_json::from_slice(&body)
        .map_err(|e| RelayError::InvalidPayload(format!("request body is not valid JSON: {e}")))?;

    let now = state.pipeline.timesource().now();
    let ctx = RequestContext::from_headers(&headers, client_ip, now);

    let response = state
        .pipeline
        .process(request, ctx)
        .await
        .inspect_err(|e| report_failed_request(e.to_metric_tag()))?;
    Ok(Json(response))
}

/// Preflights carrying CORS headers are answered by the cors layer, this
/// handles the rest.
pub async fn options() -> StatusCode {
    StatusCode::OK
}

pub async fn method_not_allowed() -> RelayError {
    RelayError::MethodNotAllowed
}
