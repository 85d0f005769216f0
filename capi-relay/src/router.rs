use std::future::ready;
use std::sync::Arc;

use axum::http::header::{self, HeaderName, HeaderValue};
use axum::http::Method;
use axum::routing::{get, post, MethodRouter};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use crate::endpoint;
use crate::limiters::ClientRateLimiter;
use crate::pipeline::Pipeline;
use crate::prometheus::track_metrics;

#[derive(Clone)]
pub struct State {
    pub pipeline: Arc<Pipeline>,
    pub limiter: ClientRateLimiter,
    pub max_body_bytes: usize,
}

async fn index() -> &'static str {
    "capi-relay"
}

fn events_route() -> MethodRouter<State> {
    post(endpoint::event)
        .options(endpoint::options)
        .fallback(endpoint::method_not_allowed)
}

fn cors(allowed_origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
        ])
        .allow_credentials(true)
        .allow_origin(AllowOrigin::list(origins))
}

pub fn router(
    pipeline: Pipeline,
    limiter: ClientRateLimiter,
    allowed_origins: &[String],
    max_body_bytes: usize,
    metrics: Option<PrometheusHandle>,
) -> Router {
    let state = State {
        pipeline: Arc::new(pipeline),
        limiter,
        max_body_bytes,
    };

    let security_headers = [
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (header::X_FRAME_OPTIONS, "DENY"),
        (header::REFERRER_POLICY, "no-referrer"),
        (HeaderName::from_static("x-robots-tag"), "noindex, nofollow"),
        (
            header::STRICT_TRANSPORT_SECURITY,
            "max-age=31536000; includeSubDomains",
        ),
    ];

    let mut router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/api/events", events_route())
        .route("/events", events_route())
        .with_state(state);

    // Don't install metrics unless asked to
    if let Some(recorder_handle) = metrics {
        router = router.route("/metrics", get(move || ready(recorder_handle.render())));
    }

    router = router
        .layer(TraceLayer::new_for_http())
        .layer(cors(allowed_origins));

    // outside of the cors layer so that preflight answers carry them too
    for (name, value) in security_headers {
        router = router.layer(SetResponseHeaderLayer::overriding(
            name,
            HeaderValue::from_static(value),
        ));
    }

    router.layer(axum::middleware::from_fn(track_metrics))
}
