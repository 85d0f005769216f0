use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::dispatch::GraphApiDispatcher;
use crate::enrich::EventEnricher;
use crate::failure_sink::{FailureSink, FileFailureSink, NoopFailureSink};
use crate::limiters::ClientRateLimiter;
use crate::pipeline::{Pipeline, PipelineConfig};
use crate::policy::PolicyTable;
use crate::prometheus::setup_metrics_recorder;
use crate::router;
use crate::time::{SystemTime, TimeSource};

fn create_failure_sink(
    config: &Config,
    timesource: Arc<dyn TimeSource + Send + Sync>,
) -> Arc<dyn FailureSink + Send + Sync> {
    match &config.failed_events_path {
        Some(path) if !path.trim().is_empty() => {
            tracing::info!(path = %path, "undelivered events will be kept in a local log");
            Arc::new(FileFailureSink::new(
                path,
                config.failed_events_max_bytes,
                timesource,
            ))
        }
        _ => {
            tracing::warn!("FAILED_EVENTS_PATH is not set, undelivered events will be lost");
            Arc::new(NoopFailureSink {})
        }
    }
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let timesource: Arc<dyn TimeSource + Send + Sync> = Arc::new(SystemTime {});

    let dispatcher = GraphApiDispatcher::new(
        &config.graph_api_url,
        &config.graph_api_version,
        config.pixel_id.as_str(),
        config.access_token.0.clone(),
        config.request_timeout_ms.0,
        config.compression_threshold_bytes,
    )
    .context("failed to create upstream client")?;
    tracing::info!(endpoint = %dispatcher.endpoint(), "relaying events");

    let limiter = ClientRateLimiter::new(
        config.rate_limit_per_window,
        config.rate_limit_window(),
        config.rate_limit_max_clients,
    );
    if config.export_prometheus {
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter.report_metrics().await;
        });
    }
    {
        // Ensure that the rate limiter state does not grow unbounded
        let limiter = limiter.clone();
        tokio::spawn(async move {
            limiter.clean_state().await;
        });
    }

    let pipeline = Pipeline::new(
        PipelineConfig {
            pixel_id: config.pixel_id.0.clone(),
            max_events_per_batch: config.max_events_per_batch,
            test_event_code: config.test_event_code.clone(),
            expose_internal_errors: config.expose_internal_errors,
        },
        PolicyTable::default().with_unknown_policy(config.unknown_event_policy),
        EventEnricher::new(
            config.default_event_source_url.clone(),
            config.default_currency.clone(),
        ),
        Arc::new(dispatcher),
        create_failure_sink(&config, timesource.clone()),
        timesource,
    );

    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder().context("failed to install metrics recorder")?)
    } else {
        None
    };

    let app = router::router(
        pipeline,
        limiter,
        &config.allowed_origins.0,
        config.max_body_bytes,
        metrics,
    );

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    Ok(())
}
