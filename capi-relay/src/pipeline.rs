use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::api::{merge_proxy_metadata, ProxyMetadata, RelayError, RelayRequest};
use crate::dedup::Deduplicator;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::enrich::{EventEnricher, PreparedEvent, RequestContext};
use crate::event::{EnrichedEvent, OutboundBatch, RawEvent};
use crate::external_id::{self, ClientFingerprint};
use crate::failure_sink::FailureSink;
use crate::pii;
use crate::policy::PolicyTable;
use crate::prometheus::report_dropped_events;
use crate::time::TimeSource;
use crate::validation::{EventValidator, ValidationError};

pub const DEFAULT_MAX_EVENTS_PER_BATCH: usize = 20;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub pixel_id: String,
    pub max_events_per_batch: usize,
    pub test_event_code: Option<String>,
    pub expose_internal_errors: bool,
}

/// Validates, enriches and forwards one inbound batch, with at most one
/// outbound call per batch.
pub struct Pipeline {
    config: PipelineConfig,
    validator: EventValidator,
    enricher: EventEnricher,
    dispatcher: Arc<dyn Dispatcher + Send + Sync>,
    failure_sink: Arc<dyn FailureSink + Send + Sync>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        policies: PolicyTable,
        enricher: EventEnricher,
        dispatcher: Arc<dyn Dispatcher + Send + Sync>,
        failure_sink: Arc<dyn FailureSink + Send + Sync>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            config,
            validator: EventValidator::new(policies),
            enricher,
            dispatcher,
            failure_sink,
            timesource,
        }
    }

    pub fn timesource(&self) -> &Arc<dyn TimeSource + Send + Sync> {
        &self.timesource
    }

    /// Runs a whole request and returns the body to answer with.
    #[instrument(
        skip_all,
        fields(
            client_ip = %ctx.client_ip,
            events = tracing::field::Empty,
            dropped = tracing::field::Empty
        )
    )]
    pub async fn process(&self, request: RelayRequest, ctx: RequestContext) -> Result<Value, RelayError> {
        let start = Instant::now();

        let raw_events = self.check_batch(request.data)?;
        let span = tracing::Span::current();
        span.record("events", raw_events.len());
        counter!("capi_relay_events_received_total").increment(raw_events.len() as u64);
        histogram!("capi_relay_batch_size").record(raw_events.len() as f64);

        if let Some(pixel_id) = request.pixel_id.as_deref() {
            if pixel_id != self.config.pixel_id {
                warn!(
                    requested = pixel_id,
                    "ignoring pixel_id from request, events go to the configured pixel"
                );
            }
        }

        let received = raw_events.len();
        let events = self.prepare(raw_events, &ctx);
        let dropped = received - events.len();
        span.record("dropped", dropped);

        if events.is_empty() {
            return Err(RelayError::InvalidPayload(String::from(
                "no event in the batch passed validation",
            )));
        }

        let batch = OutboundBatch {
            data: events,
            test_event_code: request
                .test_event_code
                .filter(|code| !code.trim().is_empty())
                .or_else(|| self.config.test_event_code.clone()),
        };

        match self.dispatcher.dispatch(&batch).await {
            Ok(result) => {
                debug!(status = %result.status, "batch accepted upstream");
                let metadata = ProxyMetadata {
                    processing_time_ms: start.elapsed().as_millis() as u64,
                    events_processed: result.events_processed,
                    events_dropped: dropped,
                    compression_used: result.compressed,
                    timestamp: self.timesource.current_time(),
                };
                Ok(merge_proxy_metadata(result.body, &metadata))
            }
            Err(e) => {
                error!(
                    events = batch.data.len(),
                    retryable = e.is_retryable(),
                    "failed to dispatch batch: {}",
                    e
                );
                if !matches!(e, DispatchError::Serialization(_)) {
                    self.failure_sink
                        .persist_batch(batch.data, e.to_string())
                        .await;
                }
                Err(self.relay_error(e))
            }
        }
    }

    /// Batch bounds are checked before any per-event work.
    fn check_batch(&self, data: Option<Value>) -> Result<Vec<Value>, RelayError> {
        let events = match data {
            Some(Value::Array(events)) => events,
            Some(_) => {
                return Err(RelayError::InvalidPayload(String::from(
                    "field 'data' must be an array",
                )))
            }
            None => {
                return Err(RelayError::InvalidPayload(String::from(
                    "field 'data' is required",
                )))
            }
        };

        if events.is_empty() {
            return Err(RelayError::EmptyBatch);
        }
        if events.len() > self.config.max_events_per_batch {
            return Err(RelayError::TooManyEvents {
                count: events.len(),
                max: self.config.max_events_per_batch,
            });
        }

        Ok(events)
    }

    fn prepare(&self, raw_events: Vec<Value>, ctx: &RequestContext) -> Vec<EnrichedEvent> {
        let mut dedup = Deduplicator::new();
        let mut enriched = Vec::with_capacity(raw_events.len());
        let fingerprint = ClientFingerprint {
            ip: &ctx.client_ip,
            user_agent: ctx.user_agent.as_deref().unwrap_or_default(),
            now_millis: ctx.now_millis(),
        };

        for (index, value) in raw_events.into_iter().enumerate() {
            let event = match RawEvent::from_value(value) {
                Ok(event) => event,
                Err(e) => {
                    report_dropped(index, &[ValidationError::Malformed(e.to_string())]);
                    continue;
                }
            };

            let (event_type, policy) = match self.validator.validate(&event).into_result() {
                Ok(accepted) => accepted,
                Err(reasons) => {
                    report_dropped(index, &reasons);
                    continue;
                }
            };

            let event_id = match event.event_id.as_deref().map(str::trim) {
                Some(id) if !id.is_empty() => id.to_owned(),
                _ => dedup.assign_id(ctx.now_millis()),
            };
            if !dedup.admit(&event_id) {
                warn!(
                    index,
                    event_id = %event_id,
                    "duplicate event_id in batch, dropping event"
                );
                report_dropped_events("duplicate", 1);
                continue;
            }

            let user_data = pii::hash_user_data(&event.user_data);
            let external_id = external_id::resolve(&event, &user_data, policy.identity, &fingerprint);

            enriched.push(self.enricher.enrich(
                PreparedEvent {
                    event,
                    event_type,
                    policy,
                    event_id,
                    user_data,
                    external_id,
                },
                ctx,
            ));
        }

        enriched
    }

    fn relay_error(&self, error: DispatchError) -> RelayError {
        match error {
            DispatchError::Serialization(message) => {
                RelayError::internal(message, self.config.expose_internal_errors)
            }
            other => other.into(),
        }
    }
}

fn report_dropped(index: usize, reasons: &[ValidationError]) {
    for reason in reasons {
        report_dropped_events(reason.to_metric_tag(), 1);
    }
    let reasons: Vec<String> = reasons.iter().map(ToString::to_string).collect();
    warn!(index, reasons = ?reasons, "dropping event failing validation");
}
