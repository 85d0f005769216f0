use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::event::EnrichedEvent;
use crate::time::TimeSource;

/// One line of the failure log. Written once, never updated in place: an
/// offline job re-reads the log and bumps `retry_count` in its own output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEventRecord {
    pub timestamp: String,
    pub event: EnrichedEvent,
    pub error: String,
    pub retry_count: u32,
}

/// Best-effort persistence of events that could not be delivered.
/// Implementations log their own failures and never return them.
#[async_trait]
pub trait FailureSink {
    async fn persist_batch(&self, events: Vec<EnrichedEvent>, error: String);

    async fn persist(&self, event: EnrichedEvent, error: String) {
        self.persist_batch(vec![event], error).await
    }
}

/// Used when no failure log is configured.
pub struct NoopFailureSink {}

#[async_trait]
impl FailureSink for NoopFailureSink {
    async fn persist_batch(&self, events: Vec<EnrichedEvent>, error: String) {
        warn!(
            events = events.len(),
            error = %error,
            "no failure log configured, undelivered events are lost"
        );
        counter!("capi_relay_events_lost_total").increment(events.len() as u64);
    }
}

/// Appends newline-delimited JSON records to a local file. Once the file is
/// over `max_bytes`, it is truncated before the next append: old records are
/// lost, not archived.
#[derive(Clone)]
pub struct FileFailureSink {
    path: PathBuf,
    max_bytes: u64,
    timesource: Arc<dyn TimeSource + Send + Sync>,
    write_lock: Arc<Mutex<()>>,
}

impl FileFailureSink {
    pub fn new(
        path: impl Into<PathBuf>,
        max_bytes: u64,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            timesource,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(&self, events: Vec<EnrichedEvent>, error: &str) -> Vec<u8> {
        let timestamp = self.timesource.current_time();
        let mut buffer = Vec::new();

        for event in events {
            let record = FailedEventRecord {
                timestamp: timestamp.clone(),
                event,
                error: error.to_owned(),
                retry_count: 0,
            };
            match serde_json::to_vec(&record) {
                Ok(line) => {
                    buffer.extend_from_slice(&line);
                    buffer.push(b'\n');
                }
                Err(e) => {
                    error!("failed to encode failed event record: {}", e);
                    counter!("capi_relay_failure_sink_errors_total").increment(1);
                }
            }
        }

        buffer
    }
}

#[async_trait]
impl FailureSink for FileFailureSink {
    async fn persist_batch(&self, events: Vec<EnrichedEvent>, error: String) {
        if events.is_empty() {
            return;
        }
        let count = events.len();
        let buffer = self.encode(events, &error);

        let path = self.path.clone();
        let max_bytes = self.max_bytes;
        let write_lock = self.write_lock.clone();

        let result = tokio::task::spawn_blocking(move || {
            let _guard = write_lock.lock().unwrap_or_else(PoisonError::into_inner);
            append_with_rotation(&path, max_bytes, &buffer)
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!(events = count, "persisted undelivered events for later retry");
                counter!("capi_relay_events_persisted_total").increment(count as u64);
            }
            Ok(Err(e)) => {
                error!(path = %self.path.display(), "failed to persist undelivered events: {}", e);
                counter!("capi_relay_failure_sink_errors_total").increment(1);
            }
            Err(e) => {
                error!("failure sink task panicked: {}", e);
                counter!("capi_relay_failure_sink_errors_total").increment(1);
            }
        }
    }
}

fn append_with_rotation(path: &Path, max_bytes: u64, buffer: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    if let Ok(metadata) = fs::metadata(path) {
        if metadata.len() > max_bytes {
            warn!(
                path = %path.display(),
                size = metadata.len(),
                "failure log over its size limit, truncating"
            );
            OpenOptions::new().write(true).truncate(true).open(path)?;
        }
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(buffer)?;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::OutboundUserData;
    use crate::time::FixedTime;
    use serde_json::Map;
    use time::macros::datetime;

    fn clock() -> Arc<dyn TimeSource + Send + Sync> {
        Arc::new(FixedTime {
            time: datetime!(2024-05-01 12:30:00 UTC),
        })
    }

    fn event(id: &str) -> EnrichedEvent {
        EnrichedEvent {
            event_name: String::from("Lead"),
            event_id: id.to_owned(),
            event_time: 1_714_566_600,
            event_source_url: None,
            action_source: String::from("website"),
            user_data: OutboundUserData::default(),
            custom_data: Map::new(),
        }
    }

    fn read_records(path: &Path) -> Vec<FailedEventRecord> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn appends_one_record_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_events.ndjson");
        let sink = FileFailureSink::new(&path, 1024 * 1024, clock());

        sink.persist_batch(vec![event("a"), event("b")], String::from("timeout"))
            .await;
        sink.persist(event("c"), String::from("upstream 500")).await;

        let records = read_records(&path);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].event.event_id, "a");
        assert_eq!(records[0].error, "timeout");
        assert_eq!(records[0].retry_count, 0);
        assert_eq!(records[0].timestamp, "2024-05-01T12:30:00Z");
        assert_eq!(records[2].error, "upstream 500");
    }

    #[tokio::test]
    async fn truncates_once_over_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_events.ndjson");
        fs::write(&path, vec![b'x'; 600]).unwrap();
        let sink = FileFailureSink::new(&path, 512, clock());

        sink.persist(event("fresh"), String::from("timeout")).await;

        let records = read_records(&path);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.event_id, "fresh");
    }

    #[tokio::test]
    async fn keeps_appending_under_the_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failed_events.ndjson");
        let sink = FileFailureSink::new(&path, 1024 * 1024, clock());

        sink.persist(event("one"), String::from("timeout")).await;
        sink.persist(event("two"), String::from("timeout")).await;

        assert_eq!(read_records(&path).len(), 2);
    }

    #[tokio::test]
    async fn creates_missing_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/dir/failed.ndjson");
        let sink = FileFailureSink::new(&path, 1024, clock());

        sink.persist(event("a"), String::from("timeout")).await;

        assert_eq!(read_records(sink.path()).len(), 1);
    }

    #[tokio::test]
    async fn write_errors_are_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // a directory cannot be opened for appending
        let sink = FileFailureSink::new(dir.path(), 1024, clock());

        sink.persist(event("a"), String::from("timeout")).await;
    }
}
