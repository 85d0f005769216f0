//! Per-client admission control for the relay endpoint.
//!
//! Every client address gets a sliding window of request timestamps. A request is
//! admitted while fewer than `limit` requests were admitted during the trailing
//! `window`. The table of tracked addresses is bounded: once it holds more than
//! `max_clients` entries, the address inserted first is forgotten, whatever its
//! recent activity.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use metrics::gauge;
use rand::Rng;

#[derive(Clone)]
pub struct ClientRateLimiter {
    windows: Arc<DashMap<String, VecDeque<Instant>>>,
    insertion_order: Arc<Mutex<VecDeque<String>>>,
    limit: usize,
    window: Duration,
    max_clients: usize,
}

impl ClientRateLimiter {
    pub fn new(limit: usize, window: Duration, max_clients: usize) -> Self {
        ClientRateLimiter {
            windows: Arc::new(DashMap::new()),
            insertion_order: Arc::new(Mutex::new(VecDeque::new())),
            limit,
            window,
            max_clients,
        }
    }

    pub fn admit(&self, client: &str) -> bool {
        self.admit_at(client, Instant::now())
    }

    /// The prune, check and record steps run under the map's entry lock, so
    /// concurrent requests from one address cannot race past the limit.
    pub fn admit_at(&self, client: &str, now: Instant) -> bool {
        let mut inserted = false;
        let admitted = {
            let mut timestamps = self
                .windows
                .entry(client.to_owned())
                .or_insert_with(|| {
                    inserted = true;
                    VecDeque::new()
                });

            prune(&mut timestamps, now, self.window);
            if timestamps.len() >= self.limit {
                false
            } else {
                timestamps.push_back(now);
                true
            }
        };

        if inserted {
            self.track_insertion(client);
        }

        admitted
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }

    fn track_insertion(&self, client: &str) {
        let mut order = self
            .insertion_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        order.push_back(client.to_owned());

        while order.len() > self.max_clients {
            if let Some(oldest) = order.pop_front() {
                self.windows.remove(&oldest);
            }
        }
    }

    /// Drops addresses whose whole window is stale.
    pub fn retain_recent(&self, now: Instant) {
        self.windows.retain(|_, timestamps| {
            prune(timestamps, now, self.window);
            !timestamps.is_empty()
        });

        let mut order = self
            .insertion_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut seen = HashSet::new();
        order.retain(|client| self.windows.contains_key(client) && seen.insert(client.clone()));
    }

    /// Reports the number of tracked addresses to prometheus every 10 seconds,
    /// needs to be spawned in a separate task.
    pub async fn report_metrics(&self) {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(10));
        loop {
            interval.tick().await;
            gauge!("capi_relay_rate_limiter_tracked_clients").set(self.tracked_clients() as f64);
        }
    }

    /// Forget idle addresses about once per window, with some jitter so that
    /// replicas do not all sweep at the same time.
    pub async fn clean_state(&self) {
        let base = self.window.as_secs().max(1);
        let interval_secs = rand::thread_rng().gen_range(base..base + 10);

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
        loop {
            interval.tick().await;
            self.retain_recent(Instant::now());
        }
    }
}

fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(oldest) = timestamps.front() {
        if now.saturating_duration_since(*oldest) >= window {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}
