use std::collections::HashSet;

use rand::distributions::{Distribution, Uniform};

const EVENT_ID_PREFIX: &str = "evt";
const SUFFIX_LEN: usize = 8;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Tracks event ids seen in one batch. Uniqueness is batch-scoped only:
/// nothing is remembered across requests.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: HashSet<String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already admitted in this batch.
    pub fn admit(&mut self, event_id: &str) -> bool {
        self.seen.insert(event_id.to_owned())
    }

    /// Generates `evt_<unix millis>_<random base36>`, retrying on the
    /// (unlikely) collision with an id already present in the batch.
    pub fn assign_id(&self, now_millis: i64) -> String {
        loop {
            let candidate = format!("{EVENT_ID_PREFIX}_{now_millis}_{}", random_suffix());
            if !self.seen.contains(&candidate) {
                return candidate;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn random_suffix() -> String {
    let range = Uniform::from(0..BASE36.len());
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| BASE36[range.sample(&mut rng)] as char)
        .collect()
}
