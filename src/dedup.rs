//! Time-bounded packet identifier window.
//!
//! Each ingestion path owns its own window. An identifier is reported as new at most
//! once per TTL; the map is pruned of expired entries only when it grows past the
//! path's threshold so the hot path stays a single hash lookup.

use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// How long a packet identifier is remembered.
pub const DEDUP_TTL: Duration = Duration::from_secs(10 * 60);
/// Prune threshold for the radio-side window.
pub const RADIO_PRUNE_THRESHOLD: usize = 5_000;
/// Prune threshold for the broker-side window.
pub const BROKER_PRUNE_THRESHOLD: usize = 10_000;

#[derive(Debug)]
pub struct DedupWindow {
    expiries: HashMap<u32, Instant>,
    ttl: Duration,
    prune_threshold: usize,
}

impl DedupWindow {
    pub fn new(ttl: Duration, prune_threshold: usize) -> Self {
        Self {
            expiries: HashMap::new(),
            ttl,
            prune_threshold,
        }
    }

    pub fn for_radio() -> Self {
        Self::new(DEDUP_TTL, RADIO_PRUNE_THRESHOLD)
    }

    pub fn for_broker() -> Self {
        Self::new(DEDUP_TTL, BROKER_PRUNE_THRESHOLD)
    }

    /// Record `id` as seen at `now`. Returns `true` when the id is new (or its previous
    /// sighting has expired) and the packet should be delivered.
    pub fn check_and_insert(&mut self, id: u32, now: Instant) -> bool {
        if let Some(expiry) = self.expiries.get(&id) {
            if *expiry > now {
                return false;
            }
        }
        self.expiries.insert(id, now + self.ttl);
        if self.expiries.len() > self.prune_threshold {
            self.prune(now);
        }
        true
    }

    /// Mark an id as already delivered without asking (used for our own outbound packets).
    pub fn remember(&mut self, id: u32, now: Instant) {
        self.expiries.insert(id, now + self.ttl);
    }

    /// Drop every entry whose expiry has passed. Returns the number removed.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.expiries.len();
        self.expiries.retain(|_, expiry| *expiry > now);
        before - self.expiries.len()
    }

    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }

    pub fn clear(&mut self) {
        self.expiries.clear();
    }
}
