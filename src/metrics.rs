//! Process-wide counters for both ingestion paths.
//! Cheap relaxed atomics; read with [`snapshot`].
use std::sync::atomic::{AtomicU64, Ordering};

static RADIO_DUPLICATES: AtomicU64 = AtomicU64::new(0);
static BROKER_DUPLICATES: AtomicU64 = AtomicU64::new(0);
static RADIO_RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static BROKER_RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static RADIO_PACKETS: AtomicU64 = AtomicU64::new(0);
static BROKER_PACKETS: AtomicU64 = AtomicU64::new(0);
static DECODE_FAILURES: AtomicU64 = AtomicU64::new(0);
static RADIO_SENT: AtomicU64 = AtomicU64::new(0);
static BROKER_SENT: AtomicU64 = AtomicU64::new(0);
static HEARTBEAT_FAILURES: AtomicU64 = AtomicU64::new(0);

pub fn inc_radio_duplicate() {
    RADIO_DUPLICATES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_broker_duplicate() {
    BROKER_DUPLICATES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_radio_reconnect_attempt() {
    RADIO_RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_broker_reconnect_attempt() {
    BROKER_RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_radio_packet() {
    RADIO_PACKETS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_broker_packet() {
    BROKER_PACKETS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_decode_failure() {
    DECODE_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_radio_sent() {
    RADIO_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_broker_sent() {
    BROKER_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_heartbeat_failure() {
    HEARTBEAT_FAILURES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub radio_packets: u64,
    pub broker_packets: u64,
    pub radio_duplicates: u64,
    pub broker_duplicates: u64,
    pub radio_reconnect_attempts: u64,
    pub broker_reconnect_attempts: u64,
    pub decode_failures: u64,
    pub radio_sent: u64,
    pub broker_sent: u64,
    pub heartbeat_failures: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        radio_packets: RADIO_PACKETS.load(Ordering::Relaxed),
        broker_packets: BROKER_PACKETS.load(Ordering::Relaxed),
        radio_duplicates: RADIO_DUPLICATES.load(Ordering::Relaxed),
        broker_duplicates: BROKER_DUPLICATES.load(Ordering::Relaxed),
        radio_reconnect_attempts: RADIO_RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        broker_reconnect_attempts: BROKER_RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        decode_failures: DECODE_FAILURES.load(Ordering::Relaxed),
        radio_sent: RADIO_SENT.load(Ordering::Relaxed),
        broker_sent: BROKER_SENT.load(Ordering::Relaxed),
        heartbeat_failures: HEARTBEAT_FAILURES.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Counters are global and other tests bump them concurrently; only check monotonicity.
    #[test]
    fn counters_are_monotonic() {
        let before = snapshot();
        inc_radio_duplicate();
        inc_broker_sent();
        inc_decode_failure();
        let after = snapshot();
        assert!(after.radio_duplicates > before.radio_duplicates);
        assert!(after.broker_sent > before.broker_sent);
        assert!(after.decode_failures > before.decode_failures);
    }
}
