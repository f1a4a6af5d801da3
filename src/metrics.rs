//! Process-wide counters for the collector pipeline. Updated from the
//! acquisition and decoder hot paths, so every field is atomic; no
//! lock is taken to record a sample.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

pub struct Metrics {
    pub start_time: SystemTime,
    bytes_drained_total: AtomicU64,
    jobs_decoded_total: AtomicU64,
    guest_pcs_logged_total: AtomicU64,
    ring_backpressure_stalls: AtomicU64,
    unknown_packets_total: AtomicU64,
    reserved_packets_total: AtomicU64,
    address_map_misses_total: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: SystemTime::now(),
            bytes_drained_total: AtomicU64::new(0),
            jobs_decoded_total: AtomicU64::new(0),
            guest_pcs_logged_total: AtomicU64::new(0),
            ring_backpressure_stalls: AtomicU64::new(0),
            unknown_packets_total: AtomicU64::new(0),
            reserved_packets_total: AtomicU64::new(0),
            address_map_misses_total: AtomicU64::new(0),
        }
    }

    pub fn add_bytes_drained(&self, n: u64) {
        self.bytes_drained_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_drained(&self) -> u64 {
        self.bytes_drained_total.load(Ordering::Relaxed)
    }

    pub fn inc_jobs_decoded(&self) {
        self.jobs_decoded_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn jobs_decoded(&self) -> u64 {
        self.jobs_decoded_total.load(Ordering::Relaxed)
    }

    pub fn add_guest_pcs_logged(&self, n: u64) {
        self.guest_pcs_logged_total.fetch_add(n, Ordering::Relaxed);
    }

    pub fn guest_pcs_logged(&self) -> u64 {
        self.guest_pcs_logged_total.load(Ordering::Relaxed)
    }

    /// Bumped once each time the acquisition thread finds the Staging
    /// Ring without headroom and must wait before draining the aux
    /// ring (§4.B "backpressure primitive").
    pub fn inc_ring_backpressure_stall(&self) {
        self.ring_backpressure_stalls
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn ring_backpressure_stalls(&self) -> u64 {
        self.ring_backpressure_stalls.load(Ordering::Relaxed)
    }

    pub fn inc_unknown_packet(&self) {
        self.unknown_packets_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn unknown_packets(&self) -> u64 {
        self.unknown_packets_total.load(Ordering::Relaxed)
    }

    pub fn inc_reserved_packet(&self) {
        self.reserved_packets_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reserved_packets(&self) -> u64 {
        self.reserved_packets_total.load(Ordering::Relaxed)
    }

    pub fn inc_address_map_miss(&self) {
        self.address_map_misses_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn address_map_misses(&self) -> u64 {
        self.address_map_misses_total.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let m = Metrics::new();
        m.add_bytes_drained(4096);
        m.inc_jobs_decoded();
        m.inc_jobs_decoded();
        m.add_guest_pcs_logged(3);
        m.inc_ring_backpressure_stall();
        m.inc_unknown_packet();

        assert_eq!(m.bytes_drained(), 4096);
        assert_eq!(m.jobs_decoded(), 2);
        assert_eq!(m.guest_pcs_logged(), 3);
        assert_eq!(m.ring_backpressure_stalls(), 1);
        assert_eq!(m.unknown_packets(), 1);
        assert_eq!(m.reserved_packets(), 0);
    }
}
