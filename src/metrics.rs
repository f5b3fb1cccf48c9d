//! Named gauges and counters
//!
//! The server only records values; exporting them is left to whatever scrapes
//! `GET /metrics`.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

// ============================================================================
// Metric names
// ============================================================================

pub const GAUGE_FILES_TOTAL: &str = "files_total";
pub const GAUGE_FILES_TOTAL_SIZE: &str = "files_total_size";
pub const GAUGE_FILES_TOTAL_COLD: &str = "files_total_cold";
pub const GAUGE_FILES_TOTAL_SIZE_COLD: &str = "files_total_size_cold";
pub const GAUGE_CURRENT_DOWNLOADS: &str = "current_downloads";
pub const GAUGE_QUEUED_REQUESTS: &str = "queued_requests";
pub const GAUGE_ACTIVE_REQUESTS: &str = "active_requests";

pub const COUNTER_DOWNLOAD_REQUESTS: &str = "download_requests_total";
pub const COUNTER_REQUESTED_BYTES: &str = "requested_bytes_total";
pub const COUNTER_BYTES_SERVED: &str = "bytes_served_total";
pub const COUNTER_HOT_HITS: &str = "cache_hits_total";
pub const COUNTER_COLD_HITS: &str = "cold_hits_total";
pub const COUNTER_ORIGIN_FETCHES: &str = "origin_fetches_total";
pub const COUNTER_MISSES: &str = "cache_misses_total";
pub const COUNTER_TOUCHES_APPLIED: &str = "touches_applied_total";
pub const COUNTER_TOUCHES_DEBOUNCED: &str = "touches_debounced_total";
pub const COUNTER_FILES_EVICTED: &str = "files_evicted_total";

const GAUGES: &[&str] = &[
    GAUGE_FILES_TOTAL,
    GAUGE_FILES_TOTAL_SIZE,
    GAUGE_FILES_TOTAL_COLD,
    GAUGE_FILES_TOTAL_SIZE_COLD,
    GAUGE_CURRENT_DOWNLOADS,
    GAUGE_QUEUED_REQUESTS,
    GAUGE_ACTIVE_REQUESTS,
];

const COUNTERS: &[&str] = &[
    COUNTER_DOWNLOAD_REQUESTS,
    COUNTER_REQUESTED_BYTES,
    COUNTER_BYTES_SERVED,
    COUNTER_HOT_HITS,
    COUNTER_COLD_HITS,
    COUNTER_ORIGIN_FETCHES,
    COUNTER_MISSES,
    COUNTER_TOUCHES_APPLIED,
    COUNTER_TOUCHES_DEBOUNCED,
    COUNTER_FILES_EVICTED,
];

// ============================================================================
// Registry
// ============================================================================

/// Fixed set of gauges and counters, registered up front so updates are a
/// single atomic op with no map mutation.
pub struct Metrics {
    gauges: BTreeMap<&'static str, AtomicI64>,
    counters: BTreeMap<&'static str, AtomicU64>,
}

/// Point-in-time copy of all metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub gauges: BTreeMap<String, i64>,
    pub counters: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            gauges: GAUGES.iter().map(|name| (*name, AtomicI64::new(0))).collect(),
            counters: COUNTERS.iter().map(|name| (*name, AtomicU64::new(0))).collect(),
        }
    }

    pub fn set_gauge(&self, name: &str, value: i64) {
        if let Some(g) = self.gauges.get(name) {
            g.store(value, Ordering::Relaxed);
        }
    }

    pub fn inc_gauge(&self, name: &str) {
        if let Some(g) = self.gauges.get(name) {
            g.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dec_gauge(&self, name: &str) {
        if let Some(g) = self.gauges.get(name) {
            g.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn inc_counter(&self, name: &str) {
        self.add_counter(name, 1);
    }

    pub fn add_counter(&self, name: &str, value: u64) {
        if let Some(c) = self.counters.get(name) {
            c.fetch_add(value, Ordering::Relaxed);
        }
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            gauges: self
                .gauges
                .iter()
                .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed)))
                .collect(),
            counters: self
                .counters
                .iter()
                .map(|(k, v)| (k.to_string(), v.load(Ordering::Relaxed)))
                .collect(),
        }
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
    fn test_gauges_and_counters() {
        let metrics = Metrics::new();
        metrics.inc_gauge(GAUGE_CURRENT_DOWNLOADS);
        metrics.inc_gauge(GAUGE_CURRENT_DOWNLOADS);
        metrics.dec_gauge(GAUGE_CURRENT_DOWNLOADS);
        metrics.set_gauge(GAUGE_FILES_TOTAL, 42);
        metrics.add_counter(COUNTER_BYTES_SERVED, 1024);

        assert_eq!(metrics.gauge(GAUGE_CURRENT_DOWNLOADS), 1);
        assert_eq!(metrics.gauge(GAUGE_FILES_TOTAL), 42);
        assert_eq!(metrics.counter(COUNTER_BYTES_SERVED), 1024);

        // Unknown names are ignored
        metrics.inc_counter("nope");
        assert_eq!(metrics.counter("nope"), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.gauges["files_total"], 42);
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"bytes_served_total\":1024"));
    }
}
