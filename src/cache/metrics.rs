//! Cache Metrics Collection
//!
//! Event counters for monitoring cache health.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Verification metrics
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_failures: AtomicU64,
    malformed_requests: AtomicU64,

    // Slot metrics
    initializations: AtomicU64,
    initialization_failures: AtomicU64,
    reservations: AtomicU64,
    releases: AtomicU64,
    resorts: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_initialization(&self) {
        self.initializations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_initialization_failure(&self) {
        self.initialization_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reservation(&self) {
        self.reservations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resort(&self) {
        self.resorts.fetch_add(1, Ordering::Relaxed);
    }

    /// Hit ratio over all verification lookups
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let total = hits + self.misses.load(Ordering::Relaxed) as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            malformed_requests: self.malformed_requests.load(Ordering::Relaxed),
            initializations: self.initializations.load(Ordering::Relaxed),
            initialization_failures: self.initialization_failures.load(Ordering::Relaxed),
            reservations: self.reservations.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            resorts: self.resorts.load(Ordering::Relaxed),
            hit_ratio: self.hit_ratio(),
        }
    }
}

/// Snapshot of cache metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetch_failures: u64,
    pub malformed_requests: u64,
    pub initializations: u64,
    pub initialization_failures: u64,
    pub reservations: u64,
    pub releases: u64,
    pub resorts: u64,
    pub hit_ratio: f64,
}

impl CacheStats {
    /// Counters as `(name, value)` pairs, for exposition.
    pub fn counters(&self) -> [(&'static str, u64); 9] {
        [
            ("hits", self.hits),
            ("misses", self.misses),
            ("fetch_failures", self.fetch_failures),
            ("malformed_requests", self.malformed_requests),
            ("initializations", self.initializations),
            ("initialization_failures", self.initialization_failures),
            ("reservations", self.reservations),
            ("releases", self.releases),
            ("resorts", self.resorts),
        ]
    }
}
