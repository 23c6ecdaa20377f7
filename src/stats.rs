//! Query counters.
//!
//! Counters are kept locally so an admin surface can read them, and every
//! increment is mirrored to the `metrics` facade for whatever recorder the
//! binary installs.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use metrics::increment_counter;
use serde::Serialize;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_queries: u64,
    pub answered_locally: u64,
    pub cache_hits: u64,
    pub forwarded: u64,
    pub forward_failures: u64,
    pub server_start_time: DateTime<Utc>,
}

/// Query counters shared by all handlers.
#[derive(Debug)]
pub struct Stats {
    total_queries: AtomicU64,
    answered_locally: AtomicU64,
    cache_hits: AtomicU64,
    forwarded: AtomicU64,
    forward_failures: AtomicU64,
    started_at: DateTime<Utc>,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_queries: AtomicU64::new(0),
            answered_locally: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            forward_failures: AtomicU64::new(0),
            started_at: Utc::now(),
        }
    }

    pub fn record_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dns_queries_total");
    }

    pub fn record_local_answer(&self) {
        self.answered_locally.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dns_local_answers_total");
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dns_cache_hits_total");
    }

    pub fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dns_forwarded_total");
    }

    pub fn record_forward_failure(&self) {
        self.forward_failures.fetch_add(1, Ordering::Relaxed);
        increment_counter!("dns_forward_failures_total");
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            answered_locally: self.answered_locally.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            forward_failures: self.forward_failures.load(Ordering::Relaxed),
            server_start_time: self.started_at,
        }
    }
}
