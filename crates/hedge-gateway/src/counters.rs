//! Per-category counters (spec.md §4.1: `{requests, rate_limited, retries,
//! queue_length}`).

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct CategoryCounters {
    requests: AtomicU64,
    rate_limited: AtomicU64,
    retries: AtomicU64,
    queue_length: AtomicU64,
}

impl Clone for CategoryCounters {
    fn clone(&self) -> Self {
        Self {
            requests: AtomicU64::new(self.requests.load(Ordering::Relaxed)),
            rate_limited: AtomicU64::new(self.rate_limited.load(Ordering::Relaxed)),
            retries: AtomicU64::new(self.retries.load(Ordering::Relaxed)),
            queue_length: AtomicU64::new(self.queue_length.load(Ordering::Relaxed)),
        }
    }
}

impl CategoryCounters {
    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queue_enter(&self) {
        self.queue_length.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn queue_leave(&self) {
        self.queue_length.fetch_sub(1, Ordering::Relaxed);
    }

    /// Approximation used by `approaching_limit?`: total requests issued so
    /// far. Combined with the governor window limiter this is a reasonable
    /// proxy for "close to using up the window" without duplicating
    /// governor's internal state tracking.
    #[must_use]
    pub fn requests_in_flight_estimate(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rate_limited(&self) -> u64 {
        self.rate_limited.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queue_length(&self) -> u64 {
        self.queue_length.load(Ordering::Relaxed)
    }
}
