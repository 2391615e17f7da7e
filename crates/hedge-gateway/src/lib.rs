//! Rate-Limited Gateway (spec.md §4.1).
//!
//! Categorizes every outbound exchange call into `clob-general`,
//! `clob-market-data`, `gamma`, `data-api`, or a caller-defined category, and
//! enforces `{max_requests_per_window, window_ms, min_interval_ms,
//! max_retries, base_backoff_ms}` per category. Grounded on the teacher's
//! `arbitrage::rate_limiter::ClobRateLimiter`, generalized from per-second
//! `governor` quotas to windowed per-category quotas plus a minimum
//! inter-request interval, and extended with the retry/backoff and counter
//! contract spec.md requires that the teacher's version does not implement.

mod counters;

pub use counters::CategoryCounters;

use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{
    clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter as Governor,
};
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

type WindowLimiter = Governor<NotKeyed, InMemoryState, DefaultClock>;

/// Per-category configuration (spec.md §4.1 defaults table).
#[derive(Debug, Clone, Copy)]
pub struct CategoryLimit {
    pub max_requests_per_window: u32,
    pub window_ms: u64,
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

impl CategoryLimit {
    #[must_use]
    pub const fn clob_general() -> Self {
        Self {
            max_requests_per_window: 7200,
            window_ms: 10_000,
            min_interval_ms: 2,
            max_retries: 5,
            base_backoff_ms: 250,
        }
    }

    #[must_use]
    pub const fn clob_market_data() -> Self {
        Self {
            max_requests_per_window: 1200,
            window_ms: 10_000,
            min_interval_ms: 9,
            max_retries: 5,
            base_backoff_ms: 250,
        }
    }

    #[must_use]
    pub const fn gamma() -> Self {
        Self {
            max_requests_per_window: 240,
            window_ms: 10_000,
            min_interval_ms: 42,
            max_retries: 5,
            base_backoff_ms: 250,
        }
    }

    #[must_use]
    pub const fn data_api() -> Self {
        Self {
            max_requests_per_window: 120,
            window_ms: 10_000,
            min_interval_ms: 84,
            max_retries: 5,
            base_backoff_ms: 250,
        }
    }
}

/// Signal an upstream error carries about being a rate-limit response
/// (HTTP 429, Cloudflare "1015", or a challenge marker in response
/// metadata — spec.md §4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct RateLimitSignal {
    pub reset_after: Option<Duration>,
}

/// Implemented by each component's leaf error type so the gateway can apply
/// the §4.1 retry-on-429 policy without depending on any specific HTTP
/// client's error type.
pub trait ClassifyGatewayError {
    fn rate_limit_signal(&self) -> Option<RateLimitSignal>;
}

struct CategoryState {
    limit: CategoryLimit,
    window_limiter: Arc<WindowLimiter>,
    interval_limiter: Arc<WindowLimiter>,
    /// FIFO ordering within a category: callers `.lock().await` in arrival
    /// order and the slot is held for the duration of one dispatch attempt.
    fifo_gate: Arc<AsyncMutex<()>>,
    counters: Arc<CategoryCounters>,
}

impl CategoryState {
    fn new(limit: CategoryLimit) -> Self {
        let window_quota = Quota::with_period(Duration::from_millis(
            (limit.window_ms / u64::from(limit.max_requests_per_window)).max(1),
        ))
        .expect("nonzero period")
        .allow_burst(NonZeroU32::new(limit.max_requests_per_window).unwrap_or(NonZeroU32::new(1).unwrap()));
        let interval_quota = Quota::with_period(Duration::from_millis(limit.min_interval_ms.max(1)))
            .expect("nonzero period")
            .allow_burst(NonZeroU32::new(1).unwrap());
        Self {
            limit,
            window_limiter: Arc::new(Governor::direct(window_quota)),
            interval_limiter: Arc::new(Governor::direct(interval_quota)),
            fifo_gate: Arc::new(AsyncMutex::new(())),
            counters: Arc::new(CategoryCounters::default()),
        }
    }
}

/// The Rate-Limited Gateway (spec.md §4.1).
pub struct RateLimitedGateway {
    enabled: bool,
    categories: RwLock<HashMap<String, CategoryState>>,
    defaults: fn(&str) -> Option<CategoryLimit>,
}

fn builtin_default(category: &str) -> Option<CategoryLimit> {
    match category {
        "clob-general" => Some(CategoryLimit::clob_general()),
        "clob-market-data" => Some(CategoryLimit::clob_market_data()),
        "gamma" => Some(CategoryLimit::gamma()),
        "data-api" => Some(CategoryLimit::data_api()),
        _ => None,
    }
}

impl RateLimitedGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            enabled: true,
            categories: RwLock::new(HashMap::new()),
            defaults: builtin_default,
        }
    }

    /// A disabled gateway passes every call through untouched (spec.md
    /// §4.1 "If disabled, passes through").
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Overrides or defines a caller-defined category's limits.
    pub fn configure_category(&self, category: &str, limit: CategoryLimit) {
        self.categories
            .write()
            .insert(category.to_string(), CategoryState::new(limit));
    }

    fn category_state(&self, category: &str) -> Arc<CategoryCounters> {
        // Fast path: already configured.
        if let Some(state) = self.categories.read().get(category) {
            return state.counters.clone();
        }
        let limit = (self.defaults)(category).unwrap_or(CategoryLimit::clob_general());
        let mut guard = self.categories.write();
        let state = guard
            .entry(category.to_string())
            .or_insert_with(|| CategoryState::new(limit));
        state.counters.clone()
    }

    /// Returns `true` once in-window usage for `category` reaches 80% of its
    /// `max_requests_per_window` (spec.md §4.1 `approaching_limit?`).
    #[must_use]
    pub fn approaching_limit(&self, category: &str) -> bool {
        let guard = self.categories.read();
        let Some(state) = guard.get(category) else {
            return false;
        };
        let used = state.counters.requests_in_flight_estimate();
        let threshold = (u64::from(state.limit.max_requests_per_window) * 8) / 10;
        used >= threshold
    }

    #[must_use]
    pub fn counters(&self, category: &str) -> Option<CategoryCounters> {
        self.categories.read().get(category).map(|s| (*s.counters).clone())
    }

    /// The gateway's single entry point (spec.md §4.1 "Contract").
    ///
    /// `f` is called once per attempt; on a detected rate-limit error it is
    /// retried with exponential backoff up to `max_retries`, after which the
    /// final error surfaces. Non-rate-limit errors surface immediately
    /// without retry.
    pub async fn execute<T, E, F, Fut>(&self, category: &str, description: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: ClassifyGatewayError + Send + 'static,
    {
        if !self.enabled {
            return tokio::spawn(f()).await.unwrap_or_else(|e| std::panic::resume_unwind(e.into_panic()));
        }

        // Ensure the category exists and grab what we need without holding
        // the registry lock across the await points below.
        let _ = self.category_state(category);
        let (limit, window_limiter, interval_limiter, fifo_gate, counters) = {
            let guard = self.categories.read();
            let state = guard.get(category).expect("just inserted");
            (
                state.limit,
                state.window_limiter.clone(),
                state.interval_limiter.clone(),
                state.fifo_gate.clone(),
                state.counters.clone(),
            )
        };

        counters.queue_enter();
        let _fifo = fifo_gate.lock().await;
        counters.queue_leave();

        let mut attempt: u32 = 0;
        loop {
            interval_limiter.until_ready().await;
            window_limiter.until_ready().await;

            counters.record_request();
            debug!(category, description, attempt, "gateway dispatching request");
            // Spawned so that a caller who discards the returned future (a
            // `timeout`/`select!` loser) does not cancel the in-flight
            // request: the task keeps running to completion and the slot
            // stays accounted even though nobody awaits this result.
            let result = tokio::spawn(f()).await.unwrap_or_else(|e| std::panic::resume_unwind(e.into_panic()));
            match result {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if let Some(signal) = err.rate_limit_signal() {
                        counters.record_rate_limited();
                        if attempt >= limit.max_retries {
                            warn!(category, description, attempt, "gateway retries exhausted");
                            return Err(err);
                        }
                        let backoff = signal
                            .reset_after
                            .unwrap_or_else(|| Duration::from_millis(limit.base_backoff_ms * 2u64.pow(attempt)));
                        counters.record_retry();
                        warn!(category, description, attempt, backoff_ms = backoff.as_millis() as u64, "rate limited, backing off");
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                        continue;
                    }
                    // Non-rate-limit error: surfaces immediately, no retry.
                    return Err(err);
                }
            }
        }
    }
}

impl Default for RateLimitedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FakeError {
        rate_limited: bool,
    }

    impl ClassifyGatewayError for FakeError {
        fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
            self.rate_limited.then(RateLimitSignal::default)
        }
    }

    #[tokio::test]
    async fn disabled_gateway_passes_through() {
        let gw = RateLimitedGateway::disabled();
        let result: Result<u32, FakeError> = gw.execute("gamma", "noop", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn non_rate_limit_error_does_not_retry() {
        let gw = RateLimitedGateway::new();
        let calls = AtomicU32::new(0);
        let result: Result<u32, FakeError> = gw
            .execute("gamma", "fails", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FakeError { rate_limited: false }) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_error_retries_then_succeeds() {
        let gw = RateLimitedGateway::new();
        gw.configure_category(
            "gamma",
            CategoryLimit {
                max_requests_per_window: 240,
                window_ms: 10_000,
                min_interval_ms: 1,
                max_retries: 5,
                base_backoff_ms: 1,
            },
        );
        let calls = AtomicU32::new(0);
        let result: Result<u32, FakeError> = gw
            .execute("gamma", "flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(FakeError { rate_limited: true })
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_exhausted_surfaces_failure() {
        let gw = RateLimitedGateway::new();
        gw.configure_category(
            "gamma",
            CategoryLimit {
                max_requests_per_window: 240,
                window_ms: 10_000,
                min_interval_ms: 1,
                max_retries: 2,
                base_backoff_ms: 1,
            },
        );
        let result: Result<u32, FakeError> = gw
            .execute("gamma", "always-limited", || async { Err(FakeError { rate_limited: true }) })
            .await;
        assert!(result.is_err());
        let counters = gw.counters("gamma").unwrap();
        assert_eq!(counters.retries(), 2);
    }
}
