use fieldx::fxstruct;
use serde::Deserialize;
use serde::Serialize;
use std::time::Duration;

/// Bounded exponential backoff for retryable data source failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries on top of the first attempt.
    pub max_retries:     u32,
    pub initial_backoff: Duration,
    pub max_backoff:     Duration,
    pub multiplier:      u32,
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            max_retries:     0,
            initial_backoff: Duration::ZERO,
            max_backoff:     Duration::ZERO,
            multiplier:      1,
        }
    }

    pub const fn new(max_retries: u32, initial_backoff: Duration) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff: Duration::from_secs(5),
            multiplier: 2,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(self.multiplier.saturating_pow(retry))
            .min(self.max_backoff)
    }

    #[inline]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}

/// Engine configuration.
///
/// ```
/// use std::time::Duration;
/// use swr_cache::config::EngineConfig;
///
/// let config = EngineConfig::builder()
///     .name("todos".to_string())
///     .stale_time(Duration::from_secs(60))
///     .build()
///     .unwrap();
/// assert_eq!(config.stale_time(), Duration::from_secs(60));
/// ```
#[derive(Clone, Debug)]
#[fxstruct(no_new, builder, get(copy))]
pub struct EngineConfig {
    /// Used as a log prefix and to name the retention cache.
    #[fieldx(get(clone), default(String::from("swr-cache")))]
    name: String,

    /// How long a query result counts as fresh unless the query overrides it.
    #[fieldx(default(Duration::from_secs(30)))]
    stale_time: Duration,

    /// How long an unobserved query entry survives before it gets evicted.
    #[fieldx(default(Duration::from_secs(300)))]
    gc_time: Duration,

    /// Upper bound on unobserved entries retained at once. Least recently released go first.
    #[fieldx(default(1_000))]
    max_retained_queries: u64,

    #[fieldx(default(RetryPolicy::default()))]
    fetch_retry: RetryPolicy,

    /// Used by mutations that don't bring their own policy.
    #[fieldx(default(RetryPolicy::default()))]
    mutation_retry: RetryPolicy,

    /// Period of the background TTL and eviction sweep.
    #[fieldx(default(Duration::from_secs(5)))]
    sweep_interval: Duration,
}

impl EngineConfig {
    /// All defaults.
    pub fn standard() -> Self {
        Self::builder().build().unwrap()
    }
}
