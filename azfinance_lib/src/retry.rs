//! Retry policy with exponential backoff, shared by every network call site.
//!
//! The policy only decides *when* to wait; *whether* an error is worth
//! retrying is a predicate supplied by the caller, so the same object serves
//! store writes, filing-source pages and entity pre-creation.

use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::config::{env_u64, env_usize};

/// Exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `0.8..1.2`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: true,
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_usize("AZFINANCE_RETRY_MAX", defaults.max_retries),
            base_delay: Duration::from_millis(env_u64(
                "AZFINANCE_RETRY_BASE_MS",
                defaults.base_delay.as_millis() as u64,
            )),
            max_delay: Duration::from_millis(env_u64(
                "AZFINANCE_RETRY_MAX_MS",
                defaults.max_delay.as_millis() as u64,
            )),
            jitter: true,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`, then jittered.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let shift = (attempt.saturating_sub(1)).min(30) as u32;
        let exp = 1u64 << shift;
        let base = (self.base_delay.as_millis() as u64)
            .saturating_mul(exp)
            .min(self.max_delay.as_millis() as u64);
        if !self.jitter {
            return Duration::from_millis(base);
        }
        let jitter = rand::thread_rng().gen_range(0.8..1.2);
        Duration::from_millis((base as f64 * jitter) as u64)
    }

    /// Runs `f` until it succeeds, returns a non-retryable error, or the retry
    /// budget is spent. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        label: &str,
        tracker: &RequestTracker,
        is_retryable: P,
        mut f: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0usize;
        loop {
            match f().await {
                Ok(value) => {
                    tracker.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    attempt += 1;
                    if !is_retryable(&err) {
                        tracker.record_failure();
                        tracing::error!("{} failed without retry: {}", label, err);
                        return Err(err);
                    }
                    if attempt > self.max_retries {
                        tracker.record_failure();
                        tracing::error!(
                            "{} failed after {} attempts: {}",
                            label,
                            attempt,
                            err
                        );
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    tracker.record_retry(delay);
                    tracing::warn!(
                        "{} failed (attempt {}/{}), retrying in {:.1}s: {}",
                        label,
                        attempt,
                        self.max_retries,
                        delay.as_secs_f64(),
                        err
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Atomic counters tracking request outcomes across all workers.
#[derive(Debug, Default)]
pub struct RequestTracker {
    requests_made: AtomicU64,
    requests_succeeded: AtomicU64,
    requests_retried: AtomicU64,
    requests_failed: AtomicU64,
    /// Cumulative backoff time in milliseconds.
    total_backoff_ms: AtomicU64,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.requests_made.fetch_add(1, Ordering::Relaxed);
        self.requests_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self, backoff: Duration) {
        self.requests_made.fetch_add(1, Ordering::Relaxed);
        self.requests_retried.fetch_add(1, Ordering::Relaxed);
        self.total_backoff_ms
            .fetch_add(backoff.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.requests_made.fetch_add(1, Ordering::Relaxed);
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the current counters.
    pub fn summary(&self) -> TrackerSummary {
        TrackerSummary {
            requests_made: self.requests_made.load(Ordering::Relaxed),
            requests_succeeded: self.requests_succeeded.load(Ordering::Relaxed),
            requests_retried: self.requests_retried.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            total_backoff_secs: self.total_backoff_ms.load(Ordering::Relaxed) as f64 / 1000.0,
        }
    }
}

/// Immutable snapshot of tracker counters for display.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TrackerSummary {
    pub requests_made: u64,
    pub requests_succeeded: u64,
    pub requests_retried: u64,
    pub requests_failed: u64,
    pub total_backoff_secs: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    fn transient(e: &TestError) -> bool {
        matches!(e, TestError::Transient)
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(1)).without_jitter()
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1000), Duration::from_millis(3000))
            .without_jitter();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(3000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(3000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000), Duration::from_secs(30));
        for _ in 0..50 {
            let d = policy.delay_for_attempt(1).as_millis();
            assert!((800..=1200).contains(&d), "delay {} out of band", d);
        }
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let policy = fast();
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let tracker = RequestTracker::new();
        let result = fast()
            .run("test", &tracker, transient, || async { Ok::<_, TestError>(42) })
            .await;
        assert_eq!(result.unwrap(), 42);
        let summary = tracker.summary();
        assert_eq!(summary.requests_made, 1);
        assert_eq!(summary.requests_succeeded, 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        tokio::time::pause();
        let tracker = RequestTracker::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);

        let result = fast()
            .run("test", &tracker, transient, move || {
                let calls = Arc::clone(&calls_clone);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let summary = tracker.summary();
        assert_eq!(summary.requests_retried, 2);
        assert_eq!(summary.requests_succeeded, 1);
        assert!((summary.total_backoff_secs - 0.3).abs() < 0.01);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let tracker = RequestTracker::new();
        let calls = AtomicUsize::new(0);
        let result = fast()
            .run("test", &tracker, transient, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>(TestError::Fatal) }
            })
            .await;
        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.summary().requests_failed, 1);
    }

    #[tokio::test]
    async fn exhausts_budget() {
        tokio::time::pause();
        let tracker = RequestTracker::new();
        let calls = AtomicUsize::new(0);
        let result = fast()
            .run("test", &tracker, transient, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>(TestError::Transient) }
            })
            .await;
        assert!(matches!(result, Err(TestError::Transient)));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let summary = tracker.summary();
        assert_eq!(summary.requests_retried, 3);
        assert_eq!(summary.requests_failed, 1);
    }
}
