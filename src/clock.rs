// =============================================================================
// Clock — monotonic time + sleep, injectable for tests
// =============================================================================
//
// The heartbeat loop, rate limiter, and circuit breaker all need "now" and
// "sleep until". Routing both through a trait lets tests drive time
// deterministically instead of sleeping for real.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Time source used throughout the coordinator.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64 {
        self.now().timestamp_millis()
    }

    /// Suspend the caller for `d`. Must be cancellation-safe: callers rely on
    /// this being wrapped in `tokio::select!` with a shutdown signal.
    async fn sleep(&self, d: Duration);
}

/// Real system clock backed by `tokio::time`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, d: Duration) {
        tokio::time::sleep(d).await;
    }
}

/// Deterministic clock for tests: `now()` is controlled explicitly and
/// `sleep` returns immediately while advancing the virtual clock.
#[derive(Debug, Clone)]
pub struct TestClock {
    millis: Arc<AtomicI64>,
}

impl TestClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            millis: Arc::new(AtomicI64::new(start_ms)),
        }
    }

    pub fn advance(&self, d: Duration) {
        self.millis.fetch_add(d.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set_ms(&self, ms: i64) {
        self.millis.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst))
            .unwrap_or_else(Utc::now)
    }

    async fn sleep(&self, d: Duration) {
        self.advance(d);
    }
}

pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clock_advances_on_sleep() {
        let clock = TestClock::new(1_000_000);
        let before = clock.now_ms();
        clock.sleep(Duration::from_secs(5)).await;
        assert_eq!(clock.now_ms(), before + 5_000);
    }

    #[test]
    fn test_clock_set_ms_is_observable() {
        let clock = TestClock::new(0);
        clock.set_ms(42_000);
        assert_eq!(clock.now_ms(), 42_000);
    }
}
