// =============================================================================
// Rate limiter — token buckets for the general request budget and the order
// budget, §4.4.1
// =============================================================================
//
// Unlike the passive header-driven tracker this replaces, callers must be
// able to block until a token is available rather than merely query whether
// one is. Each bucket refills continuously at `capacity / 60s` tokens per
// millisecond and is capped at `capacity`; `acquire` loops between checking
// the bucket and sleeping (via the injectable `Clock`) for exactly the
// deficit's refill time, so no caller ever busy-polls.
// =============================================================================

use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::config::BinanceConfig;

struct BucketState {
    available: f64,
    last_refill_ms: i64,
}

struct TokenBucket {
    name: &'static str,
    capacity: f64,
    refill_per_ms: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(name: &'static str, capacity: f64, refill_per_minute: f64, now_ms: i64) -> Self {
        Self {
            name,
            capacity,
            refill_per_ms: refill_per_minute / 60_000.0,
            state: Mutex::new(BucketState { available: capacity, last_refill_ms: now_ms }),
        }
    }

    fn refill_locked(&self, state: &mut BucketState, now_ms: i64) {
        let elapsed = (now_ms - state.last_refill_ms).max(0) as f64;
        state.available = (state.available + elapsed * self.refill_per_ms).min(self.capacity);
        state.last_refill_ms = now_ms;
    }

    /// Duration until `count` tokens are available, zero if already available.
    fn wait_for(&self, count: f64, now_ms: i64) -> Duration {
        let mut state = self.state.lock();
        self.refill_locked(&mut state, now_ms);
        if state.available >= count {
            Duration::ZERO
        } else {
            let deficit = count - state.available;
            Duration::from_millis((deficit / self.refill_per_ms).ceil() as u64)
        }
    }

    async fn acquire(&self, clock: &dyn Clock, count: f64) {
        loop {
            let now_ms = clock.now_ms();
            let wait = {
                let mut state = self.state.lock();
                self.refill_locked(&mut state, now_ms);
                if state.available >= count {
                    state.available -= count;
                    None
                } else {
                    let deficit = count - state.available;
                    Some(Duration::from_millis((deficit / self.refill_per_ms).ceil() as u64))
                }
            };
            match wait {
                None => return,
                Some(d) => {
                    debug!(bucket = self.name, wait_ms = d.as_millis() as u64, "rate limit budget exhausted");
                    clock.sleep(d).await;
                }
            }
        }
    }
}

/// Two independent budgets: the general request weight (Binance's
/// `X-MBX-USED-WEIGHT-1M`) and the order-placement rate.
pub struct RateLimiter {
    general: TokenBucket,
    orders: TokenBucket,
}

impl RateLimiter {
    pub fn new(config: &BinanceConfig, now_ms: i64) -> Self {
        let general_capacity = config.rate_limit_per_minute as f64 * config.rate_limit_buffer;
        let orders_per_minute = config.rate_limit_orders_per_10s as f64 * 6.0;
        Self {
            general: TokenBucket::new("general", general_capacity, general_capacity, now_ms),
            orders: TokenBucket::new("orders", orders_per_minute, orders_per_minute, now_ms),
        }
    }

    pub async fn acquire_request(&self, clock: &dyn Clock, weight: f64) {
        self.general.acquire(clock, weight).await;
    }

    pub async fn acquire_order(&self, clock: &dyn Clock) {
        self.orders.acquire(clock, 1.0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    /// S6 — capacity 10, refill 10/min: 15 back-to-back acquires at t=0
    /// complete the first 10 immediately, then one every 6s.
    #[tokio::test]
    async fn s6_token_bucket_refill_scenario() {
        let clock = TestClock::new(0);
        let bucket = TokenBucket::new("test", 10.0, 10.0, 0);

        for _ in 0..10 {
            assert_eq!(bucket.wait_for(1.0, clock.now_ms()), Duration::ZERO);
            bucket.acquire(&clock, 1.0).await;
        }

        for i in 1..=5 {
            bucket.acquire(&clock, 1.0).await;
            assert_eq!(clock.now_ms(), i * 6_000);
        }
    }

    #[test]
    fn wait_for_reports_zero_when_capacity_available() {
        let bucket = TokenBucket::new("test", 10.0, 10.0, 0);
        assert_eq!(bucket.wait_for(5.0, 0), Duration::ZERO);
    }

    #[test]
    fn wait_for_computes_deficit_refill_time() {
        let bucket = TokenBucket::new("test", 10.0, 10.0, 0);
        {
            let mut state = bucket.state.lock();
            state.available = 0.0;
            state.last_refill_ms = 0;
        }
        assert_eq!(bucket.wait_for(3.0, 0), Duration::from_millis(18_000));
    }
}
