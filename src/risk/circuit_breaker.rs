// =============================================================================
// Circuit breaker state machine — §4.3.3
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
}

/// Process-wide circuit breaker, backed by atomics per §5's shared-resource
/// policy. CLOSED permits trading; OPEN halts it until cooldown elapses or
/// a win resets it (when configured to do so).
pub struct CircuitBreaker {
    threshold: u32,
    cooldown_secs: i64,
    reset_on_win: bool,
    consecutive_losses: AtomicU32,
    open: AtomicBool,
    opened_at_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_secs: u64, reset_on_win: bool) -> Self {
        Self {
            threshold,
            cooldown_secs: cooldown_secs as i64,
            reset_on_win,
            consecutive_losses: AtomicU32::new(0),
            open: AtomicBool::new(false),
            opened_at_ms: AtomicI64::new(0),
        }
    }

    /// P4: `circuitBreaker=OPEN => consecutiveLosses >= threshold` at the
    /// time it opened, and either the cooldown hasn't elapsed or no reset
    /// event has occurred yet.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        let elapsed = now.timestamp_millis() - self.opened_at_ms.load(Ordering::SeqCst);
        if elapsed >= self.cooldown_secs * 1000 {
            self.open.store(false, Ordering::SeqCst);
            false
        } else {
            true
        }
    }

    pub fn cooldown_remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        let elapsed_ms = now.timestamp_millis() - self.opened_at_ms.load(Ordering::SeqCst);
        ((self.cooldown_secs * 1000 - elapsed_ms).max(0)) / 1000
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.consecutive_losses.load(Ordering::SeqCst)
    }

    /// P3: record a trade close. `pnl < 0` increments the loss streak and
    /// may trip the breaker; `pnl > 0` resets the streak iff configured to.
    pub fn record_trade_outcome(&self, pnl: f64, now: DateTime<Utc>) {
        if pnl < 0.0 {
            let losses = self.consecutive_losses.fetch_add(1, Ordering::SeqCst) + 1;
            if losses >= self.threshold {
                self.open.store(true, Ordering::SeqCst);
                self.opened_at_ms.store(now.timestamp_millis(), Ordering::SeqCst);
            }
        } else if self.reset_on_win {
            self.consecutive_losses.store(0, Ordering::SeqCst);
            if self.open.load(Ordering::SeqCst) {
                self.open.store(false, Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S5 — Circuit breaker trip: five consecutive losses of pnl=-10.
    #[test]
    fn s5_circuit_breaker_trip_scenario() {
        let cb = CircuitBreaker::new(5, 3600, true);
        let now = Utc::now();
        for _ in 0..4 {
            cb.record_trade_outcome(-10.0, now);
            assert!(!cb.is_active(now));
        }
        cb.record_trade_outcome(-10.0, now);
        assert!(cb.is_active(now));
        assert_eq!(cb.consecutive_losses(), 5);
    }

    #[test]
    fn breaker_closes_after_cooldown_elapses() {
        let cb = CircuitBreaker::new(2, 10, false);
        let now = Utc::now();
        cb.record_trade_outcome(-5.0, now);
        cb.record_trade_outcome(-5.0, now);
        assert!(cb.is_active(now));
        let later = now + chrono::Duration::seconds(11);
        assert!(!cb.is_active(later));
    }

    #[test]
    fn breaker_resets_on_first_win_when_configured() {
        let cb = CircuitBreaker::new(2, 3600, true);
        let now = Utc::now();
        cb.record_trade_outcome(-5.0, now);
        cb.record_trade_outcome(-5.0, now);
        assert!(cb.is_active(now));
        cb.record_trade_outcome(5.0, now);
        assert!(!cb.is_active(now));
        assert_eq!(cb.consecutive_losses(), 0);
    }

    #[test]
    fn breaker_stays_open_on_win_when_reset_on_win_disabled() {
        let cb = CircuitBreaker::new(2, 3600, false);
        let now = Utc::now();
        cb.record_trade_outcome(-5.0, now);
        cb.record_trade_outcome(-5.0, now);
        assert!(cb.is_active(now));
        cb.record_trade_outcome(5.0, now);
        assert!(cb.is_active(now));
    }
}
