// =============================================================================
// Per-model performance tracking — weighting, outcome feedback, health
// =============================================================================
//
// One mutex per model record (per §5's shared-resource policy): concurrent
// fan-out responses update disjoint records, and global reads (for status)
// take a snapshot rather than holding any lock across the read.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::model::ModelPerformance;

/// Minimum and maximum an effective weight may take after decay/perf scaling.
const WEIGHT_MIN: f64 = 0.1;
const WEIGHT_MAX: f64 = 2.0;

/// EWMA smoothing factor for response-time tracking.
const LATENCY_ALPHA: f64 = 0.2;

/// A model is marked unhealthy once it has answered at least
/// `HEALTH_MIN_SAMPLES` times and its failure ratio exceeds this threshold.
/// Ambient reliability feature grounded on the original `check_model_health`.
const HEALTH_MIN_SAMPLES: u64 = 5;
const HEALTH_FAILURE_RATIO: f64 = 0.5;

pub struct PerformanceTracker {
    records: HashMap<String, Mutex<ModelPerformance>>,
    performance_window: usize,
    weight_decay_halflife_secs: f64,
}

impl PerformanceTracker {
    pub fn new(
        endpoints: impl IntoIterator<Item = (String, f64)>,
        performance_window: usize,
        weight_decay_halflife_secs: f64,
        now: DateTime<Utc>,
    ) -> Self {
        let records = endpoints
            .into_iter()
            .map(|(key, base_weight)| {
                (key.clone(), Mutex::new(ModelPerformance::new(key, base_weight, now)))
            })
            .collect();
        Self {
            records,
            performance_window,
            weight_decay_halflife_secs,
        }
    }

    /// Effective weight for a model per §4.2.2:
    /// `w = clamp(baseWeight * (0.6*winRate + 0.4*min(sharpe/2,1)) * decay, 0.1, 2.0)`.
    pub fn effective_weight(&self, model_key: &str, now: DateTime<Utc>) -> f64 {
        let Some(lock) = self.records.get(model_key) else {
            return WEIGHT_MIN;
        };
        let rec = lock.lock();
        let perf_mult = 0.6 * rec.win_rate + 0.4 * (rec.sharpe.unwrap_or(0.0) / 2.0).min(1.0);
        let elapsed_secs = (now - rec.last_updated).num_milliseconds() as f64 / 1000.0;
        let decay = (-elapsed_secs.max(0.0) / self.weight_decay_halflife_secs).exp();
        let w = rec.base_weight * perf_mult * decay;
        w.clamp(WEIGHT_MIN, WEIGHT_MAX)
    }

    pub fn is_healthy(&self, model_key: &str) -> bool {
        let Some(lock) = self.records.get(model_key) else {
            return true;
        };
        let rec = lock.lock();
        let total = rec.success_count + rec.failure_count;
        if total < HEALTH_MIN_SAMPLES {
            return true;
        }
        let failure_ratio = rec.failure_count as f64 / total as f64;
        rec.enabled && failure_ratio <= HEALTH_FAILURE_RATIO
    }

    /// Record one fan-out call's outcome: success/failure counters and EWMA
    /// latency. Re-enables a previously unhealthy model on success.
    pub fn record_call(&self, model_key: &str, success: bool, latency_ms: f64, now: DateTime<Utc>) {
        let Some(lock) = self.records.get(model_key) else {
            return;
        };
        let mut rec = lock.lock();
        if success {
            rec.success_count += 1;
            rec.last_success = Some(now);
            rec.enabled = true;
        } else {
            rec.failure_count += 1;
        }
        rec.avg_response_time = if rec.avg_response_time == 0.0 {
            latency_ms
        } else {
            LATENCY_ALPHA * latency_ms + (1.0 - LATENCY_ALPHA) * rec.avg_response_time
        };
        rec.last_updated = now;

        let total = rec.success_count + rec.failure_count;
        if total >= HEALTH_MIN_SAMPLES {
            let failure_ratio = rec.failure_count as f64 / total as f64;
            if failure_ratio > HEALTH_FAILURE_RATIO {
                rec.enabled = false;
            }
        }
    }

    /// §4.2.8 outcome feedback: append to the bounded outcome ring and
    /// recompute win rate + Sharpe (`mean(r)/std(r)` over `r in {+1,-1}`).
    pub fn record_outcome(&self, model_key: &str, did_win: bool, now: DateTime<Utc>) {
        let Some(lock) = self.records.get(model_key) else {
            return;
        };
        let mut rec = lock.lock();
        rec.recent_outcomes.push(did_win);
        if rec.recent_outcomes.len() > self.performance_window {
            let excess = rec.recent_outcomes.len() - self.performance_window;
            rec.recent_outcomes.drain(0..excess);
        }

        let wins = rec.recent_outcomes.iter().filter(|w| **w).count();
        rec.win_rate = wins as f64 / rec.recent_outcomes.len() as f64;

        let returns: Vec<f64> = rec
            .recent_outcomes
            .iter()
            .map(|w| if *w { 1.0 } else { -1.0 })
            .collect();
        rec.sharpe = sharpe_of(&returns);
        rec.last_updated = now;
    }

    pub fn snapshot(&self, model_key: &str) -> Option<ModelPerformance> {
        self.records.get(model_key).map(|lock| lock.lock().clone())
    }

    pub fn snapshot_all(&self) -> Vec<ModelPerformance> {
        self.records.values().map(|lock| lock.lock().clone()).collect()
    }

    /// Whether this tracker's outcome ring has wrapped since the last
    /// calibrator retrain point, i.e. the count is an exact multiple of the
    /// performance window. Used to decide calibrator retraining cadence.
    pub fn outcomes_recorded_total(&self) -> u64 {
        self.records
            .values()
            .map(|lock| {
                let rec = lock.lock();
                rec.success_count + rec.failure_count
            })
            .sum()
    }
}

fn sharpe_of(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    let std = variance.sqrt();
    if std > 0.0 {
        Some(mean / std)
    } else {
        Some(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PerformanceTracker {
        PerformanceTracker::new(
            vec![("a:1".to_string(), 1.0)],
            100,
            24.0 * 3600.0,
            Utc::now(),
        )
    }

    #[test]
    fn fresh_model_has_zero_perf_multiplier_but_nonzero_weight_floor() {
        let t = tracker();
        let w = t.effective_weight("a:1", Utc::now());
        // winRate=0, sharpe=None -> perfMult=0 -> w clamps to floor.
        assert!((w - WEIGHT_MIN).abs() < 1e-9);
    }

    #[test]
    fn weight_decays_with_elapsed_time() {
        let t = tracker();
        t.record_outcome("a:1", true, Utc::now());
        t.record_outcome("a:1", true, Utc::now());
        let now = Utc::now();
        let w_now = t.effective_weight("a:1", now);
        let later = now + chrono::Duration::hours(48);
        let w_later = t.effective_weight("a:1", later);
        assert!(w_later <= w_now);
    }

    #[test]
    fn unhealthy_after_majority_failures() {
        let t = tracker();
        let now = Utc::now();
        for _ in 0..6 {
            t.record_call("a:1", false, 10.0, now);
        }
        assert!(!t.is_healthy("a:1"));
    }

    #[test]
    fn recovers_healthy_on_success() {
        let t = tracker();
        let now = Utc::now();
        for _ in 0..6 {
            t.record_call("a:1", false, 10.0, now);
        }
        assert!(!t.is_healthy("a:1"));
        t.record_call("a:1", true, 10.0, now);
        assert!(t.is_healthy("a:1"));
    }

    #[test]
    fn outcome_ring_is_bounded_by_performance_window() {
        let t = PerformanceTracker::new(vec![("a:1".to_string(), 1.0)], 3, 24.0 * 3600.0, Utc::now());
        for _ in 0..10 {
            t.record_outcome("a:1", true, Utc::now());
        }
        let snap = t.snapshot("a:1").unwrap();
        assert_eq!(snap.recent_outcomes.len(), 3);
    }
}
