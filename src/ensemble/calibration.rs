// =============================================================================
// Probability calibration — §4.2.5
// =============================================================================
//
// An isotonic calibrator maps an aggregated raw score to a calibrated
// win-probability, retrained periodically from (aggScore, outcome) pairs
// collected during live trading. Before enough data exists — or when
// `calibration_method` isn't `isotonic` — the linear fallback `(score+1)/2`
// is used, per §4.2.5.
//
// Retraining cadence (Open Question 4, left to the implementer by design):
// the calibrator refits whenever the outcome ring wraps, i.e. every
// `performance_window` recorded outcomes.
// =============================================================================

use parking_lot::RwLock;

/// Minimum number of (score, outcome) pairs before the isotonic fit is
/// trusted over the linear fallback.
const MIN_TRAINING_PAIRS: usize = 20;

struct IsotonicFit {
    /// Sorted (x, y) breakpoints produced by pooled-adjacent-violators.
    points: Vec<(f64, f64)>,
}

impl IsotonicFit {
    /// Pooled-adjacent-violators algorithm: fit a non-decreasing step
    /// function through `(score, outcome)` pairs minimizing squared error.
    fn fit(mut pairs: Vec<(f64, f64)>) -> Self {
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        // Each block starts as a single point; merge adjacent blocks whose
        // means violate monotonicity, weighting by block size.
        let mut blocks: Vec<(f64, f64, usize)> = pairs.iter().map(|(x, y)| (*x, *y, 1)).collect();
        let mut i = 0;
        while i + 1 < blocks.len() {
            if blocks[i].1 > blocks[i + 1].1 {
                let (x0, y0, n0) = blocks[i];
                let (_x1, y1, n1) = blocks[i + 1];
                let merged_y = (y0 * n0 as f64 + y1 * n1 as f64) / (n0 + n1) as f64;
                blocks[i] = (x0, merged_y, n0 + n1);
                blocks.remove(i + 1);
                if i > 0 {
                    i -= 1;
                }
            } else {
                i += 1;
            }
        }

        Self {
            points: blocks.into_iter().map(|(x, y, _)| (x, y)).collect(),
        }
    }

    fn predict(&self, score: f64) -> f64 {
        if self.points.is_empty() {
            return linear_fallback(score);
        }
        // Step function: value of the last breakpoint at or before `score`,
        // clamped to the first point below range.
        let mut result = self.points[0].1;
        for (x, y) in &self.points {
            if score >= *x {
                result = *y;
            } else {
                break;
            }
        }
        result.clamp(0.0, 1.0)
    }
}

fn linear_fallback(agg_score: f64) -> f64 {
    ((agg_score + 1.0) / 2.0).clamp(0.0, 1.0)
}

pub struct Calibrator {
    enabled: bool,
    performance_window: usize,
    fit: RwLock<Option<IsotonicFit>>,
    pending: RwLock<Vec<(f64, f64)>>,
    last_retrain_count: std::sync::atomic::AtomicUsize,
}

impl Calibrator {
    pub fn new(method: &str, performance_window: usize) -> Self {
        Self {
            enabled: method == "isotonic",
            performance_window,
            fit: RwLock::new(None),
            pending: RwLock::new(Vec::new()),
            last_retrain_count: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Calibrate a raw aggregated score to a probability in [0, 1].
    pub fn calibrate(&self, agg_score: f64) -> f64 {
        if !self.enabled {
            return linear_fallback(agg_score);
        }
        match self.fit.read().as_ref() {
            Some(fit) if self.pending.read().len() >= MIN_TRAINING_PAIRS => fit.predict(agg_score),
            _ => linear_fallback(agg_score),
        }
    }

    /// Record one realized (aggScore, outcome) pair and retrain when the
    /// ring has wrapped since the last retrain.
    pub fn record_outcome(&self, agg_score: f64, did_win: bool) {
        if !self.enabled {
            return;
        }
        let outcome = if did_win { 1.0 } else { 0.0 };
        let mut pending = self.pending.write();
        pending.push((agg_score, outcome));
        if pending.len() > self.performance_window * 4 {
            let excess = pending.len() - self.performance_window * 4;
            pending.drain(0..excess);
        }

        let count = pending.len();
        let last = self.last_retrain_count.load(std::sync::atomic::Ordering::Relaxed);
        if count >= last + self.performance_window && count >= MIN_TRAINING_PAIRS {
            *self.fit.write() = Some(IsotonicFit::fit(pending.clone()));
            self.last_retrain_count.store(count, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_linear_before_enough_data() {
        let cal = Calibrator::new("isotonic", 10);
        assert!((cal.calibrate(0.5) - 0.75).abs() < 1e-9);
        assert!((cal.calibrate(-1.0) - 0.0).abs() < 1e-9);
    }

    #[test]
    fn non_isotonic_method_always_uses_linear_fallback() {
        let cal = Calibrator::new("none", 10);
        for _ in 0..100 {
            cal.record_outcome(0.9, true);
        }
        assert!((cal.calibrate(0.5) - 0.75).abs() < 1e-9);
    }

    #[test]
    fn retrains_after_window_wraps_and_produces_monotonic_fit() {
        let cal = Calibrator::new("isotonic", 5);
        for i in 0..40 {
            let score = (i as f64 / 40.0) * 2.0 - 1.0;
            let won = score > 0.0;
            cal.record_outcome(score, won);
        }
        let low = cal.calibrate(-0.9);
        let high = cal.calibrate(0.9);
        assert!(high >= low);
    }

    #[test]
    fn isotonic_fit_is_non_decreasing() {
        let fit = IsotonicFit::fit(vec![(0.0, 0.8), (1.0, 0.2), (2.0, 0.9)]);
        let mut last = f64::MIN;
        for x in [-1.0, 0.5, 1.5, 3.0] {
            let y = fit.predict(x);
            assert!(y >= last - 1e-9);
            last = y;
        }
    }
}
