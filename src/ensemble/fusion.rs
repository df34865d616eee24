// =============================================================================
// Fusion methods — §4.2.3; sealed set of variants over `fuse(predictions)`
// =============================================================================

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::{Action, ModelPrediction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionMethod {
    WeightedVote,
    BayesianWeighted,
    AverageConfidence,
    Majority,
}

impl FusionMethod {
    pub fn parse(name: &str) -> Self {
        match name {
            "weighted_vote" => Self::WeightedVote,
            "bayesian_weighted" => Self::BayesianWeighted,
            "average_confidence" => Self::AverageConfidence,
            "majority" => Self::Majority,
            _ => Self::BayesianWeighted,
        }
    }

    pub fn as_key(self) -> &'static str {
        match self {
            Self::WeightedVote => "weighted_vote",
            Self::BayesianWeighted => "bayesian_weighted",
            Self::AverageConfidence => "average_confidence",
            Self::Majority => "majority",
        }
    }
}

/// Result of fusing a set of predictions, prior to calibration/EV gating.
pub struct FusionResult {
    pub action: Action,
    /// Raw (uncalibrated) confidence in the winning action.
    pub confidence: f64,
    /// Only populated by `bayesian_weighted` — the aggregated raw score in
    /// [-1, 1], inputs to calibration.
    pub agg_score: Option<f64>,
}

/// A prediction paired with its effective weight, the unit every fusion
/// method actually consumes.
pub struct WeightedPrediction<'a> {
    pub prediction: &'a ModelPrediction,
    pub weight: f64,
}

pub fn fuse(method: FusionMethod, weighted: &[WeightedPrediction<'_>]) -> FusionResult {
    match method {
        FusionMethod::WeightedVote => weighted_vote(weighted),
        FusionMethod::BayesianWeighted => bayesian_weighted(weighted),
        FusionMethod::AverageConfidence => average_confidence(weighted),
        FusionMethod::Majority => majority(weighted),
    }
}

fn weighted_vote(weighted: &[WeightedPrediction<'_>]) -> FusionResult {
    let mut votes: HashMap<Action, f64> = HashMap::new();
    let mut total_weight = 0.0;
    for wp in weighted {
        *votes.entry(wp.prediction.action).or_insert(0.0) += wp.prediction.confidence * wp.weight;
        total_weight += wp.weight;
    }
    let (winner, winner_sum) = argmax(&votes);
    let confidence = if total_weight > 0.0 { winner_sum / total_weight } else { 0.0 };
    FusionResult {
        action: winner,
        confidence,
        agg_score: None,
    }
}

/// §4.2.3 bayesian_weighted: inverse-variance combination of `(rawScore,
/// confidence)` pairs, `w_i = baseW_i * confidence_i / max(1-confidence_i,
/// 0.01)`. `baseW_i` here is each prediction's already-computed effective
/// weight (which already folds in performance decay), matching the
/// original's use of the per-model weight as the base term.
fn bayesian_weighted(weighted: &[WeightedPrediction<'_>]) -> FusionResult {
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for wp in weighted {
        let raw = wp.prediction.raw_score.unwrap_or(0.0);
        let inv_variance = 1.0 / (1.0 - wp.prediction.confidence).max(0.01);
        let w_i = wp.weight * wp.prediction.confidence * inv_variance;
        weighted_sum += raw * w_i;
        total_weight += w_i;
    }
    let agg_score = if total_weight > 0.0 { weighted_sum / total_weight } else { 0.0 };
    let action = if agg_score > 0.05 {
        Action::Long
    } else if agg_score < -0.05 {
        Action::Short
    } else {
        Action::Hold
    };
    FusionResult {
        action,
        confidence: agg_score.abs().min(1.0),
        agg_score: Some(agg_score),
    }
}

fn average_confidence(weighted: &[WeightedPrediction<'_>]) -> FusionResult {
    let mut sums: HashMap<Action, f64> = HashMap::new();
    let mut counts: HashMap<Action, u32> = HashMap::new();
    for wp in weighted {
        *sums.entry(wp.prediction.action).or_insert(0.0) += wp.prediction.confidence;
        *counts.entry(wp.prediction.action).or_insert(0) += 1;
    }
    let mut means: HashMap<Action, f64> = HashMap::new();
    for (action, sum) in &sums {
        let count = counts[action] as f64;
        means.insert(*action, sum / count);
    }
    let (winner, confidence) = argmax(&means);
    FusionResult {
        action: winner,
        confidence,
        agg_score: None,
    }
}

fn majority(weighted: &[WeightedPrediction<'_>]) -> FusionResult {
    let mut counts: HashMap<Action, u32> = HashMap::new();
    for wp in weighted {
        *counts.entry(wp.prediction.action).or_insert(0) += 1;
    }
    let total = weighted.len() as f64;
    let (winner, winner_count) = counts
        .iter()
        .max_by(|a, b| a.1.cmp(b.1).then(tie_break_order(a.0).cmp(&tie_break_order(b.0)).reverse()))
        .map(|(a, c)| (*a, *c as f64))
        .unwrap_or((Action::Hold, 0.0));
    let confidence = if total > 0.0 { winner_count / total } else { 0.0 };
    FusionResult {
        action: winner,
        confidence,
        agg_score: None,
    }
}

/// Insertion order tie-break per §4.2.2: long < short < hold mirrors the
/// order predictions are typically declared in model_endpoints/action sets.
fn tie_break_order(action: &Action) -> u8 {
    match action {
        Action::Long => 0,
        Action::Short => 1,
        Action::Hold => 2,
    }
}

fn argmax(scores: &HashMap<Action, f64>) -> (Action, f64) {
    scores
        .iter()
        .max_by(|a, b| {
            a.1.partial_cmp(b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(tie_break_order(a.0).cmp(&tie_break_order(b.0)).reverse())
        })
        .map(|(a, s)| (*a, *s))
        .unwrap_or((Action::Hold, 0.0))
}

/// §4.2.4 uncertainty gate: stddev of raw scores across responding models.
pub fn uncertainty(predictions: &[ModelPrediction]) -> f64 {
    let scores: Vec<f64> = predictions.iter().filter_map(|p| p.raw_score).collect();
    if scores.len() < 2 {
        return 0.0;
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
    variance.sqrt()
}

/// §4.2.6 expected-value gate.
pub fn expected_value(
    p_win: f64,
    avg_win: f64,
    avg_loss: f64,
    slippage_bps: f64,
    taker_fee_bps: f64,
) -> f64 {
    p_win * avg_win - (1.0 - p_win) * avg_loss - 2.0 * (slippage_bps + taker_fee_bps) / 10_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn pred(action: Action, confidence: f64, raw_score: Option<f64>) -> ModelPrediction {
        ModelPrediction {
            model_name: "m".into(),
            model_key: "m:1".into(),
            action,
            confidence,
            raw_score,
            stop_loss: None,
            take_profit: None,
            latency_ms: 10.0,
            timestamp: Utc::now(),
        }
    }

    /// S3 — Weighted vote: three predictions with given weights.
    #[test]
    fn s3_weighted_vote_scenario() {
        let p1 = pred(Action::Long, 0.80, None);
        let p2 = pred(Action::Long, 0.75, None);
        let p3 = pred(Action::Hold, 0.60, None);
        let weighted = vec![
            WeightedPrediction { prediction: &p1, weight: 1.0 },
            WeightedPrediction { prediction: &p2, weight: 1.0 },
            WeightedPrediction { prediction: &p3, weight: 0.8 },
        ];
        let result = fuse(FusionMethod::WeightedVote, &weighted);
        assert_eq!(result.action, Action::Long);
        assert!((result.confidence - 0.554).abs() < 0.005);
    }

    /// S4 — Uncertainty gate: raw scores with high disagreement.
    #[test]
    fn s4_uncertainty_gate_scenario() {
        let sigma = uncertainty(&[
            pred(Action::Long, 0.9, Some(0.9)),
            pred(Action::Short, 0.8, Some(-0.8)),
            pred(Action::Hold, 0.1, Some(0.1)),
        ]);
        assert!(sigma > 0.30);
        assert!((sigma - 0.6944).abs() < 0.001);
    }

    #[test]
    fn bayesian_weighted_combines_raw_scores_by_inverse_variance() {
        let p1 = pred(Action::Long, 0.9, Some(0.8));
        let p2 = pred(Action::Long, 0.6, Some(0.4));
        let weighted = vec![
            WeightedPrediction { prediction: &p1, weight: 1.0 },
            WeightedPrediction { prediction: &p2, weight: 1.0 },
        ];
        let result = fuse(FusionMethod::BayesianWeighted, &weighted);
        assert_eq!(result.action, Action::Long);
        assert!(result.agg_score.unwrap() > 0.0);
    }

    #[test]
    fn expected_value_gate_blocks_thin_edges() {
        let ev = expected_value(0.51, 0.01, 0.01, 2.0, 4.0);
        assert!(ev < 0.01);
    }
}
