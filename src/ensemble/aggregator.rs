// =============================================================================
// EnsembleAggregator — fan-out, weighting, fusion, gates
// =============================================================================

use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::{EnsembleConfig, ModelEndpoint};
use crate::model::{Action, EnsembleDecision, ModelPrediction, Snapshot};

use super::calibration::Calibrator;
use super::fusion::{self, FusionMethod, WeightedPrediction};
use super::model_client::ModelClient;
use super::performance::PerformanceTracker;

pub struct EnsembleAggregator {
    endpoints: Vec<ModelEndpoint>,
    model_client: ModelClient,
    performance: PerformanceTracker,
    calibrator: Calibrator,
    method: FusionMethod,
    min_responding_models: usize,
    model_timeout: Duration,
    uncertainty_threshold: f64,
    expected_value_threshold: f64,
    slippage_bps: f64,
    taker_fee_bps: f64,
}

/// Inputs to the expected-value gate that depend on realized trading
/// history rather than this cycle's decision.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedValueInputs {
    pub avg_win: f64,
    pub avg_loss: f64,
}

impl EnsembleAggregator {
    pub fn new(config: &EnsembleConfig, endpoints: Vec<ModelEndpoint>, model_timeout: Duration) -> Self {
        let now = Utc::now();
        let performance = PerformanceTracker::new(
            endpoints.iter().map(|e| (e.key(), e.weight)),
            config.performance_window,
            config.weight_decay_halflife_secs as f64,
            now,
        );
        Self {
            endpoints,
            model_client: ModelClient::new(),
            performance,
            calibrator: Calibrator::new(&config.calibration_method, config.performance_window),
            method: FusionMethod::parse(&config.method),
            min_responding_models: config.min_responding_models,
            model_timeout,
            uncertainty_threshold: config.uncertainty_threshold,
            expected_value_threshold: config.expected_value_threshold,
            slippage_bps: config.estimate_slippage_bps,
            taker_fee_bps: config.taker_fee_bps,
        }
    }

    /// Run one full aggregation cycle: fan-out, weighting, fusion,
    /// uncertainty gate, calibration, expected-value gate.
    pub async fn aggregate(
        &self,
        snapshot: &Snapshot,
        ev_inputs: ExpectedValueInputs,
    ) -> (EnsembleDecision, Vec<ModelPrediction>) {
        let predictions = self.fan_out(snapshot).await;

        if predictions.len() < self.min_responding_models {
            warn!(
                responded = predictions.len(),
                required = self.min_responding_models,
                "insufficient models responded"
            );
            return (
                EnsembleDecision::hold("insufficient models", self.method.as_key()),
                predictions,
            );
        }

        let now = Utc::now();
        let weighted: Vec<WeightedPrediction<'_>> = predictions
            .iter()
            .map(|p| WeightedPrediction {
                prediction: p,
                weight: self.performance.effective_weight(&p.model_key, now),
            })
            .collect();

        let sigma = fusion::uncertainty(&predictions);
        if sigma > self.uncertainty_threshold {
            let mut decision = EnsembleDecision::hold("model disagreement", self.method.as_key());
            decision.uncertainty = sigma;
            decision.participating_models = predictions.iter().map(|p| p.model_key.clone()).collect();
            return (decision, predictions);
        }

        let fused = fusion::fuse(self.method, &weighted);

        let calibrated_confidence = match fused.agg_score {
            Some(agg_score) => self.calibrator.calibrate(agg_score),
            None => fused.confidence,
        };

        let ev = fusion::expected_value(
            calibrated_confidence,
            ev_inputs.avg_win,
            ev_inputs.avg_loss,
            self.slippage_bps,
            self.taker_fee_bps,
        );

        if fused.action != Action::Hold && ev < self.expected_value_threshold {
            let mut decision = EnsembleDecision::hold(
                format!("expected value {ev:.4} below threshold {:.4}", self.expected_value_threshold),
                self.method.as_key(),
            );
            decision.uncertainty = sigma;
            decision.expected_value = ev;
            decision.participating_models = predictions.iter().map(|p| p.model_key.clone()).collect();
            return (decision, predictions);
        }

        let (stop_loss, take_profit) = pick_stop_take(&predictions, fused.action);

        let decision = EnsembleDecision {
            action: fused.action,
            confidence: calibrated_confidence,
            expected_value: ev,
            uncertainty: sigma,
            stop_loss,
            take_profit,
            participating_models: predictions.iter().map(|p| p.model_key.clone()).collect(),
            aggregation_method: self.method.as_key().to_string(),
            reasoning: format!(
                "{} winner with confidence {calibrated_confidence:.3}, ev {ev:.4}",
                fused.action
            ),
        };
        (decision, predictions)
    }

    async fn fan_out(&self, snapshot: &Snapshot) -> Vec<ModelPrediction> {
        let healthy: Vec<&ModelEndpoint> = self
            .endpoints
            .iter()
            .filter(|e| e.enabled && self.performance.is_healthy(&e.key()))
            .collect();

        let calls = healthy.iter().map(|endpoint| {
            let endpoint = (*endpoint).clone();
            async move {
                let result = self.model_client.predict(&endpoint, snapshot, self.model_timeout).await;
                (endpoint, result)
            }
        });

        let results = futures_util::future::join_all(calls).await;

        let now = Utc::now();
        let mut predictions = Vec::new();
        for (endpoint, result) in results {
            match result {
                Ok(prediction) => {
                    self.performance.record_call(&endpoint.key(), true, prediction.latency_ms, now);
                    predictions.push(prediction);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.key(), error = %e, "model call failed");
                    self.performance.record_call(&endpoint.key(), false, self.model_timeout.as_secs_f64() * 1000.0, now);
                }
            }
        }
        predictions
    }

    /// §4.2.8 outcome feedback, invoked when a trade closes.
    pub fn record_outcome(&self, participating_models: &[String], did_win: bool, agg_score: Option<f64>) {
        let now = Utc::now();
        for model_key in participating_models {
            self.performance.record_outcome(model_key, did_win, now);
        }
        if let Some(score) = agg_score {
            self.calibrator.record_outcome(score, did_win);
        }
        info!(did_win, participants = participating_models.len(), "outcome recorded");
    }

    pub fn performance_snapshot(&self) -> Vec<crate::model::ModelPerformance> {
        self.performance.snapshot_all()
    }
}

/// Stop loss/take profit on an ensemble decision come from whichever
/// participating model that agreed with the winning action first proposed
/// them; the risk manager may still recompute ATR-based levels downstream.
fn pick_stop_take(predictions: &[ModelPrediction], action: Action) -> (Option<f64>, Option<f64>) {
    predictions
        .iter()
        .find(|p| p.action == action && (p.stop_loss.is_some() || p.take_profit.is_some()))
        .map(|p| (p.stop_loss, p.take_profit))
        .unwrap_or((None, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnsembleConfig;

    fn endpoint(name: &str, port: u16) -> ModelEndpoint {
        ModelEndpoint {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port,
            weight: 1.0,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn aggregate_holds_when_no_endpoints_configured() {
        let config = EnsembleConfig {
            min_responding_models: 1,
            ..EnsembleConfig::default()
        };
        let agg = EnsembleAggregator::new(&config, vec![endpoint("a", 19999)], Duration::from_millis(50));
        let snapshot = sample_snapshot();
        let (decision, predictions) = agg
            .aggregate(&snapshot, ExpectedValueInputs { avg_win: 0.02, avg_loss: 0.01 })
            .await;
        assert_eq!(decision.action, Action::Hold);
        assert!(predictions.is_empty());
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            timestamp: Utc::now(),
            symbol: "BTCUSDT".into(),
            current_price: 50000.0,
            bid: 49990.0,
            ask: 50010.0,
            volume_24h: 1.0,
            price_change_24h: 0.0,
            candles_5m: vec![],
            candles_1h: vec![],
            indicators: Default::default(),
        }
    }
}
