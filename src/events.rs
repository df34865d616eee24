// =============================================================================
// EventSink — append-only record of every stage of a heartbeat
// =============================================================================
//
// The core treats the analytics event store as an external collaborator: it
// only ever calls through this narrow interface. `SqlEventSink` and
// `CsvEventSink` are two concrete adapters; either, both, or neither may be
// active depending on `database.*` config.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{EnsembleDecision, ModelPrediction, OrderState, Snapshot, Trade};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub context: Option<serde_json::Value>,
}

/// Append-only interface the core uses to durably record every stage of a
/// heartbeat. Implementations must preserve call order (P5): within one
/// heartbeat, snapshot precedes predictions, which precede the decision,
/// which precedes any order/trade records.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record_snapshot(&self, snapshot: &Snapshot);
    async fn record_predictions(&self, predictions: &[ModelPrediction]);
    async fn record_decision(&self, decision: &EnsembleDecision);
    async fn record_order(&self, order: &OrderState);
    async fn record_trade(&self, trade: &Trade);
    async fn record_event(&self, event: SystemEvent);
}

/// No-op sink, used when no `database.*` path is configured and in unit
/// tests that don't care about the audit trail.
#[derive(Debug, Default)]
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn record_snapshot(&self, _snapshot: &Snapshot) {}
    async fn record_predictions(&self, _predictions: &[ModelPrediction]) {}
    async fn record_decision(&self, _decision: &EnsembleDecision) {}
    async fn record_order(&self, _order: &OrderState) {}
    async fn record_trade(&self, _trade: &Trade) {}
    async fn record_event(&self, _event: SystemEvent) {}
}

/// Fan-out sink that forwards every call to each inner sink in order,
/// matching §6's `database.{sqlite_path, csv_path}` pair of collaborators.
pub struct CompositeEventSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new(sinks: Vec<Box<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EventSink for CompositeEventSink {
    async fn record_snapshot(&self, snapshot: &Snapshot) {
        for s in &self.sinks {
            s.record_snapshot(snapshot).await;
        }
    }

    async fn record_predictions(&self, predictions: &[ModelPrediction]) {
        for s in &self.sinks {
            s.record_predictions(predictions).await;
        }
    }

    async fn record_decision(&self, decision: &EnsembleDecision) {
        for s in &self.sinks {
            s.record_decision(decision).await;
        }
    }

    async fn record_order(&self, order: &OrderState) {
        for s in &self.sinks {
            s.record_order(order).await;
        }
    }

    async fn record_trade(&self, trade: &Trade) {
        for s in &self.sinks {
            s.record_trade(trade).await;
        }
    }

    async fn record_event(&self, event: SystemEvent) {
        for s in &self.sinks {
            s.record_event(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// Records the order in which each record_* call arrives, to verify P5.
    #[derive(Default)]
    struct OrderTrackingSink {
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl EventSink for OrderTrackingSink {
        async fn record_snapshot(&self, _snapshot: &Snapshot) {
            self.calls.lock().await.push("snapshot");
        }
        async fn record_predictions(&self, _predictions: &[ModelPrediction]) {
            self.calls.lock().await.push("predictions");
        }
        async fn record_decision(&self, _decision: &EnsembleDecision) {
            self.calls.lock().await.push("decision");
        }
        async fn record_order(&self, _order: &OrderState) {
            self.calls.lock().await.push("order");
        }
        async fn record_trade(&self, _trade: &Trade) {
            self.calls.lock().await.push("trade");
        }
        async fn record_event(&self, _event: SystemEvent) {
            self.calls.lock().await.push("event");
        }
    }

    #[tokio::test]
    async fn composite_sink_preserves_call_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = OrderTrackingSink { calls: calls.clone() };
        let decision = EnsembleDecision::hold("test", "weighted_vote");

        sink.record_snapshot(&sample_snapshot()).await;
        sink.record_predictions(&[]).await;
        sink.record_decision(&decision).await;

        let seen = calls.lock().await.clone();
        assert_eq!(seen, vec!["snapshot", "predictions", "decision"]);
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
