// =============================================================================
// BroadcastSink — push status updates to dashboard subscribers
// =============================================================================
//
// Backed by a `tokio::sync::broadcast` channel: one producer (the
// Coordinator), many consumers (WebSocket connections in api/ws.rs). A slow
// or disconnected subscriber never blocks the heartbeat — `send` on a
// broadcast channel never awaits a reader.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::model::{Action, EnsembleDecision, Trade};

/// Typed broadcast payloads, each stamped with a UTC timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastMessage {
    StatusUpdate {
        timestamp: DateTime<Utc>,
        running: bool,
        open_trades: u32,
        circuit_breaker_active: bool,
    },
    Decision {
        timestamp: DateTime<Utc>,
        action: Action,
        confidence: f64,
        reasoning: String,
    },
    TradeOpened {
        timestamp: DateTime<Utc>,
        trade_id: String,
        symbol: String,
        entry_price: f64,
        quantity: f64,
    },
    TradeClosed {
        timestamp: DateTime<Utc>,
        trade_id: String,
        pnl: f64,
        pnl_percent: f64,
    },
}

impl BroadcastMessage {
    pub fn decision(decision: &EnsembleDecision) -> Self {
        Self::Decision {
            timestamp: Utc::now(),
            action: decision.action,
            confidence: decision.confidence,
            reasoning: decision.reasoning.clone(),
        }
    }

    pub fn trade_opened(symbol: &str, trade: &Trade) -> Self {
        Self::TradeOpened {
            timestamp: Utc::now(),
            trade_id: trade.id.clone(),
            symbol: symbol.to_string(),
            entry_price: trade.entry_price,
            quantity: trade.quantity,
        }
    }

    pub fn trade_closed(trade: &Trade) -> Self {
        Self::TradeClosed {
            timestamp: Utc::now(),
            trade_id: trade.id.clone(),
            pnl: trade.pnl.unwrap_or(0.0),
            pnl_percent: trade.pnl_percent.unwrap_or(0.0),
        }
    }
}

#[async_trait]
pub trait BroadcastSink: Send + Sync {
    fn publish(&self, message: BroadcastMessage);
    fn subscriber_count(&self) -> usize;
    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage>;
}

pub struct ChannelBroadcastSink {
    tx: broadcast::Sender<BroadcastMessage>,
}

impl ChannelBroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl BroadcastSink for ChannelBroadcastSink {
    fn publish(&self, message: BroadcastMessage) {
        // `send` errors only when there are zero subscribers; that's a
        // routine state (no dashboard client connected yet), not a failure.
        if self.tx.send(message).is_err() {
            debug!("broadcast published with no subscribers");
        }
    }

    fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let sink = ChannelBroadcastSink::new(16);
        let mut rx = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 1);

        sink.publish(BroadcastMessage::StatusUpdate {
            timestamp: Utc::now(),
            running: true,
            open_trades: 0,
            circuit_breaker_active: false,
        });

        let received = rx.recv().await.unwrap();
        matches!(received, BroadcastMessage::StatusUpdate { .. });
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let sink = ChannelBroadcastSink::new(16);
        sink.publish(BroadcastMessage::StatusUpdate {
            timestamp: Utc::now(),
            running: true,
            open_trades: 0,
            circuit_breaker_active: false,
        });
    }
}
