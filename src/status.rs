// =============================================================================
// StatusProvider — read-only coordinator view for the dashboard, §6
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use crate::broadcast::BroadcastSink;
use crate::risk::RiskManager;

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub running: bool,
    pub open_trades: u32,
    pub circuit_breaker_active: bool,
    pub dry_run: bool,
    pub testnet: bool,
    pub symbol: String,
    pub heartbeat_interval_secs: u64,
    pub uptime_seconds: u64,
    pub open_subscribers: u32,
}

#[async_trait]
pub trait StatusProvider: Send + Sync {
    async fn status(&self) -> StatusSnapshot;
}

/// Concrete `StatusProvider` the coordinator exposes to the dashboard. Holds
/// only what the snapshot needs to read, never a handle back into the
/// coordinator's mutable state.
pub struct CoordinatorStatus {
    running: Arc<std::sync::atomic::AtomicBool>,
    open_trades: Arc<AtomicU32>,
    risk: Arc<RiskManager>,
    broadcast: Arc<dyn BroadcastSink>,
    dry_run: bool,
    testnet: bool,
    symbol: String,
    heartbeat_interval_secs: u64,
    started_at: Instant,
}

impl CoordinatorStatus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        running: Arc<std::sync::atomic::AtomicBool>,
        open_trades: Arc<AtomicU32>,
        risk: Arc<RiskManager>,
        broadcast: Arc<dyn BroadcastSink>,
        dry_run: bool,
        testnet: bool,
        symbol: String,
        heartbeat_interval_secs: u64,
    ) -> Self {
        Self {
            running,
            open_trades,
            risk,
            broadcast,
            dry_run,
            testnet,
            symbol,
            heartbeat_interval_secs,
            started_at: Instant::now(),
        }
    }
}

#[async_trait]
impl StatusProvider for CoordinatorStatus {
    async fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            running: self.running.load(Ordering::SeqCst),
            open_trades: self.open_trades.load(Ordering::SeqCst),
            circuit_breaker_active: self.risk.circuit_breaker_active(chrono::Utc::now()),
            dry_run: self.dry_run,
            testnet: self.testnet,
            symbol: self.symbol.clone(),
            heartbeat_interval_secs: self.heartbeat_interval_secs,
            uptime_seconds: self.started_at.elapsed().as_secs(),
            open_subscribers: self.broadcast.subscriber_count() as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[tokio::test]
    async fn snapshot_reflects_current_counters() {
        let risk = Arc::new(RiskManager::new(
            crate::config::TradingConfig::default(),
            crate::config::SafetyConfig::default(),
            chrono::Utc::now(),
        ));
        let broadcast = Arc::new(crate::broadcast::ChannelBroadcastSink::new(16));
        let _subscriber = broadcast.subscribe();
        let status = CoordinatorStatus::new(
            Arc::new(AtomicBool::new(true)),
            Arc::new(AtomicU32::new(2)),
            risk,
            broadcast,
            true,
            true,
            "BTCUSDT".to_string(),
            60,
        );
        let snap = status.status().await;
        assert!(snap.running);
        assert_eq!(snap.open_trades, 2);
        assert!(!snap.circuit_breaker_active);
        assert_eq!(snap.open_subscribers, 1);
        assert_eq!(snap.symbol, "BTCUSDT");
    }
}
