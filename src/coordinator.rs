// =============================================================================
// Coordinator — lifecycle, heartbeat loop, decision-cycle orchestration, §4.1
// =============================================================================
//
// Single-threaded cooperative core: one task (`heartbeat_loop`) owns mutation
// of the RiskManager, OrderStore, and EventSink, so at most one decision
// cycle is ever in flight (§5). Health-check observes exchange state and
// hands terminal fills to the heartbeat task over a channel rather than
// closing trades itself; broadcast only reads shared state.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::api::{self, ApiState};
use crate::broadcast::{BroadcastMessage, BroadcastSink};
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::ensemble::{EnsembleAggregator, ExpectedValueInputs};
use crate::events::{EventSink, Severity, SystemEvent};
use crate::exchange::{ExchangeClient, OrderRequest};
use crate::market_data::MarketData;
use crate::model::{Action, OrderSide, OrderState, OrderType, Trade, TradeStatus};
use crate::risk::RiskManager;
use crate::status::{CoordinatorStatus, StatusProvider};

pub struct Coordinator {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    exchange: Arc<ExchangeClient>,
    risk: Arc<RiskManager>,
    ensemble: Arc<EnsembleAggregator>,
    market_data: Arc<dyn MarketData>,
    events: Arc<dyn EventSink>,
    broadcast: Arc<dyn BroadcastSink>,

    running: Arc<AtomicBool>,
    open_trades: Arc<AtomicU32>,
    breaker_alert_sent: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    // Terminal fills observed by `health_check_loop` are handed off here
    // rather than applied directly, so RiskManager mutation (close_trade,
    // the breaker, the emergency-shutdown latch) stays owned by the single
    // heartbeat task (§5).
    fills_tx: mpsc::UnboundedSender<OrderState>,
    fills_rx: Mutex<mpsc::UnboundedReceiver<OrderState>>,
}

impl Coordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        clock: Arc<dyn Clock>,
        exchange: Arc<ExchangeClient>,
        risk: Arc<RiskManager>,
        ensemble: Arc<EnsembleAggregator>,
        market_data: Arc<dyn MarketData>,
        events: Arc<dyn EventSink>,
        broadcast: Arc<dyn BroadcastSink>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fills_tx, fills_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            clock,
            exchange,
            risk,
            ensemble,
            market_data,
            events,
            broadcast,
            running: Arc::new(AtomicBool::new(false)),
            open_trades: Arc::new(AtomicU32::new(0)),
            breaker_alert_sent: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
            fills_tx,
            fills_rx: Mutex::new(fills_rx),
        })
    }

    pub fn status_provider(&self) -> Arc<dyn StatusProvider> {
        Arc::new(CoordinatorStatus::new(
            self.running.clone(),
            self.open_trades.clone(),
            self.risk.clone(),
            self.broadcast.clone(),
            self.config.dry_run,
            self.config.testnet,
            self.config.trading.symbol.clone(),
            self.config.timing.heartbeat_interval_secs,
        ))
    }

    /// §4.1 `start()`: initialize collaborators in order (EventSink is
    /// already live by construction; MarketData → ExchangeClient →
    /// RiskManager needs no async init → EnsembleAggregator likewise), then
    /// launch the heartbeat/health-check/broadcast tasks plus the dashboard
    /// server, and block until shutdown.
    pub async fn run(self: Arc<Self>, bind_addr: &str) -> Result<()> {
        self.market_data.initialize().await.context("market data initialization failed")?;
        self.exchange
            .initialize(self.config.trading.leverage, &self.config.trading.margin_mode, self.clock.as_ref())
            .await
            .context("exchange client initialization failed")?;

        if let Ok(snapshot) = self.exchange.account_snapshot(self.clock.as_ref()).await {
            self.risk.update_initial_equity(snapshot.total_wallet_balance);
        }

        self.running.store(true, Ordering::SeqCst);
        info!(symbol = %self.config.trading.symbol, dry_run = self.config.dry_run, "coordinator starting");

        let api_state = ApiState { status: self.status_provider(), broadcast: self.broadcast.clone() };
        let mut shutdown_for_api = self.shutdown_rx.clone();
        let bind_addr = bind_addr.to_string();
        let api_task = tokio::spawn(async move {
            api::serve(&bind_addr, api_state, async move {
                let _ = shutdown_for_api.changed().await;
            })
            .await
        });

        let heartbeat_task = tokio::spawn(self.clone().heartbeat_loop());
        let health_task = tokio::spawn(self.clone().health_check_loop());
        let broadcast_task = tokio::spawn(self.clone().broadcast_loop());

        let _ = heartbeat_task.await;
        let _ = health_task.await;
        let _ = broadcast_task.await;
        match api_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "dashboard server exited with error"),
            Err(e) => error!(error = %e, "dashboard server task panicked"),
        }

        self.running.store(false, Ordering::SeqCst);
        info!("coordinator stopped");
        Ok(())
    }

    /// §4.1 `stop()`: signal shutdown, optionally cancel open orders, and
    /// let the cooperative tasks observe the flag and exit on their own.
    pub async fn stop(&self) {
        info!("coordinator shutdown requested");
        let _ = self.shutdown_tx.send(true);

        if self.config.safety.close_positions_on_shutdown {
            match self.exchange.order_store.load_all_open().await {
                Ok(open) => {
                    for order in open {
                        if let Err(e) = self.exchange.cancel_order(order.order_id, self.clock.as_ref()).await {
                            warn!(order_id = order.order_id, error = %e, "failed to cancel order on shutdown");
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to load open orders for shutdown cancellation"),
            }
        }
    }

    /// §4.1 heartbeat loop: emergency shutdown check, circuit breaker check,
    /// decision cycle, sleep. Cancellable sleep via the shutdown channel.
    async fn heartbeat_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.timing.heartbeat_interval_secs);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.drain_fills().await;

            if self.risk.emergency_shutdown_active() {
                error!("emergency shutdown latch set — heartbeat exiting");
                let _ = self.shutdown_tx.send(true);
                break;
            }

            if self.risk.circuit_breaker_active(self.clock.now()) {
                if !self.breaker_alert_sent.swap(true, Ordering::SeqCst) {
                    warn!("circuit breaker open — trading halted until cooldown elapses");
                    self.events
                        .record_event(SystemEvent {
                            timestamp: self.clock.now(),
                            severity: Severity::Warning,
                            message: "circuit breaker tripped".to_string(),
                            context: None,
                        })
                        .await;
                }
            } else {
                self.breaker_alert_sent.store(false, Ordering::SeqCst);
                if let Err(e) = self.run_decision_cycle().await {
                    error!(error = %e, "decision cycle failed");
                }
            }

            tokio::select! {
                _ = self.clock.sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// One heartbeat's worth of work: snapshot → fan-out/fuse → risk-gate →
    /// place order → persist → broadcast. Ordering is serialized exactly in
    /// this sequence (§5): event-sink writes appear in causal order.
    async fn run_decision_cycle(&self) -> Result<()> {
        let snapshot = self.market_data.snapshot(&self.config.trading.symbol).await.context("market data snapshot failed")?;
        self.events.record_snapshot(&snapshot).await;

        let account = self.exchange.account_snapshot(self.clock.as_ref()).await.context("account snapshot failed")?;
        self.risk.update_initial_equity(account.total_wallet_balance);

        let (win_rate, _sharpe, avg_win, avg_loss) = self.risk.performance_stats();
        let ev_inputs = ExpectedValueInputs { avg_win, avg_loss };
        let (decision, predictions) = self.ensemble.aggregate(&snapshot, ev_inputs).await;

        self.events.record_predictions(&predictions).await;
        self.events.record_decision(&decision).await;
        self.broadcast.publish(BroadcastMessage::decision(&decision));

        if decision.action == Action::Hold {
            return Ok(());
        }

        let (daily_pnl, daily_trades) = self.risk.daily_snapshot();
        let risk_metrics = crate::model::RiskMetrics {
            total_equity: account.total_wallet_balance,
            available_margin: account.available_balance,
            total_exposure: self.risk.open_exposure_usd(),
            open_positions: self.open_trades.load(Ordering::SeqCst),
            daily_pnl,
            daily_trades,
            consecutive_losses: self.risk.consecutive_losses(),
            win_rate,
        };

        let side = match decision.action {
            Action::Long => OrderSide::Buy,
            Action::Short => OrderSide::Sell,
            Action::Hold => unreachable!("handled above"),
        };

        let kelly_stats = if avg_loss > 0.0 {
            Some(crate::risk::KellyStats { win_rate, avg_win, avg_loss })
        } else {
            None
        };
        let size = self.risk.calculate_position_size(
            snapshot.current_price,
            account.total_wallet_balance,
            self.config.trading.leverage,
            kelly_stats,
        );

        if let Err(reason) = self.risk.validate_trade(&risk_metrics, size.size_usd, self.clock.now()) {
            info!(reason = %reason, "trade rejected by risk manager");
            self.events
                .record_event(SystemEvent {
                    timestamp: self.clock.now(),
                    severity: Severity::Info,
                    message: format!("trade rejected: {reason}"),
                    context: None,
                })
                .await;
            return Ok(());
        }

        let (stop_loss, take_profit) = decision
            .stop_loss
            .zip(decision.take_profit)
            .unwrap_or_else(|| self.risk.calculate_stop_take_prices(snapshot.current_price, side));

        let request = OrderRequest {
            symbol: self.config.trading.symbol.clone(),
            side,
            order_type: OrderType::Market,
            quantity: size.quantity,
            price: None,
            stop_loss: Some(stop_loss),
            take_profit: Some(take_profit),
            reduce_only: false,
        };

        let order = self.exchange.place_order(request, self.clock.as_ref()).await.context("order placement failed")?;
        self.events.record_order(&order).await;

        let trade = Trade {
            id: Uuid::new_v4().to_string(),
            entry_snapshot_id: snapshot.timestamp.to_rfc3339(),
            entry_order_id: order.order_id,
            exit_order_id: None,
            entry_price: order.avg_price,
            exit_price: None,
            entry_time: order.timestamp,
            exit_time: None,
            quantity: order.quantity,
            side,
            pnl: None,
            pnl_percent: None,
            status: TradeStatus::Open,
            participating_models: decision.participating_models.clone(),
            agg_score: decision.agg_score,
        };
        self.risk.record_trade_opened(trade.clone(), self.clock.now());
        self.open_trades.fetch_add(1, Ordering::SeqCst);
        self.events.record_trade(&trade).await;
        self.broadcast.publish(BroadcastMessage::trade_opened(&self.config.trading.symbol, &trade));

        Ok(())
    }

    /// Drains fills the health-check loop observed since the last heartbeat
    /// and applies them here, so `RiskManager` mutation (close_trade, the
    /// breaker, the emergency-shutdown latch) stays owned by this single
    /// task (§5) even though reconciliation itself runs on its own cadence.
    async fn drain_fills(&self) {
        let mut rx = self.fills_rx.lock().await;
        while let Ok(order) = rx.try_recv() {
            if let Some(trade) = self.risk.close_trade(order.order_id, order.avg_price, self.clock.now()) {
                self.open_trades.fetch_sub(1, Ordering::SeqCst);
                let pnl = trade.pnl.unwrap_or(0.0);
                self.ensemble.record_outcome(&trade.participating_models, pnl > 0.0, trade.agg_score);
                info!(order_id = order.order_id, pnl, "trade closed on reconciliation");
            }
        }
    }

    /// Reconciles OrderStore against the exchange's view of open orders and
    /// hands any terminal fill to the heartbeat task over `fills_tx`; never
    /// touches `RiskManager` itself.
    async fn health_check_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.timing.health_check_interval_secs);
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.exchange.sync_open_orders(self.clock.as_ref()).await {
                Ok(open) => {
                    for order in open {
                        if order.status.is_terminal() && order.status == crate::model::OrderStatus::Filled {
                            let _ = self.fills_tx.send(order);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to reconcile open orders"),
            }

            tokio::select! {
                _ = self.clock.sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    /// Pushes a `StatusUpdate` every heartbeat interval; purely a read of
    /// shared state, never a mutation (§5).
    async fn broadcast_loop(self: Arc<Self>) {
        let interval = std::time::Duration::from_secs(self.config.timing.heartbeat_interval_secs.max(5));
        let mut shutdown = self.shutdown_rx.clone();

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.broadcast.publish(BroadcastMessage::StatusUpdate {
                timestamp: self.clock.now(),
                running: self.running.load(Ordering::SeqCst),
                open_trades: self.open_trades.load(Ordering::SeqCst),
                circuit_breaker_active: self.risk.circuit_breaker_active(self.clock.now()),
            });

            tokio::select! {
                _ = self.clock.sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}
