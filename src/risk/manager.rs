// =============================================================================
// RiskManager — sizing, validation, circuit breaker, emergency shutdown
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{error, warn};

use crate::config::{SafetyConfig, TradingConfig};
use crate::model::{OrderSide, PositionSize, RiskMetrics, Trade, TradeStatus};

use super::circuit_breaker::CircuitBreaker;
use super::sizing::{self, KellyStats, SizingInputs};

const SECONDS_PER_DAY: i64 = 86_400;

struct State {
    daily_pnl: f64,
    daily_trade_count: u32,
    daily_reset_at: DateTime<Utc>,
    last_trade_at: Option<DateTime<Utc>>,
    initial_equity: Option<f64>,
    trades: Vec<Trade>,
}

pub struct RiskManager {
    trading: TradingConfig,
    safety: SafetyConfig,
    breaker: CircuitBreaker,
    emergency_shutdown: AtomicBool,
    state: RwLock<State>,
}

impl RiskManager {
    pub fn new(trading: TradingConfig, safety: SafetyConfig, now: DateTime<Utc>) -> Self {
        let breaker = CircuitBreaker::new(
            safety.circuit_breaker_consecutive_losses,
            safety.circuit_breaker_cooldown_seconds,
            safety.circuit_breaker_reset_on_win,
        );
        Self {
            trading,
            safety,
            breaker,
            emergency_shutdown: AtomicBool::new(false),
            state: RwLock::new(State {
                daily_pnl: 0.0,
                daily_trade_count: 0,
                daily_reset_at: now,
                last_trade_at: None,
                initial_equity: None,
                trades: Vec::new(),
            }),
        }
    }

    pub fn update_initial_equity(&self, equity: f64) {
        let mut state = self.state.write();
        if state.initial_equity.is_none() {
            state.initial_equity = Some(equity);
        }
    }

    pub fn circuit_breaker_active(&self, now: DateTime<Utc>) -> bool {
        self.breaker.is_active(now)
    }

    pub fn emergency_shutdown_active(&self) -> bool {
        self.emergency_shutdown.load(Ordering::SeqCst)
    }

    pub fn calculate_position_size(
        &self,
        current_price: f64,
        account_balance: f64,
        leverage: u32,
        kelly_stats: Option<KellyStats>,
    ) -> PositionSize {
        let inputs = SizingInputs {
            method: self.trading.position_size_method,
            position_size_fraction: self.trading.position_size_fraction,
            kelly_fraction: self.trading.kelly_fraction,
            max_position_size_usd: self.trading.max_position_size_usd,
            min_position_size_usd: self.trading.min_position_size_usd,
            max_leverage: self.safety.max_leverage_allowed,
        };
        sizing::calculate_position_size(&inputs, current_price, account_balance, leverage, kelly_stats)
    }

    pub fn calculate_stop_take_prices(&self, entry_price: f64, side: OrderSide) -> (f64, f64) {
        sizing::calculate_stop_take_prices(
            entry_price,
            side == OrderSide::Buy,
            self.trading.stop_loss_percent,
            self.trading.take_profit_percent,
        )
    }

    /// §4.3.2 ordered rejection rules — first match wins (P6).
    pub fn validate_trade(
        &self,
        risk_metrics: &RiskMetrics,
        proposed_size_usd: f64,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        if self.emergency_shutdown_active() {
            return Err("emergency shutdown active".to_string());
        }

        if self.breaker.is_active(now) {
            return Err(format!(
                "circuit breaker open (cooldown: {}s remaining)",
                self.breaker.cooldown_remaining_secs(now)
            ));
        }

        self.reset_daily_metrics_if_needed(now);

        let state = self.state.read();

        if state.daily_trade_count >= self.trading.max_daily_trades {
            return Err(format!("daily trade limit reached ({})", self.trading.max_daily_trades));
        }

        if let Some(initial_equity) = state.initial_equity {
            if initial_equity > 0.0 {
                let daily_loss_pct = state.daily_pnl.abs() / initial_equity;
                if state.daily_pnl < 0.0 && daily_loss_pct > self.safety.max_daily_loss_percent {
                    return Err(format!(
                        "daily loss limit exceeded ({:.1}% > {:.1}%)",
                        daily_loss_pct * 100.0,
                        self.safety.max_daily_loss_percent * 100.0
                    ));
                }
            }
        }

        if state.daily_pnl < -self.safety.max_daily_loss_usd {
            return Err(format!(
                "daily loss limit exceeded (${:.2} > ${:.2})",
                state.daily_pnl.abs(),
                self.safety.max_daily_loss_usd
            ));
        }

        if risk_metrics.open_positions >= self.trading.max_open_positions {
            return Err(format!("max open positions reached ({})", self.trading.max_open_positions));
        }

        let new_exposure = risk_metrics.total_exposure + proposed_size_usd;
        if new_exposure > self.safety.max_total_exposure_usd {
            return Err(format!(
                "total exposure limit exceeded (${new_exposure:.2} > ${:.2})",
                self.safety.max_total_exposure_usd
            ));
        }

        if let Some(last_trade_at) = state.last_trade_at {
            let elapsed = (now - last_trade_at).num_seconds();
            let min_interval = self.trading.min_trade_interval_seconds as i64;
            if elapsed < min_interval {
                return Err(format!(
                    "trade interval cooldown ({}s remaining)",
                    min_interval - elapsed
                ));
            }
        }

        if proposed_size_usd > risk_metrics.available_margin {
            return Err(format!(
                "insufficient margin (${:.2} < ${proposed_size_usd:.2})",
                risk_metrics.available_margin
            ));
        }

        Ok(())
    }

    pub fn record_trade_opened(&self, trade: Trade, now: DateTime<Utc>) {
        let mut state = self.state.write();
        state.last_trade_at = Some(now);
        state.daily_trade_count += 1;
        state.trades.push(trade);
    }

    /// Close the most recent open trade matching `entry_order_id`, updating
    /// daily PnL, the circuit breaker, and checking the emergency-shutdown
    /// threshold. Returns the closed trade (with `pnl`/`pnl_percent` filled
    /// in) so the caller can feed outcome feedback back to the aggregator.
    pub fn close_trade(&self, entry_order_id: i64, exit_price: f64, now: DateTime<Utc>) -> Option<Trade> {
        let mut state = self.state.write();
        let trade = state
            .trades
            .iter_mut()
            .rev()
            .find(|t| t.entry_order_id == entry_order_id && t.status == TradeStatus::Open)?;

        let pnl = match trade.side {
            OrderSide::Buy => (exit_price - trade.entry_price) * trade.quantity,
            OrderSide::Sell => (trade.entry_price - exit_price) * trade.quantity,
        };
        let denom = trade.entry_price * trade.quantity;
        let pnl_percent = if denom > 0.0 { pnl / denom } else { 0.0 };

        trade.exit_price = Some(exit_price);
        trade.exit_time = Some(now);
        trade.pnl = Some(pnl);
        trade.pnl_percent = Some(pnl_percent);
        trade.status = TradeStatus::Closed;
        let closed = trade.clone();

        state.daily_pnl += pnl;
        let initial_equity = state.initial_equity;
        drop(state);

        if pnl < 0.0 {
            warn!(pnl, "loss recorded");
        }
        self.breaker.record_trade_outcome(pnl, now);

        if let Some(initial_equity) = initial_equity {
            if initial_equity > 0.0 {
                let state = self.state.read();
                let total_loss_pct = -state.daily_pnl / initial_equity;
                drop(state);
                if total_loss_pct >= self.safety.emergency_shutdown_loss_percent {
                    self.trigger_emergency_shutdown(total_loss_pct);
                }
            }
        }

        Some(closed)
    }

    fn trigger_emergency_shutdown(&self, loss_pct: f64) {
        self.emergency_shutdown.store(true, Ordering::SeqCst);
        error!(
            loss_pct = loss_pct * 100.0,
            threshold_pct = self.safety.emergency_shutdown_loss_percent * 100.0,
            "EMERGENCY SHUTDOWN TRIGGERED"
        );
    }

    /// §4.3.5: reset daily counters after 24h; consecutive losses and
    /// breaker state are explicitly NOT touched here.
    fn reset_daily_metrics_if_needed(&self, now: DateTime<Utc>) {
        let mut state = self.state.write();
        if (now - state.daily_reset_at).num_seconds() >= SECONDS_PER_DAY {
            state.daily_reset_at = now;
            state.daily_pnl = 0.0;
            state.daily_trade_count = 0;
        }
    }

    /// Win rate and a simplified Sharpe ratio over all closed trades,
    /// consumed both for status reporting and as Kelly inputs.
    pub fn performance_stats(&self) -> (f64, Option<f64>, f64, f64) {
        let state = self.state.read();
        let closed: Vec<&Trade> = state.trades.iter().filter(|t| t.status == TradeStatus::Closed).collect();
        if closed.is_empty() {
            return (0.0, None, 0.0, 0.0);
        }
        let wins: Vec<f64> = closed.iter().filter_map(|t| t.pnl_percent).filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = closed.iter().filter_map(|t| t.pnl_percent).filter(|p| *p < 0.0).collect();
        let win_rate = wins.len() as f64 / closed.len() as f64;
        let avg_win = if wins.is_empty() { 0.0 } else { wins.iter().sum::<f64>() / wins.len() as f64 };
        let avg_loss = if losses.is_empty() { 0.0 } else { losses.iter().map(|l| l.abs()).sum::<f64>() / losses.len() as f64 };

        let returns: Vec<f64> = closed.iter().filter_map(|t| t.pnl_percent).collect();
        let sharpe = if returns.len() > 1 {
            let mean = returns.iter().sum::<f64>() / returns.len() as f64;
            let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
            let std = variance.sqrt();
            if std > 0.0 { Some(mean / std) } else { Some(0.0) }
        } else {
            None
        };

        (win_rate, sharpe, avg_win, avg_loss)
    }

    pub fn daily_snapshot(&self) -> (f64, u32) {
        let state = self.state.read();
        (state.daily_pnl, state.daily_trade_count)
    }

    /// Sum of notional value across still-open trades, fed to rule 7 of
    /// `validate_trade` (total exposure limit) by the caller.
    pub fn open_exposure_usd(&self) -> f64 {
        let state = self.state.read();
        state
            .trades
            .iter()
            .filter(|t| t.status == TradeStatus::Open)
            .map(|t| t.entry_price * t.quantity)
            .sum()
    }

    pub fn consecutive_losses(&self) -> u32 {
        self.breaker.consecutive_losses()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PositionSizeMethod;

    fn risk_manager() -> RiskManager {
        let trading = TradingConfig {
            max_daily_trades: 20,
            max_open_positions: 1,
            min_trade_interval_seconds: 0,
            position_size_method: PositionSizeMethod::FixedFraction,
            ..TradingConfig::default()
        };
        let safety = SafetyConfig::default();
        RiskManager::new(trading, safety, Utc::now())
    }

    fn metrics() -> RiskMetrics {
        RiskMetrics {
            total_equity: 10_000.0,
            available_margin: 10_000.0,
            total_exposure: 0.0,
            open_positions: 0,
            daily_pnl: 0.0,
            daily_trades: 0,
            consecutive_losses: 0,
            win_rate: 0.0,
        }
    }

    #[test]
    fn validate_accepts_within_all_limits() {
        let rm = risk_manager();
        let result = rm.validate_trade(&metrics(), 500.0, Utc::now());
        assert!(result.is_ok());
    }

    #[test]
    fn emergency_shutdown_rejects_everything() {
        let rm = risk_manager();
        rm.emergency_shutdown.store(true, Ordering::SeqCst);
        let err = rm.validate_trade(&metrics(), 10.0, Utc::now()).unwrap_err();
        assert!(err.contains("emergency shutdown"));
    }

    #[test]
    fn open_position_limit_is_enforced() {
        let rm = risk_manager();
        let mut m = metrics();
        m.open_positions = 1;
        let err = rm.validate_trade(&m, 10.0, Utc::now()).unwrap_err();
        assert!(err.contains("open positions"));
    }

    #[test]
    fn emergency_shutdown_trips_past_threshold() {
        let rm = risk_manager();
        rm.update_initial_equity(10_000.0);
        let now = Utc::now();
        let trade = Trade {
            id: "t1".into(),
            entry_snapshot_id: "s1".into(),
            entry_order_id: 1,
            exit_order_id: None,
            entry_price: 50_000.0,
            exit_price: None,
            entry_time: now,
            exit_time: None,
            quantity: 0.4,
            side: OrderSide::Buy,
            pnl: None,
            pnl_percent: None,
            status: TradeStatus::Open,
            participating_models: Vec::new(),
            agg_score: None,
        };
        rm.record_trade_opened(trade, now);
        // 0.4 BTC * $5000 drop = $2000 loss = 20% of 10k equity.
        rm.close_trade(1, 45_000.0, now);
        assert!(rm.emergency_shutdown_active());
    }
}
