// =============================================================================
// Core data model — Snapshot, predictions, decisions, risk, orders, trades
// =============================================================================
//
// These types flow between every core component. They are intentionally
// plain data: no component-specific behaviour lives here beyond small
// constructors and the invariant-checking helpers each type documents in
// the design.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Snapshot
// -----------------------------------------------------------------------------

/// A single OHLCV candle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Closed set of well-known indicator names the core interprets. The wire
/// representation is a plain string key (`indicators` below is keyed by
/// `String` so unrecognized keys from the market-data collaborator
/// round-trip rather than failing deserialization); this enum exists only to
/// give call sites a typed, exhaustively-matched way to look one up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorName {
    Rsi14,
    EmaFast,
    EmaSlow,
    MacdLine,
    MacdSignal,
    MacdHistogram,
    BbUpper,
    BbMiddle,
    BbLower,
    BbWidth,
    BbPosition,
    Atr14,
    Obv,
    Adx14,
    CandleBullishRatio,
    Momentum,
}

impl IndicatorName {
    pub fn as_key(self) -> &'static str {
        match self {
            Self::Rsi14 => "rsi14",
            Self::EmaFast => "ema_fast",
            Self::EmaSlow => "ema_slow",
            Self::MacdLine => "macd_line",
            Self::MacdSignal => "macd_signal",
            Self::MacdHistogram => "macd_histogram",
            Self::BbUpper => "bb_upper",
            Self::BbMiddle => "bb_middle",
            Self::BbLower => "bb_lower",
            Self::BbWidth => "bb_width",
            Self::BbPosition => "bb_position",
            Self::Atr14 => "atr14",
            Self::Obv => "obv",
            Self::Adx14 => "adx14",
            Self::CandleBullishRatio => "candle_bullish_ratio",
            Self::Momentum => "momentum",
        }
    }
}

/// Market snapshot produced by the (external) market-data collaborator and
/// consumed by the core. `indicators` is opaque to the core beyond lookup by
/// key; the invariant `bid <= currentPrice <= ask` holds when both sides are
/// quoted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub current_price: f64,
    pub bid: f64,
    pub ask: f64,
    pub volume_24h: f64,
    pub price_change_24h: f64,
    pub candles_5m: Vec<Candle>,
    pub candles_1h: Vec<Candle>,
    pub indicators: HashMap<String, f64>,
}

impl Snapshot {
    pub fn indicator(&self, name: IndicatorName) -> Option<f64> {
        self.indicators.get(name.as_key()).copied()
    }
}

impl Snapshot {
    /// `bid <= currentPrice <= ask` whenever both sides are quoted (>0).
    pub fn has_consistent_quotes(&self) -> bool {
        if self.bid > 0.0 && self.ask > 0.0 {
            self.bid <= self.current_price && self.current_price <= self.ask
        } else {
            true
        }
    }
}

// -----------------------------------------------------------------------------
// ModelPrediction / ModelPerformance
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Long,
    Short,
    Hold,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

/// One model's response for a given snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPrediction {
    pub model_name: String,
    /// `host:port`, unique key for performance tracking.
    pub model_key: String,
    pub action: Action,
    pub confidence: f64,
    pub raw_score: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub latency_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Per-model adaptive performance state, kept in memory and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub model_key: String,
    pub base_weight: f64,
    pub success_count: u64,
    pub failure_count: u64,
    /// EWMA of response time in ms, alpha = 0.2.
    pub avg_response_time: f64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_updated: DateTime<Utc>,
    /// Bounded ring of recent trade outcomes attributed to this model.
    pub recent_outcomes: Vec<bool>,
    pub win_rate: f64,
    pub sharpe: Option<f64>,
    pub enabled: bool,
}

impl ModelPerformance {
    pub fn new(model_key: impl Into<String>, base_weight: f64, now: DateTime<Utc>) -> Self {
        Self {
            model_key: model_key.into(),
            base_weight,
            success_count: 0,
            failure_count: 0,
            avg_response_time: 0.0,
            last_success: None,
            last_updated: now,
            recent_outcomes: Vec::new(),
            win_rate: 0.0,
            sharpe: None,
            enabled: true,
        }
    }
}

// -----------------------------------------------------------------------------
// EnsembleDecision
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleDecision {
    pub action: Action,
    /// Calibrated confidence in [0, 1].
    pub confidence: f64,
    /// Expected value after estimated costs.
    pub expected_value: f64,
    /// stddev of raw scores across responding models.
    pub uncertainty: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub participating_models: Vec<String>,
    pub aggregation_method: String,
    pub reasoning: String,
    /// Raw weighted fusion score feeding the calibrator, carried onto the
    /// opened `Trade` so outcome feedback can retrain the calibrator.
    pub agg_score: Option<f64>,
}

impl EnsembleDecision {
    pub fn hold(reason: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            action: Action::Hold,
            confidence: 0.0,
            expected_value: 0.0,
            uncertainty: 0.0,
            stop_loss: None,
            take_profit: None,
            participating_models: Vec::new(),
            aggregation_method: method.into(),
            reasoning: reason.into(),
            agg_score: None,
        }
    }
}

// -----------------------------------------------------------------------------
// RiskMetrics / PositionSize
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub total_equity: f64,
    pub available_margin: f64,
    pub total_exposure: f64,
    pub open_positions: u32,
    pub daily_pnl: f64,
    pub daily_trades: u32,
    pub consecutive_losses: u32,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizeMethod {
    FixedFraction,
    Kelly,
    FixedAmount,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionSize {
    pub quantity: f64,
    pub size_usd: f64,
    pub leverage: u32,
    pub method: PositionSizeMethod,
    pub risk_percent: f64,
    pub kelly_fraction: Option<f64>,
}

// -----------------------------------------------------------------------------
// OrderState
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
    StopMarket,
    TakeProfitMarket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    /// Terminal states are never overwritten by a non-terminal update.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub timestamp: DateTime<Utc>,
    pub stop_loss_order_id: Option<i64>,
    pub take_profit_order_id: Option<i64>,
}

impl OrderState {
    /// P1: `0 <= filledQty <= quantity`, and `status=FILLED => filledQty=quantity`.
    pub fn satisfies_fill_invariant(&self) -> bool {
        let bounded = self.filled_qty >= 0.0 && self.filled_qty <= self.quantity;
        let filled_complete = self.status != OrderStatus::Filled || self.filled_qty == self.quantity;
        bounded && filled_complete
    }
}

// -----------------------------------------------------------------------------
// Trade
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub id: String,
    pub entry_snapshot_id: String,
    pub entry_order_id: i64,
    pub exit_order_id: Option<i64>,
    pub entry_price: f64,
    pub exit_price: Option<f64>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub quantity: f64,
    pub side: OrderSide,
    pub pnl: Option<f64>,
    pub pnl_percent: Option<f64>,
    pub status: TradeStatus,
    /// Models that agreed with the winning action on entry and the raw
    /// fusion score, carried through to outcome feedback on close.
    pub participating_models: Vec<String>,
    pub agg_score: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_quote_invariant_holds_with_spread() {
        let mut s = sample_snapshot();
        s.bid = 49990.0;
        s.ask = 50010.0;
        s.current_price = 50000.0;
        assert!(s.has_consistent_quotes());
    }

    #[test]
    fn snapshot_quote_invariant_ignored_when_no_quotes() {
        let mut s = sample_snapshot();
        s.bid = 0.0;
        s.ask = 0.0;
        assert!(s.has_consistent_quotes());
    }

    #[test]
    fn order_fill_invariant_rejects_partial_fill_marked_filled() {
        let mut o = sample_order();
        o.status = OrderStatus::Filled;
        o.filled_qty = 0.01;
        o.quantity = 0.02;
        assert!(!o.satisfies_fill_invariant());
    }

    #[test]
    fn order_fill_invariant_accepts_complete_fill() {
        let mut o = sample_order();
        o.status = OrderStatus::Filled;
        o.filled_qty = 0.02;
        o.quantity = 0.02;
        assert!(o.satisfies_fill_invariant());
    }

    fn sample_snapshot() -> Snapshot {
        Snapshot {
            timestamp: Utc::now(),
            symbol: "BTCUSDT".into(),
            current_price: 50000.0,
            bid: 49990.0,
            ask: 50010.0,
            volume_24h: 1000.0,
            price_change_24h: 0.0,
            candles_5m: vec![],
            candles_1h: vec![],
            indicators: HashMap::new(),
        }
    }

    fn sample_order() -> OrderState {
        OrderState {
            order_id: 1,
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 0.02,
            price: None,
            status: OrderStatus::New,
            filled_qty: 0.0,
            avg_price: 0.0,
            timestamp: Utc::now(),
            stop_loss_order_id: None,
            take_profit_order_id: None,
        }
    }
}
