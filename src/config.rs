// =============================================================================
// Configuration — TOML document + env-sourced secrets
// =============================================================================
//
// `CONFIG_PATH` selects the document (default "config.toml"). Every field
// carries a serde default so that adding a field never breaks loading an
// older file — the same forward-compatibility posture as the JSON
// RuntimeConfig this is adapted from, just over a section-per-concern TOML
// document instead of one flat JSON blob.
//
// API credentials are never part of the document: `binance.api_key_env` /
// `binance.api_secret_env` name the environment variables that hold them.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::PositionSizeMethod;

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_leverage() -> u32 {
    5
}
fn default_margin_mode() -> String {
    "CROSSED".to_string()
}
fn default_position_size_method() -> PositionSizeMethod {
    PositionSizeMethod::FixedFraction
}
fn default_position_size_fraction() -> f64 {
    0.10
}
fn default_kelly_fraction() -> f64 {
    0.25
}
fn default_max_position_size_usd() -> f64 {
    1000.0
}
fn default_min_position_size_usd() -> f64 {
    10.0
}
fn default_max_open_positions() -> u32 {
    1
}
fn default_max_daily_trades() -> u32 {
    20
}
fn default_min_trade_interval_seconds() -> u64 {
    300
}
fn default_stop_loss_percent() -> f64 {
    0.02
}
fn default_take_profit_percent() -> f64 {
    0.05
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default = "default_margin_mode")]
    pub margin_mode: String,
    #[serde(default = "default_position_size_method")]
    pub position_size_method: PositionSizeMethod,
    #[serde(default = "default_position_size_fraction")]
    pub position_size_fraction: f64,
    #[serde(default = "default_kelly_fraction")]
    pub kelly_fraction: f64,
    #[serde(default = "default_max_position_size_usd")]
    pub max_position_size_usd: f64,
    #[serde(default = "default_min_position_size_usd")]
    pub min_position_size_usd: f64,
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    #[serde(default = "default_min_trade_interval_seconds")]
    pub min_trade_interval_seconds: u64,
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            leverage: default_leverage(),
            margin_mode: default_margin_mode(),
            position_size_method: default_position_size_method(),
            position_size_fraction: default_position_size_fraction(),
            kelly_fraction: default_kelly_fraction(),
            max_position_size_usd: default_max_position_size_usd(),
            min_position_size_usd: default_min_position_size_usd(),
            max_open_positions: default_max_open_positions(),
            max_daily_trades: default_max_daily_trades(),
            min_trade_interval_seconds: default_min_trade_interval_seconds(),
            stop_loss_percent: default_stop_loss_percent(),
            take_profit_percent: default_take_profit_percent(),
        }
    }
}

fn default_max_daily_loss_percent() -> f64 {
    0.10
}
fn default_max_daily_loss_usd() -> f64 {
    500.0
}
fn default_emergency_shutdown_loss_percent() -> f64 {
    0.20
}
fn default_max_total_exposure_usd() -> f64 {
    5000.0
}
fn default_max_leverage_allowed() -> u32 {
    5
}
fn default_circuit_breaker_consecutive_losses() -> u32 {
    5
}
fn default_circuit_breaker_cooldown_seconds() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    #[serde(default = "default_max_daily_loss_percent")]
    pub max_daily_loss_percent: f64,
    #[serde(default = "default_max_daily_loss_usd")]
    pub max_daily_loss_usd: f64,
    #[serde(default = "default_emergency_shutdown_loss_percent")]
    pub emergency_shutdown_loss_percent: f64,
    #[serde(default = "default_max_total_exposure_usd")]
    pub max_total_exposure_usd: f64,
    #[serde(default = "default_max_leverage_allowed")]
    pub max_leverage_allowed: u32,
    #[serde(default = "default_circuit_breaker_consecutive_losses")]
    pub circuit_breaker_consecutive_losses: u32,
    #[serde(default = "default_circuit_breaker_cooldown_seconds")]
    pub circuit_breaker_cooldown_seconds: u64,
    #[serde(default = "default_true")]
    pub circuit_breaker_reset_on_win: bool,
    #[serde(default)]
    pub close_positions_on_shutdown: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_percent: default_max_daily_loss_percent(),
            max_daily_loss_usd: default_max_daily_loss_usd(),
            emergency_shutdown_loss_percent: default_emergency_shutdown_loss_percent(),
            max_total_exposure_usd: default_max_total_exposure_usd(),
            max_leverage_allowed: default_max_leverage_allowed(),
            circuit_breaker_consecutive_losses: default_circuit_breaker_consecutive_losses(),
            circuit_breaker_cooldown_seconds: default_circuit_breaker_cooldown_seconds(),
            circuit_breaker_reset_on_win: true,
            close_positions_on_shutdown: false,
        }
    }
}

fn default_rate_limit_per_minute() -> u32 {
    1200
}
fn default_rate_limit_buffer() -> f64 {
    0.8
}
fn default_rate_limit_orders_per_10s() -> u32 {
    50
}
fn default_testnet_base_url() -> String {
    "https://testnet.binancefuture.com".to_string()
}
fn default_production_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_api_secret_env")]
    pub api_secret_env: String,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_rate_limit_buffer")]
    pub rate_limit_buffer: f64,
    #[serde(default = "default_rate_limit_orders_per_10s")]
    pub rate_limit_orders_per_10s: u32,
    #[serde(default = "default_testnet_base_url")]
    pub testnet_base_url: String,
    #[serde(default = "default_production_base_url")]
    pub production_base_url: String,
}

fn default_api_key_env() -> String {
    "BINANCE_API_KEY".to_string()
}
fn default_api_secret_env() -> String {
    "BINANCE_API_SECRET".to_string()
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            api_secret_env: default_api_secret_env(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            rate_limit_buffer: default_rate_limit_buffer(),
            rate_limit_orders_per_10s: default_rate_limit_orders_per_10s(),
            testnet_base_url: default_testnet_base_url(),
            production_base_url: default_production_base_url(),
        }
    }
}

fn default_method() -> String {
    "bayesian_weighted".to_string()
}
fn default_weight_decay_halflife_secs() -> u64 {
    24 * 3600
}
fn default_performance_window() -> usize {
    100
}
fn default_min_responding_models() -> usize {
    1
}
fn default_calibration_method() -> String {
    "isotonic".to_string()
}
fn default_confidence_threshold() -> f64 {
    0.55
}
fn default_uncertainty_threshold() -> f64 {
    0.30
}
fn default_expected_value_threshold() -> f64 {
    0.01
}
fn default_estimate_slippage_bps() -> f64 {
    2.0
}
fn default_maker_fee_bps() -> f64 {
    2.0
}
fn default_taker_fee_bps() -> f64 {
    4.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleConfig {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_weight_decay_halflife_secs")]
    pub weight_decay_halflife_secs: u64,
    #[serde(default = "default_performance_window")]
    pub performance_window: usize,
    #[serde(default = "default_min_responding_models")]
    pub min_responding_models: usize,
    #[serde(default = "default_calibration_method")]
    pub calibration_method: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_uncertainty_threshold")]
    pub uncertainty_threshold: f64,
    #[serde(default = "default_expected_value_threshold")]
    pub expected_value_threshold: f64,
    #[serde(default = "default_estimate_slippage_bps")]
    pub estimate_slippage_bps: f64,
    #[serde(default = "default_maker_fee_bps")]
    pub maker_fee_bps: f64,
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            weight_decay_halflife_secs: default_weight_decay_halflife_secs(),
            performance_window: default_performance_window(),
            min_responding_models: default_min_responding_models(),
            calibration_method: default_calibration_method(),
            confidence_threshold: default_confidence_threshold(),
            uncertainty_threshold: default_uncertainty_threshold(),
            expected_value_threshold: default_expected_value_threshold(),
            estimate_slippage_bps: default_estimate_slippage_bps(),
            maker_fee_bps: default_maker_fee_bps(),
            taker_fee_bps: default_taker_fee_bps(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEndpoint {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_endpoint_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_endpoint_weight() -> f64 {
    1.0
}

impl ModelEndpoint {
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        format!("http://{}:{}/predict", self.host, self.port)
    }
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}
fn default_model_timeout_secs() -> u64 {
    5
}
fn default_health_check_interval_secs() -> u64 {
    30
}
fn default_order_check_interval_secs() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_model_timeout_secs")]
    pub model_timeout_secs: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
    #[serde(default = "default_order_check_interval_secs")]
    pub order_check_interval_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            model_timeout_secs: default_model_timeout_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
            order_check_interval_secs: default_order_check_interval_secs(),
        }
    }
}

fn default_sqlite_path() -> String {
    "aurora_events.db".to_string()
}
fn default_csv_path() -> String {
    "aurora_trades.csv".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    #[serde(default = "default_csv_path")]
    pub csv_path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            csv_path: default_csv_path(),
        }
    }
}

/// Top-level configuration document loaded from `CONFIG_PATH` (default
/// `config.toml`). Every section carries field-level serde defaults so an
/// older or partial document still loads.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "default_true")]
    pub testnet: bool,
    #[serde(default)]
    pub binance: BinanceConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub model_endpoints: Vec<ModelEndpoint>,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

impl AppConfig {
    /// Load from the path named by `CONFIG_PATH`, falling back to
    /// `config.toml` in the working directory.
    pub fn load_from_env() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
        Self::load(&path)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.trading.symbol.is_empty() {
            bail!("trading.symbol must not be empty");
        }
        if self.trading.leverage == 0 {
            bail!("trading.leverage must be >= 1");
        }
        if self.model_endpoints.is_empty() {
            bail!("model_endpoints must name at least one model server");
        }
        Ok(())
    }

    /// Resolve the API key from the environment variable named by
    /// `binance.api_key_env`. Never logged.
    pub fn api_key(&self) -> Result<String> {
        std::env::var(&self.binance.api_key_env)
            .with_context(|| format!("environment variable {} not set", self.binance.api_key_env))
    }

    pub fn api_secret(&self) -> Result<String> {
        std::env::var(&self.binance.api_secret_env).with_context(|| {
            format!("environment variable {} not set", self.binance.api_secret_env)
        })
    }

    pub fn base_url(&self) -> &str {
        if self.testnet {
            &self.binance.testnet_base_url
        } else {
            &self.binance.production_base_url
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_fills_every_default() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.trading.symbol, "BTCUSDT");
        assert_eq!(cfg.safety.circuit_breaker_consecutive_losses, 5);
        assert_eq!(cfg.ensemble.method, "bayesian_weighted");
        assert!(cfg.testnet);
        assert!(!cfg.dry_run);
    }

    #[test]
    fn partial_document_overrides_only_named_fields() {
        let toml_str = r#"
            dry_run = true

            [trading]
            symbol = "ETHUSDT"
            leverage = 10
        "#;
        let cfg: AppConfig = toml::from_str(toml_str).unwrap();
        assert!(cfg.dry_run);
        assert_eq!(cfg.trading.symbol, "ETHUSDT");
        assert_eq!(cfg.trading.leverage, 10);
        assert_eq!(cfg.trading.stop_loss_percent, 0.02);
    }

    #[test]
    fn model_endpoint_key_and_url() {
        let ep = ModelEndpoint {
            name: "alpha".into(),
            host: "127.0.0.1".into(),
            port: 9001,
            weight: 1.0,
            enabled: true,
        };
        assert_eq!(ep.key(), "127.0.0.1:9001");
        assert_eq!(ep.url(), "http://127.0.0.1:9001/predict");
    }

    #[test]
    fn validate_rejects_empty_model_endpoints() {
        let cfg = AppConfig {
            model_endpoints: vec![],
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
