// =============================================================================
// ExchangeClient — HMAC-signed futures REST client, §4.4
// =============================================================================
//
// SECURITY: the secret is held only for signing and is never logged or
// serialized; signed requests send the key via the X-MBX-APIKEY header, as
// `binance/client.rs` does for spot.
// =============================================================================

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::error::CoordinatorError;
use crate::model::{OrderSide, OrderState, OrderStatus, OrderType};

use super::order_store::OrderStore;
use super::rate_limiter::RateLimiter;

type HmacSha256 = Hmac<Sha256>;

const RETRY_BASE_SECS: u64 = 1;
const RETRY_MIN_SECS: u64 = 2;
const RETRY_MAX_SECS: u64 = 30;
const RETRY_ATTEMPTS: u32 = 3;

/// Step/tick sizing extracted from `exchangeInfo` at `initialize()`.
#[derive(Debug, Clone, Copy)]
pub struct SymbolConfig {
    pub step_size: f64,
    pub quantity_precision: u32,
    pub tick_size: f64,
    pub price_precision: u32,
}

/// Balances relevant to risk sizing, read from `/fapi/v2/account`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountSnapshot {
    pub total_wallet_balance: f64,
    pub available_balance: f64,
    pub total_unrealized_profit: f64,
}

pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub reduce_only: bool,
}

pub struct ExchangeClient {
    api_key: String,
    secret: String,
    base_url: String,
    http: reqwest::Client,
    rate_limiter: RateLimiter,
    pub order_store: OrderStore,
    dry_run: bool,
    symbol: String,
    symbol_config: parking_lot::RwLock<Option<SymbolConfig>>,
}

impl ExchangeClient {
    pub async fn new(config: &AppConfig, clock: &dyn Clock) -> Result<Self> {
        let api_key = config.api_key().context("loading exchange api key")?;
        let secret = config.api_secret().context("loading exchange api secret")?;

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build exchange HTTP client")?;

        let order_store = OrderStore::connect(&config.database.sqlite_path)
            .await
            .context("failed to open order store")?;

        Ok(Self {
            api_key,
            secret,
            base_url: config.base_url().to_string(),
            http,
            rate_limiter: RateLimiter::new(&config.binance, clock.now_ms()),
            order_store,
            dry_run: config.dry_run,
            symbol: config.trading.symbol.clone(),
            symbol_config: parking_lot::RwLock::new(None),
        })
    }

    /// §4.4.5: fetch exchange info, extract LOT_SIZE/PRICE_FILTER for the
    /// configured symbol, set leverage and margin mode.
    #[instrument(skip(self, clock))]
    pub async fn initialize(&self, leverage: u32, margin_mode: &str, clock: &dyn Clock) -> Result<()> {
        let info = self.get_symbol_info(clock).await?;

        let filters = info["filters"].as_array().context("exchangeInfo missing filters")?;
        let mut step_size = 0.000_001;
        let mut tick_size = 0.01;
        for filter in filters {
            match filter["filterType"].as_str() {
                Some("LOT_SIZE") => {
                    if let Some(s) = filter["stepSize"].as_str() {
                        step_size = s.parse().unwrap_or(step_size);
                    }
                }
                Some("PRICE_FILTER") => {
                    if let Some(s) = filter["tickSize"].as_str() {
                        tick_size = s.parse().unwrap_or(tick_size);
                    }
                }
                _ => {}
            }
        }
        *self.symbol_config.write() = Some(SymbolConfig {
            step_size,
            quantity_precision: precision_of(step_size),
            tick_size,
            price_precision: precision_of(tick_size),
        });

        if let Err(e) = self.set_leverage(leverage, clock).await {
            warn!(error = %e, "failed to set leverage");
        }
        if let Err(e) = self.set_margin_type(margin_mode, clock).await {
            // Binance returns an error when margin type is already set to
            // the requested value; that case is expected and not worth a
            // warning.
            debug!(error = %e, "margin type unchanged (likely already set)");
        }

        info!(symbol = %self.symbol, step_size, tick_size, "exchange client initialized");
        Ok(())
    }

    pub fn symbol_config(&self) -> Option<SymbolConfig> {
        *self.symbol_config.read()
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before UNIX epoch").as_millis() as u64
    }

    /// R3: deterministic signing — sorted-key canonicalization before HMAC.
    fn signed_query(&self, mut params: Vec<(String, String)>) -> String {
        params.push(("timestamp".to_string(), Self::timestamp_ms().to_string()));
        params.sort_by(|a, b| a.0.cmp(&b.0));
        let base = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    // -------------------------------------------------------------------------
    // Retry wrapper
    // -------------------------------------------------------------------------

    /// §4.4.2 backoff: base 1, min 2s, max 30s, 3 attempts. HTTP >= 400 is
    /// non-retriable and surfaced immediately as `ApiError`.
    async fn send_with_retry<F, Fut>(&self, clock: &dyn Clock, request: F) -> Result<serde_json::Value>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match request().await {
                Ok(resp) => {
                    let status = resp.status();
                    let body: serde_json::Value = resp.json().await.context("failed to parse response body")?;
                    if status.as_u16() >= 400 {
                        bail!(CoordinatorError::Api {
                            code: status.as_u16(),
                            message: body.to_string(),
                        });
                    }
                    return Ok(body);
                }
                Err(e) if attempt < RETRY_ATTEMPTS => {
                    let backoff_secs = (RETRY_BASE_SECS * 2u64.pow(attempt - 1)).clamp(RETRY_MIN_SECS, RETRY_MAX_SECS);
                    warn!(attempt, error = %e, backoff_secs, "transient exchange I/O error, retrying");
                    clock.sleep(Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => return Err(e).context("exchange request failed after retries"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    #[instrument(skip(self, clock), name = "exchange::account_snapshot")]
    pub async fn account_snapshot(&self, clock: &dyn Clock) -> Result<AccountSnapshot> {
        self.rate_limiter.acquire_request(clock, 5.0).await;
        let qs = self.signed_query(vec![]);
        let url = format!("{}/fapi/v2/account?{qs}", self.base_url);
        let body = self.send_with_retry(clock, || self.http.get(&url).send()).await?;

        Ok(AccountSnapshot {
            total_wallet_balance: parse_f64(&body["totalWalletBalance"]),
            available_balance: parse_f64(&body["availableBalance"]),
            total_unrealized_profit: parse_f64(&body["totalUnrealizedProfit"]),
        })
    }

    async fn set_leverage(&self, leverage: u32, clock: &dyn Clock) -> Result<()> {
        self.rate_limiter.acquire_request(clock, 1.0).await;
        let qs = self.signed_query(vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("leverage".to_string(), leverage.to_string()),
        ]);
        let url = format!("{}/fapi/v1/leverage?{qs}", self.base_url);
        self.send_with_retry(clock, || self.http.post(&url).send()).await?;
        Ok(())
    }

    async fn set_margin_type(&self, margin_mode: &str, clock: &dyn Clock) -> Result<()> {
        self.rate_limiter.acquire_request(clock, 1.0).await;
        let qs = self.signed_query(vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("marginType".to_string(), margin_mode.to_string()),
        ]);
        let url = format!("{}/fapi/v1/marginType?{qs}", self.base_url);
        self.send_with_retry(clock, || self.http.post(&url).send()).await?;
        Ok(())
    }

    async fn get_symbol_info(&self, clock: &dyn Clock) -> Result<serde_json::Value> {
        self.rate_limiter.acquire_request(clock, 1.0).await;
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let body = self.send_with_retry(clock, || self.http.get(&url).send()).await?;
        let symbols = body["symbols"].as_array().context("exchangeInfo missing symbols")?;
        symbols
            .iter()
            .find(|s| s["symbol"].as_str() == Some(self.symbol.as_str()))
            .cloned()
            .with_context(|| format!("symbol {} not found in exchangeInfo", self.symbol))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// §4.4.3. Rounds quantity to `stepSize` and prices to `tickSize`, places
    /// the parent order, then (best-effort) the SL/TP children.
    #[instrument(skip(self, request, clock), fields(symbol = %request.symbol, side = ?request.side))]
    pub async fn place_order(&self, request: OrderRequest, clock: &dyn Clock) -> Result<OrderState> {
        if request.order_type == OrderType::Limit && request.price.is_none() {
            bail!(CoordinatorError::ValidationRejection("LIMIT order requires a price".to_string()));
        }

        let config = self.symbol_config().unwrap_or(SymbolConfig {
            step_size: 0.000_001,
            quantity_precision: 6,
            tick_size: 0.01,
            price_precision: 2,
        });
        let quantity = round_down_to_step(request.quantity, config.step_size, config.quantity_precision);
        let price = request.price.map(|p| round_to_tick(p, config.tick_size, config.price_precision));

        let order = if self.dry_run {
            self.synthesize_dry_run_order(&request, quantity, price, clock).await?
        } else {
            self.place_live_order(&request, quantity, price, clock).await?
        };

        self.order_store.save(&order).await.context("failed to persist parent order")?;

        let mut order = order;
        if let Some(stop_loss) = request.stop_loss {
            match self.place_child_order(&request, OrderType::StopMarket, stop_loss, clock).await {
                Ok(child_id) => order.stop_loss_order_id = Some(child_id),
                Err(e) => warn!(error = %e, "failed to place stop-loss child order"),
            }
        }
        if let Some(take_profit) = request.take_profit {
            match self.place_child_order(&request, OrderType::TakeProfitMarket, take_profit, clock).await {
                Ok(child_id) => order.take_profit_order_id = Some(child_id),
                Err(e) => warn!(error = %e, "failed to place take-profit child order"),
            }
        }
        if order.stop_loss_order_id.is_some() || order.take_profit_order_id.is_some() {
            self.order_store.save(&order).await.context("failed to persist child order links")?;
        }

        Ok(order)
    }

    async fn synthesize_dry_run_order(
        &self,
        request: &OrderRequest,
        quantity: f64,
        price: Option<f64>,
        clock: &dyn Clock,
    ) -> Result<OrderState> {
        Ok(OrderState {
            order_id: clock.now_ms(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity,
            price,
            status: OrderStatus::Filled,
            filled_qty: quantity,
            avg_price: price.unwrap_or(50_000.0),
            timestamp: clock.now(),
            stop_loss_order_id: None,
            take_profit_order_id: None,
        })
    }

    async fn place_live_order(
        &self,
        request: &OrderRequest,
        quantity: f64,
        price: Option<f64>,
        clock: &dyn Clock,
    ) -> Result<OrderState> {
        self.rate_limiter.acquire_order(clock).await;

        let mut params = vec![
            ("symbol".to_string(), request.symbol.clone()),
            ("side".to_string(), side_str(request.side).to_string()),
            ("type".to_string(), order_type_str(request.order_type).to_string()),
            ("quantity".to_string(), quantity.to_string()),
        ];
        if let Some(p) = price {
            params.push(("price".to_string(), p.to_string()));
            params.push(("timeInForce".to_string(), "GTC".to_string()));
        }
        if request.reduce_only {
            params.push(("reduceOnly".to_string(), "true".to_string()));
        }

        let qs = self.signed_query(params);
        let url = format!("{}/fapi/v1/order?{qs}", self.base_url);
        let body = self.send_with_retry(clock, || self.http.post(&url).send()).await?;

        Ok(OrderState {
            order_id: body["orderId"].as_i64().unwrap_or_default(),
            symbol: body["symbol"].as_str().unwrap_or(&request.symbol).to_string(),
            side: request.side,
            order_type: request.order_type,
            quantity: parse_f64_or(&body["origQty"], quantity),
            price,
            status: parse_order_status(body["status"].as_str().unwrap_or("NEW")),
            filled_qty: parse_f64(&body["executedQty"]),
            avg_price: parse_f64_or(&body["avgPrice"], 0.0),
            timestamp: clock.now(),
            stop_loss_order_id: None,
            take_profit_order_id: None,
        })
    }

    async fn place_child_order(
        &self,
        parent: &OrderRequest,
        order_type: OrderType,
        stop_price: f64,
        clock: &dyn Clock,
    ) -> Result<i64> {
        if self.dry_run {
            return Ok(clock.now_ms());
        }
        self.rate_limiter.acquire_order(clock).await;

        let opposite_side = match parent.side {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        };
        let params = vec![
            ("symbol".to_string(), parent.symbol.clone()),
            ("side".to_string(), side_str(opposite_side).to_string()),
            ("type".to_string(), order_type_str(order_type).to_string()),
            ("stopPrice".to_string(), stop_price.to_string()),
            ("closePosition".to_string(), "false".to_string()),
            ("reduceOnly".to_string(), "true".to_string()),
        ];
        let qs = self.signed_query(params);
        let url = format!("{}/fapi/v1/order?{qs}", self.base_url);
        let body = self.send_with_retry(clock, || self.http.post(&url).send()).await?;
        Ok(body["orderId"].as_i64().unwrap_or_default())
    }

    /// Best-effort cancellation, used by the coordinator's shutdown path
    /// when `safety.close_positions_on_shutdown` is set.
    pub async fn cancel_order(&self, order_id: i64, clock: &dyn Clock) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        self.rate_limiter.acquire_order(clock).await;
        let qs = self.signed_query(vec![
            ("symbol".to_string(), self.symbol.clone()),
            ("orderId".to_string(), order_id.to_string()),
        ]);
        let url = format!("{}/fapi/v1/order?{qs}", self.base_url);
        self.send_with_retry(clock, || self.http.delete(&url).send()).await?;
        Ok(())
    }

    /// Reconciles locally-tracked open orders against the exchange's view,
    /// consumed by the coordinator's health-check loop (`timing.order_check_interval`).
    pub async fn sync_open_orders(&self, clock: &dyn Clock) -> Result<Vec<OrderState>> {
        if self.dry_run {
            return Ok(self.order_store.load_all_open().await.unwrap_or_default());
        }
        self.rate_limiter.acquire_request(clock, 1.0).await;
        let qs = self.signed_query(vec![("symbol".to_string(), self.symbol.clone())]);
        let url = format!("{}/fapi/v1/openOrders?{qs}", self.base_url);
        let body = self.send_with_retry(clock, || self.http.get(&url).send()).await?;
        let entries = body.as_array().cloned().unwrap_or_default();

        let mut orders = Vec::with_capacity(entries.len());
        for entry in entries {
            let order = OrderState {
                order_id: entry["orderId"].as_i64().unwrap_or_default(),
                symbol: entry["symbol"].as_str().unwrap_or(&self.symbol).to_string(),
                side: if entry["side"].as_str() == Some("SELL") { OrderSide::Sell } else { OrderSide::Buy },
                order_type: match entry["type"].as_str() {
                    Some("LIMIT") => OrderType::Limit,
                    Some("STOP_MARKET") => OrderType::StopMarket,
                    Some("TAKE_PROFIT_MARKET") => OrderType::TakeProfitMarket,
                    _ => OrderType::Market,
                },
                quantity: parse_f64(&entry["origQty"]),
                price: entry["price"].as_str().and_then(|s| s.parse().ok()),
                status: parse_order_status(entry["status"].as_str().unwrap_or("NEW")),
                filled_qty: parse_f64(&entry["executedQty"]),
                avg_price: parse_f64(&entry["avgPrice"]),
                timestamp: clock.now(),
                stop_loss_order_id: None,
                take_profit_order_id: None,
            };
            if let Err(e) = self.order_store.save(&order).await {
                warn!(order_id = order.order_id, error = %e, "failed to persist reconciled order");
            }
            orders.push(order);
        }
        Ok(orders)
    }
}

fn side_str(side: OrderSide) -> &'static str {
    match side {
        OrderSide::Buy => "BUY",
        OrderSide::Sell => "SELL",
    }
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Market => "MARKET",
        OrderType::Limit => "LIMIT",
        OrderType::StopMarket => "STOP_MARKET",
        OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
    }
}

fn parse_order_status(s: &str) -> OrderStatus {
    match s {
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::New,
    }
}

fn parse_f64(value: &serde_json::Value) -> f64 {
    parse_f64_or(value, 0.0)
}

fn parse_f64_or(value: &serde_json::Value, default: f64) -> f64 {
    value
        .as_str()
        .and_then(|s| s.parse::<f64>().ok())
        .or_else(|| value.as_f64())
        .unwrap_or(default)
}

fn round_down_to_step(quantity: f64, step_size: f64, precision: u32) -> f64 {
    if step_size <= 0.0 {
        return quantity;
    }
    let steps = (quantity / step_size).floor();
    round_to_precision(steps * step_size, precision)
}

fn round_to_tick(price: f64, tick_size: f64, precision: u32) -> f64 {
    if tick_size <= 0.0 {
        return price;
    }
    let ticks = (price / tick_size).round();
    round_to_precision(ticks * tick_size, precision)
}

fn round_to_precision(value: f64, precision: u32) -> f64 {
    let factor = 10f64.powi(precision as i32);
    (value * factor).round() / factor
}

fn precision_of(step: f64) -> u32 {
    let s = format!("{step}");
    s.split('.').nth(1).map(|frac| frac.trim_end_matches('0').len() as u32).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_down_to_step_truncates_excess_precision() {
        assert!((round_down_to_step(0.02349, 0.001, 3) - 0.023).abs() < 1e-9);
    }

    #[test]
    fn round_to_tick_rounds_to_nearest() {
        assert!((round_to_tick(50_123.7, 0.1, 1) - 50_123.7).abs() < 1e-9);
        assert!((round_to_tick(50_123.74, 0.1, 1) - 50_123.7).abs() < 1e-9);
    }

    #[test]
    fn precision_of_step_size() {
        assert_eq!(precision_of(0.001), 3);
        assert_eq!(precision_of(1.0), 0);
    }

    /// R3: the same query params always produce the same signature.
    #[test]
    fn signing_is_deterministic_given_same_secret_and_params() {
        let mac1 = {
            let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
            mac.update(b"a=1&b=2");
            hex::encode(mac.finalize().into_bytes())
        };
        let mac2 = {
            let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
            mac.update(b"a=1&b=2");
            hex::encode(mac.finalize().into_bytes())
        };
        assert_eq!(mac1, mac2);
    }
}
