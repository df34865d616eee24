// =============================================================================
// MarketData — external collaborator interface, §2/§4.1
// =============================================================================
//
// The coordinator never computes indicators itself; it consumes whatever
// `MarketData::snapshot()` hands back. `HttpMarketData` is a minimal
// HTTP-backed implementation (polls Binance's public klines/ticker endpoints
// directly, no signing required) good enough to run the coordinator
// standalone — a richer market-data service with its own indicator pipeline
// is expected to implement the same trait in production.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use crate::model::{Candle, Snapshot};

#[async_trait]
pub trait MarketData: Send + Sync {
    async fn initialize(&self) -> Result<()>;
    async fn snapshot(&self, symbol: &str) -> Result<Snapshot>;
}

pub struct HttpMarketData {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMarketData {
    pub fn new(testnet: bool) -> Self {
        let base_url = if testnet {
            "https://testnet.binancefuture.com".to_string()
        } else {
            "https://fapi.binance.com".to_string()
        };
        Self { base_url, http: reqwest::Client::new() }
    }

    async fn fetch_candles(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let url = format!("{}/fapi/v1/klines?symbol={symbol}&interval={interval}&limit={limit}", self.base_url);
        let body: serde_json::Value = self.http.get(&url).send().await?.json().await?;
        let raw = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 6 {
                continue;
            }
            let open_time = arr[0].as_i64().unwrap_or(0);
            candles.push(Candle {
                open_time: Utc.timestamp_millis_opt(open_time).single().unwrap_or_else(Utc::now),
                open: parse_f64(&arr[1]),
                high: parse_f64(&arr[2]),
                low: parse_f64(&arr[3]),
                close: parse_f64(&arr[4]),
                volume: parse_f64(&arr[5]),
            });
        }
        Ok(candles)
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<(f64, f64, f64)> {
        let url = format!("{}/fapi/v1/ticker/24hr?symbol={symbol}", self.base_url);
        let body: serde_json::Value = self.http.get(&url).send().await?.json().await?;
        Ok((
            parse_f64(&body["lastPrice"]),
            parse_f64(&body["priceChangePercent"]) / 100.0,
            parse_f64(&body["volume"]),
        ))
    }

    async fn fetch_book_ticker(&self, symbol: &str) -> Result<(f64, f64)> {
        let url = format!("{}/fapi/v1/ticker/bookTicker?symbol={symbol}", self.base_url);
        let body: serde_json::Value = self.http.get(&url).send().await?.json().await?;
        Ok((parse_f64(&body["bidPrice"]), parse_f64(&body["askPrice"])))
    }
}

#[async_trait]
impl MarketData for HttpMarketData {
    async fn initialize(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/ping", self.base_url);
        self.http.get(&url).send().await.context("market-data ping failed")?;
        Ok(())
    }

    async fn snapshot(&self, symbol: &str) -> Result<Snapshot> {
        let (current_price, price_change_24h, volume_24h) = self.fetch_ticker(symbol).await?;
        let (bid, ask) = self.fetch_book_ticker(symbol).await?;
        let candles_5m = self.fetch_candles(symbol, "5m", 100).await?;
        let candles_1h = self.fetch_candles(symbol, "1h", 100).await?;

        Ok(Snapshot {
            timestamp: Utc::now(),
            symbol: symbol.to_string(),
            current_price,
            bid,
            ask,
            volume_24h,
            price_change_24h,
            candles_5m,
            candles_1h,
            indicators: HashMap::new(),
        })
    }
}

fn parse_f64(value: &serde_json::Value) -> f64 {
    value.as_str().and_then(|s| s.parse().ok()).or_else(|| value.as_f64()).unwrap_or(0.0)
}
