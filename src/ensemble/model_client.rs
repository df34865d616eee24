// =============================================================================
// ModelClient — single model-server HTTP call with timeout + latency
// =============================================================================

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{instrument, warn};

use crate::config::ModelEndpoint;
use crate::model::{ModelPrediction, Snapshot};

#[derive(Serialize)]
struct PredictRequest<'a> {
    symbol: &'a str,
    current_price: f64,
    snapshot: &'a Snapshot,
}

pub struct ModelClient {
    http: reqwest::Client,
}

impl ModelClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .build()
                .expect("reqwest client builder never fails with default config"),
        }
    }

    /// Call one model endpoint with a hard per-request timeout. Any timeout,
    /// transport error, or malformed response is surfaced as `Err` — the
    /// aggregator's fan-out records it as a failure and moves on.
    #[instrument(skip(self, snapshot), fields(endpoint = %endpoint.key()))]
    pub async fn predict(
        &self,
        endpoint: &ModelEndpoint,
        snapshot: &Snapshot,
        timeout: Duration,
    ) -> Result<ModelPrediction> {
        let started = Instant::now();
        let request = PredictRequest {
            symbol: &snapshot.symbol,
            current_price: snapshot.current_price,
            snapshot,
        };

        let response = tokio::time::timeout(
            timeout,
            self.http.post(endpoint.url()).json(&request).send(),
        )
        .await
        .context("model request timed out")?
        .context("model request transport error")?;

        if !response.status().is_success() {
            warn!(status = %response.status(), "model server returned non-success status");
            anyhow::bail!("model server returned status {}", response.status());
        }

        let mut prediction: ModelPrediction = response
            .json()
            .await
            .context("model server returned malformed prediction body")?;

        prediction.model_key = endpoint.key();
        prediction.latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        prediction.timestamp = Utc::now();
        Ok(prediction)
    }
}

impl Default for ModelClient {
    fn default() -> Self {
        Self::new()
    }
}
