// =============================================================================
// CsvEventSink — flat-file trade ledger for offline analysis
// =============================================================================
//
// Complements the SQL event store with a human-diffable CSV trail of closed
// trades, the record analysts actually want to pull into a spreadsheet.
// Appends are serialized through a mutex since `csv::Writer` is not `Sync`.
// =============================================================================

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::error;

use crate::events::{EventSink, SystemEvent};
use crate::model::{EnsembleDecision, ModelPrediction, OrderState, Snapshot, Trade};

pub struct CsvEventSink {
    path: PathBuf,
    writer: Mutex<()>,
}

impl CsvEventSink {
    pub fn new(csv_path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = csv_path.into();
        if !path.exists() {
            let mut wtr = csv::Writer::from_path(&path)?;
            wtr.write_record([
                "trade_id",
                "entry_order_id",
                "exit_order_id",
                "entry_price",
                "exit_price",
                "entry_time",
                "exit_time",
                "quantity",
                "side",
                "pnl",
                "pnl_percent",
                "status",
            ])?;
            wtr.flush()?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(()),
        })
    }

    fn append_trade(&self, trade: &Trade) -> anyhow::Result<()> {
        let _guard = self.writer.lock();
        let file = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        let mut wtr = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        wtr.write_record([
            trade.id.clone(),
            trade.entry_order_id.to_string(),
            trade.exit_order_id.map(|v| v.to_string()).unwrap_or_default(),
            trade.entry_price.to_string(),
            trade.exit_price.map(|v| v.to_string()).unwrap_or_default(),
            trade.entry_time.to_rfc3339(),
            trade.exit_time.map(|v| v.to_rfc3339()).unwrap_or_default(),
            trade.quantity.to_string(),
            format!("{:?}", trade.side),
            trade.pnl.map(|v| v.to_string()).unwrap_or_default(),
            trade.pnl_percent.map(|v| v.to_string()).unwrap_or_default(),
            format!("{:?}", trade.status),
        ])?;
        wtr.flush()?;
        Ok(())
    }
}

#[async_trait]
impl EventSink for CsvEventSink {
    async fn record_snapshot(&self, _snapshot: &Snapshot) {}
    async fn record_predictions(&self, _predictions: &[ModelPrediction]) {}
    async fn record_decision(&self, _decision: &EnsembleDecision) {}
    async fn record_order(&self, _order: &OrderState) {}

    async fn record_trade(&self, trade: &Trade) {
        if let Err(e) = self.append_trade(trade) {
            error!(error = %e, trade_id = %trade.id, "failed to append trade to CSV ledger");
        }
    }

    async fn record_event(&self, _event: SystemEvent) {}
}
