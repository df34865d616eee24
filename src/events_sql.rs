// =============================================================================
// SqlEventSink — schema-v2 SQLite event store
// =============================================================================
//
// Every append is its own short transaction, matching the OrderStore's
// short-transaction policy (§5). Tables are created idempotently on first
// use so a fresh `database.sqlite_path` just works.
// =============================================================================

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{error, instrument};

use crate::events::{EventSink, Severity, SystemEvent};
use crate::model::{EnsembleDecision, ModelPrediction, OrderState, Snapshot, Trade};

pub struct SqlEventSink {
    pool: SqlitePool,
}

impl SqlEventSink {
    pub async fn connect(sqlite_path: &str) -> anyhow::Result<Self> {
        let url = format!("sqlite://{sqlite_path}?mode=rwc");
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&url).await?;
        let sink = Self { pool };
        sink.init_schema().await?;
        Ok(sink)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                current_price REAL NOT NULL,
                payload TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS predictions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                model_key TEXT NOT NULL,
                action TEXT NOT NULL,
                confidence REAL NOT NULL,
                payload TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                action TEXT NOT NULL,
                confidence REAL NOT NULL,
                expected_value REAL NOT NULL,
                payload TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS orders (
                order_id INTEGER PRIMARY KEY,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS trades (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS system_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                severity TEXT NOT NULL,
                message TEXT NOT NULL,
                context TEXT
            )"#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// P1/P2 guard: read the currently stored status for `order_id`, if any.
    async fn existing_status(&self, order_id: i64) -> Option<String> {
        sqlx::query("SELECT status FROM orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .ok()
            .flatten()
            .map(|row| row.get::<String, _>("status"))
    }
}

#[async_trait]
impl EventSink for SqlEventSink {
    #[instrument(skip(self, snapshot))]
    async fn record_snapshot(&self, snapshot: &Snapshot) {
        let payload = serde_json::to_string(snapshot).unwrap_or_default();
        let res = sqlx::query(
            "INSERT INTO snapshots (timestamp, symbol, current_price, payload) VALUES (?, ?, ?, ?)",
        )
        .bind(snapshot.timestamp.to_rfc3339())
        .bind(&snapshot.symbol)
        .bind(snapshot.current_price)
        .bind(payload)
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            error!(error = %e, "failed to persist snapshot");
        }
    }

    async fn record_predictions(&self, predictions: &[ModelPrediction]) {
        for p in predictions {
            let payload = serde_json::to_string(p).unwrap_or_default();
            let res = sqlx::query(
                "INSERT INTO predictions (timestamp, model_key, action, confidence, payload) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(p.timestamp.to_rfc3339())
            .bind(&p.model_key)
            .bind(p.action.to_string())
            .bind(p.confidence)
            .bind(payload)
            .execute(&self.pool)
            .await;
            if let Err(e) = res {
                error!(error = %e, model_key = %p.model_key, "failed to persist prediction");
            }
        }
    }

    async fn record_decision(&self, decision: &EnsembleDecision) {
        let payload = serde_json::to_string(decision).unwrap_or_default();
        let res = sqlx::query(
            "INSERT INTO decisions (timestamp, action, confidence, expected_value, payload) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(chrono::Utc::now().to_rfc3339())
        .bind(decision.action.to_string())
        .bind(decision.confidence)
        .bind(decision.expected_value)
        .bind(payload)
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            error!(error = %e, "failed to persist decision");
        }
    }

    async fn record_order(&self, order: &OrderState) {
        // Mirrors OrderStore's P2 guard so the audit trail never regresses a
        // terminal status either, even though OrderStore is the source of
        // truth for order state.
        if let Some(existing) = self.existing_status(order.order_id).await {
            let existing_terminal = matches!(
                existing.as_str(),
                "FILLED" | "CANCELED" | "REJECTED" | "EXPIRED"
            );
            if existing_terminal && !order.status.is_terminal() {
                error!(order_id = order.order_id, "dropped non-terminal update over terminal order event");
                return;
            }
        }

        let payload = serde_json::to_string(order).unwrap_or_default();
        let res = sqlx::query(
            "INSERT INTO orders (order_id, status, payload, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(order_id) DO UPDATE SET status = excluded.status, payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(order.order_id)
        .bind(format!("{:?}", order.status).to_uppercase())
        .bind(payload)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            error!(error = %e, order_id = order.order_id, "failed to persist order event");
        }
    }

    async fn record_trade(&self, trade: &Trade) {
        let payload = serde_json::to_string(trade).unwrap_or_default();
        let res = sqlx::query(
            "INSERT INTO trades (id, status, payload, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, payload = excluded.payload, updated_at = excluded.updated_at",
        )
        .bind(&trade.id)
        .bind(format!("{:?}", trade.status).to_uppercase())
        .bind(payload)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            error!(error = %e, trade_id = %trade.id, "failed to persist trade");
        }
    }

    async fn record_event(&self, event: SystemEvent) {
        let severity = match event.severity {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        let context = event.context.map(|c| c.to_string());
        let res = sqlx::query(
            "INSERT INTO system_events (timestamp, severity, message, context) VALUES (?, ?, ?, ?)",
        )
        .bind(event.timestamp.to_rfc3339())
        .bind(severity)
        .bind(&event.message)
        .bind(context)
        .execute(&self.pool)
        .await;
        if let Err(e) = res {
            error!(error = %e, "failed to persist system event");
        }
    }
}
