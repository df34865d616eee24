// =============================================================================
// OrderStore — sqlx-backed source of truth for order state, §5
// =============================================================================
//
// Unlike SqlEventSink's `orders` table (an append-only audit copy),
// OrderStore is what the coordinator reads back to decide whether an order
// still needs reconciling. Every save is its own short transaction; P2 is
// enforced here as the authoritative guard, SqlEventSink's copy is
// defense-in-depth only.
// =============================================================================

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::error;

use crate::model::{OrderSide, OrderState, OrderStatus, OrderType};

pub struct OrderStore {
    pool: SqlitePool,
}

impl OrderStore {
    pub async fn connect(sqlite_path: &str) -> anyhow::Result<Self> {
        let pool = if sqlite_path == ":memory:" {
            SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?
        } else {
            let url = format!("sqlite://{sqlite_path}?mode=rwc");
            SqlitePoolOptions::new().max_connections(5).connect(&url).await?
        };
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS order_state (
                order_id INTEGER PRIMARY KEY,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                quantity REAL NOT NULL,
                price REAL,
                status TEXT NOT NULL,
                filled_qty REAL NOT NULL,
                avg_price REAL NOT NULL,
                timestamp TEXT NOT NULL,
                stop_loss_order_id INTEGER,
                take_profit_order_id INTEGER
            )"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// R1: `load(orderId)` after `save(order)` returns a value equal to
    /// `order` (modulo terminal-state guard below).
    pub async fn load(&self, order_id: i64) -> anyhow::Result<Option<OrderState>> {
        let row = sqlx::query("SELECT * FROM order_state WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_order(&r)))
    }

    pub async fn load_all_open(&self) -> anyhow::Result<Vec<OrderState>> {
        let status_values: Vec<&str> = vec!["NEW", "PARTIALLY_FILLED"];
        let rows = sqlx::query("SELECT * FROM order_state WHERE status IN (?, ?)")
            .bind(status_values[0])
            .bind(status_values[1])
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_order).collect())
    }

    /// P2: a terminal status is never overwritten by a non-terminal update.
    /// Each save is a short, independent transaction (no long-lived locks).
    pub async fn save(&self, order: &OrderState) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;

        let existing_status: Option<String> = sqlx::query("SELECT status FROM order_state WHERE order_id = ?")
            .bind(order.order_id)
            .fetch_optional(&mut *tx)
            .await?
            .map(|r| r.get::<String, _>("status"));

        if let Some(existing) = existing_status {
            let existing_terminal = status_is_terminal(&existing);
            if existing_terminal && !order.status.is_terminal() {
                error!(
                    order_id = order.order_id,
                    existing, "refusing to downgrade terminal order state (P2)"
                );
                tx.rollback().await?;
                return Ok(());
            }
        }

        sqlx::query(
            r#"INSERT INTO order_state
                (order_id, symbol, side, order_type, quantity, price, status, filled_qty, avg_price, timestamp, stop_loss_order_id, take_profit_order_id)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(order_id) DO UPDATE SET
                 status = excluded.status,
                 filled_qty = excluded.filled_qty,
                 avg_price = excluded.avg_price,
                 timestamp = excluded.timestamp,
                 stop_loss_order_id = excluded.stop_loss_order_id,
                 take_profit_order_id = excluded.take_profit_order_id"#,
        )
        .bind(order.order_id)
        .bind(&order.symbol)
        .bind(side_str(order.side))
        .bind(order_type_str(order.order_type))
        .bind(order.quantity)
        .bind(order.price)
        .bind(status_str(order.status))
        .bind(order.filled_qty)
        .bind(order.avg_price)
        .bind(order.timestamp.to_rfc3339())
        .bind(order.stop_loss_order_id)
        .bind(order.take_profit_order_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn status_is_terminal(status: &str) -> bool {
    matches!(status, "FILLED" | "CANCELED" | "REJECTED" | "EXPIRED")
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

fn status_str(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::New => "NEW",
        OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
        OrderStatus::Filled => "FILLED",
        OrderStatus::Canceled => "CANCELED",
        OrderStatus::Rejected => "REJECTED",
        OrderStatus::Expired => "EXPIRED",
    }
}

fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> OrderState {
    let side = match row.get::<String, _>("side").as_str() {
        "SELL" => OrderSide::Sell,
        _ => OrderSide::Buy,
    };
    let order_type = match row.get::<String, _>("order_type").as_str() {
        "LIMIT" => OrderType::Limit,
        "STOP_MARKET" => OrderType::StopMarket,
        "TAKE_PROFIT_MARKET" => OrderType::TakeProfitMarket,
        _ => OrderType::Market,
    };
    let status = match row.get::<String, _>("status").as_str() {
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::New,
    };
    let timestamp_raw: String = row.get("timestamp");
    OrderState {
        order_id: row.get("order_id"),
        symbol: row.get("symbol"),
        side,
        order_type,
        quantity: row.get("quantity"),
        price: row.get("price"),
        status,
        filled_qty: row.get("filled_qty"),
        avg_price: row.get("avg_price"),
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp_raw)
            .map(|dt| dt.with_timezone(&chrono::Utc))
            .unwrap_or_else(|_| chrono::Utc::now()),
        stop_loss_order_id: row.get("stop_loss_order_id"),
        take_profit_order_id: row.get("take_profit_order_id"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn market_order(status: OrderStatus, filled_qty: f64) -> OrderState {
        OrderState {
            order_id: 1,
            symbol: "BTCUSDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Market,
            quantity: 0.02,
            price: None,
            status,
            filled_qty,
            avg_price: 50_000.0,
            timestamp: Utc::now(),
            stop_loss_order_id: None,
            take_profit_order_id: None,
        }
    }

    /// S7 — place MARKET qty=0.02 (NEW), then a FILLED update, then a
    /// subsequent NEW update that must be ignored (P2).
    #[tokio::test]
    async fn s7_order_lifecycle_scenario() {
        let store = OrderStore::connect(":memory:").await.unwrap();

        store.save(&market_order(OrderStatus::New, 0.0)).await.unwrap();
        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::New);

        store.save(&market_order(OrderStatus::Filled, 0.02)).await.unwrap();
        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled);
        assert_eq!(loaded.filled_qty, 0.02);

        store.save(&market_order(OrderStatus::New, 0.0)).await.unwrap();
        let loaded = store.load(1).await.unwrap().unwrap();
        assert_eq!(loaded.status, OrderStatus::Filled, "terminal status must not regress");
    }

    #[tokio::test]
    async fn round_trip_preserves_fields() {
        let store = OrderStore::connect(":memory:").await.unwrap();
        let order = market_order(OrderStatus::New, 0.0);
        store.save(&order).await.unwrap();
        let loaded = store.load(order.order_id).await.unwrap().unwrap();
        assert_eq!(loaded.symbol, order.symbol);
        assert_eq!(loaded.quantity, order.quantity);
        assert_eq!(loaded.side, order.side);
    }

    #[tokio::test]
    async fn load_all_open_excludes_terminal_orders() {
        let store = OrderStore::connect(":memory:").await.unwrap();
        store.save(&market_order(OrderStatus::New, 0.0)).await.unwrap();
        let mut second = market_order(OrderStatus::Filled, 0.02);
        second.order_id = 2;
        store.save(&second).await.unwrap();

        let open = store.load_all_open().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].order_id, 1);
    }
}
