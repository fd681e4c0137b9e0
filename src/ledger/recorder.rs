// =============================================================================
// Trade Recorder — queue-based fill ingestion
// =============================================================================
//
// `enqueue_trade` places a fill on a bounded channel; backpressure blocks the
// producer rather than dropping fills (SPEC_FULL.md §9, §5). A single worker
// drains the queue FIFO and calls `record`, which upserts a `trade_records`
// row and, for buys, seeds `remaining_size`. Sells defer every FIFO field to
// `fifo::replay`, run externally after the queue drains.
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::error::BotError;
use crate::types::{is_unknownish_source, resolve_source_upgrade, OrderSide, OrderType, TradeRecordStatus};

/// One fill event as surfaced by the exchange's user stream or a reconcile
/// pass.
#[derive(Debug, Clone)]
pub struct TradeFill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_time: DateTime<Utc>,
    pub price: Decimal,
    pub size: Decimal,
    pub total_fees_usd: Decimal,
    pub trigger: String,
    pub order_type: OrderType,
    pub status: TradeRecordStatus,
    pub source: String,
    pub ingest_via: String,
}

pub struct TradeRecorder {
    sender: mpsc::Sender<TradeFill>,
}

impl TradeRecorder {
    /// Spawns the dedicated worker task and returns a handle that can
    /// enqueue fills. `queue_capacity` bounds backpressure (default 1024).
    pub fn spawn(db: std::sync::Arc<Db>, queue_capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<TradeFill>(queue_capacity);

        tokio::spawn(async move {
            while let Some(fill) = receiver.recv().await {
                if let Err(err) = record(&db, &fill) {
                    error!(order_id = %fill.order_id, error = %err, "failed to record trade fill");
                }
            }
            info!("trade recorder worker exiting: channel closed");
        });

        Self { sender }
    }

    /// Enqueue a fill. Blocks (async) if the queue is full — fills are
    /// never dropped.
    pub async fn enqueue_trade(&self, fill: TradeFill) -> Result<(), BotError> {
        self.sender
            .send(fill)
            .await
            .map_err(|_| BotError::InternalServerError("trade recorder worker has shut down".into()))
    }
}

fn existing_source(db: &Db, order_id: &str) -> Result<Option<String>, BotError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT source FROM trade_records WHERE order_id = ?1")?;
        let mut rows = stmt.query([order_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get::<_, String>(0)?))
        } else {
            Ok(None)
        }
    })
}

/// Record one fill: resolves the `source` upgrade rule, seeds buy-side FIFO
/// fields, and upserts the row. Recording the same fill twice yields exactly
/// one unchanged row (idempotent on `order_id`).
pub fn record(db: &Db, fill: &TradeFill) -> Result<(), BotError> {
    let existing = existing_source(db, &fill.order_id)?;
    let final_source = resolve_source_upgrade(existing.as_deref(), &fill.source);

    if existing.is_some() {
        return update_existing(db, fill, &final_source);
    }

    let (parent_id, parent_ids, remaining_size) = match fill.side {
        OrderSide::Buy => (
            Some(fill.order_id.clone()),
            Some(vec![fill.order_id.clone()]),
            Some(fill.size),
        ),
        OrderSide::Sell => (None, None, None),
    };

    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO trade_records (
                order_id, parent_id, parent_ids, symbol, side, order_time, price, size,
                total_fees_usd, trigger, order_type, status, source,
                cost_basis_usd, sale_proceeds_usd, net_sale_proceeds_usd, remaining_size,
                realized_profit, ingest_via, last_reconciled_at, last_reconciled_via
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, NULL, NULL, NULL, ?14, NULL, ?15, NULL, NULL)",
            rusqlite::params![
                fill.order_id,
                parent_id,
                parent_ids.map(|ids| serde_json::to_string(&ids).unwrap_or_default()),
                fill.symbol,
                fill.side.to_string(),
                fill.order_time.to_rfc3339(),
                fill.price.to_string(),
                fill.size.to_string(),
                fill.total_fees_usd.to_string(),
                fill.trigger,
                order_type_str(fill.order_type),
                status_str(fill.status),
                final_source,
                remaining_size.map(|d| d.to_string()),
                fill.ingest_via,
            ],
        )?;
        Ok(())
    })?;

    if is_unknownish_source(&fill.source) {
        warn!(order_id = %fill.order_id, "recorded fill with unknownish source, subject to later upgrade");
    }

    Ok(())
}

/// Update path for a fill already recorded. Per SPEC_FULL.md §4.G step 6:
/// for buy rows, `remaining_size`/`realized_profit`/FIFO fields are never
/// touched on update — only mutable descriptive fields and (conditionally)
/// `source` are refreshed.
fn update_existing(db: &Db, fill: &TradeFill, final_source: &str) -> Result<(), BotError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE trade_records SET
                price = ?1, size = ?2, total_fees_usd = ?3, trigger = ?4,
                order_type = ?5, status = ?6, source = ?7
             WHERE order_id = ?8",
            rusqlite::params![
                fill.price.to_string(),
                fill.size.to_string(),
                fill.total_fees_usd.to_string(),
                fill.trigger,
                order_type_str(fill.order_type),
                status_str(fill.status),
                final_source,
                fill.order_id,
            ],
        )?;
        Ok(())
    })
}

fn order_type_str(t: OrderType) -> &'static str {
    match t {
        OrderType::Limit => "limit",
        OrderType::Market => "market",
    }
}

fn status_str(s: TradeRecordStatus) -> &'static str {
    match s {
        TradeRecordStatus::Pending => "pending",
        TradeRecordStatus::Filled => "filled",
        TradeRecordStatus::Cancelled => "cancelled",
        TradeRecordStatus::Rejected => "rejected",
    }
}

pub fn parse_decimal(s: &str) -> Result<Decimal, BotError> {
    Decimal::from_str(s).map_err(|e| BotError::BadRequest(format!("invalid decimal {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_fill(order_id: &str, side: OrderSide, source: &str) -> TradeFill {
        TradeFill {
            order_id: order_id.to_string(),
            symbol: "BTC-USD".to_string(),
            side,
            order_time: Utc::now(),
            price: dec!(40000),
            size: dec!(0.01),
            total_fees_usd: dec!(0.40),
            trigger: "webhook".to_string(),
            order_type: OrderType::Limit,
            status: TradeRecordStatus::Filled,
            source: source.to_string(),
            ingest_via: "websocket".to_string(),
        }
    }

    #[test]
    fn recording_buy_seeds_remaining_size() {
        let db = Db::open_in_memory().unwrap();
        let fill = sample_fill("order-1", OrderSide::Buy, "webhook");
        record(&db, &fill).unwrap();

        let remaining: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT remaining_size FROM trade_records WHERE order_id = 'order-1'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(parse_decimal(&remaining).unwrap(), dec!(0.01));
    }

    #[test]
    fn recording_same_fill_twice_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        let fill = sample_fill("order-2", OrderSide::Buy, "webhook");
        record(&db, &fill).unwrap();
        record(&db, &fill).unwrap();

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM trade_records WHERE order_id = 'order-2'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn source_upgrade_on_update_from_unknownish() {
        let db = Db::open_in_memory().unwrap();
        let first = sample_fill("order-3", OrderSide::Sell, "unknown");
        record(&db, &first).unwrap();

        let second = sample_fill("order-3", OrderSide::Sell, "websocket");
        record(&db, &second).unwrap();

        let source: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT source FROM trade_records WHERE order_id = 'order-3'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(source, "websocket");
    }

    #[test]
    fn source_never_downgrades_once_concrete() {
        let db = Db::open_in_memory().unwrap();
        let first = sample_fill("order-4", OrderSide::Sell, "webhook");
        record(&db, &first).unwrap();

        let second = sample_fill("order-4", OrderSide::Sell, "reconciled");
        record(&db, &second).unwrap();

        let source: String = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT source FROM trade_records WHERE order_id = 'order-4'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(source, "webhook");
    }

    #[test]
    fn sell_rows_defer_fifo_fields() {
        let db = Db::open_in_memory().unwrap();
        let fill = sample_fill("order-5", OrderSide::Sell, "webhook");
        record(&db, &fill).unwrap();

        let cost_basis: Option<String> = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT cost_basis_usd FROM trade_records WHERE order_id = 'order-5'",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert!(cost_basis.is_none());
    }
}
