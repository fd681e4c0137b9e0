// =============================================================================
// FIFO Engine — deterministic, replayable, per-symbol
// =============================================================================
//
// Loads every filled buy/sell for a symbol in `(order_time, order_id)` order,
// greedily allocates each sell against the earliest buy with remaining size,
// and emits one `FifoAllocation` row per match. Running this twice on the
// same input produces identical allocations (FIFO-1/2/3; see tests below).
//
// Grounded in original_source/TestDebugMaintenance/trade_record_maintenance.py
// (`recompute_fifo_for_symbol`), which replays from scratch rather than
// incrementally patching allocations.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::db::Db;
use crate::error::BotError;

const BASE_EPSILON: Decimal = Decimal::from_parts(1, 0, 0, false, 8); // 1e-8

#[derive(Debug, Clone)]
struct BuyRow {
    order_id: String,
    order_time: DateTime<Utc>,
    price: Decimal,
    size: Decimal,
    fees: Decimal,
    remaining: Decimal,
}

#[derive(Debug, Clone)]
struct SellRow {
    order_id: String,
    order_time: DateTime<Utc>,
    price: Decimal,
    size: Decimal,
    fees: Decimal,
    need: Decimal,
}

#[derive(Debug, Clone)]
pub struct AllocationRow {
    pub sell_order_id: String,
    pub buy_order_id: Option<String>,
    pub allocated_size: Decimal,
    pub cost_basis_usd: Decimal,
    pub proceeds_usd: Decimal,
    pub pnl_usd: Decimal,
    pub sell_time: DateTime<Utc>,
    pub sell_price: Decimal,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayResult {
    pub allocations: Vec<AllocationRow>,
    pub buy_remaining: HashMap<String, Decimal>,
    pub uncovered_sells: Vec<String>,
}

fn parse_dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap_or(Decimal::ZERO)
}

fn load_buys(db: &Db, symbol: &str) -> Result<Vec<BuyRow>, BotError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT order_id, order_time, price, size, total_fees_usd
             FROM trade_records
             WHERE symbol = ?1 AND side = 'BUY' AND status = 'filled'
             ORDER BY order_time ASC, order_id ASC",
        )?;
        let rows = stmt
            .query_map([symbol], |row| {
                let order_time: String = row.get(1)?;
                Ok(BuyRow {
                    order_id: row.get(0)?,
                    order_time: DateTime::parse_from_rfc3339(&order_time)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    price: parse_dec(&row.get::<_, String>(2)?),
                    size: parse_dec(&row.get::<_, String>(3)?),
                    fees: parse_dec(&row.get::<_, String>(4)?),
                    remaining: Decimal::ZERO,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|mut b| {
                b.remaining = b.size;
                b
            })
            .collect())
    })
}

fn load_sells(db: &Db, symbol: &str) -> Result<Vec<SellRow>, BotError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT order_id, order_time, price, size, total_fees_usd
             FROM trade_records
             WHERE symbol = ?1 AND side = 'SELL' AND status = 'filled'
             ORDER BY order_time ASC, order_id ASC",
        )?;
        let rows = stmt
            .query_map([symbol], |row| {
                let order_time: String = row.get(1)?;
                let size = parse_dec(&row.get::<_, String>(3)?);
                Ok(SellRow {
                    order_id: row.get(0)?,
                    order_time: DateTime::parse_from_rfc3339(&order_time)
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    price: parse_dec(&row.get::<_, String>(2)?),
                    size,
                    fees: parse_dec(&row.get::<_, String>(4)?),
                    need: size,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Pure replay over in-memory rows (no I/O) — the algorithm in
/// SPEC_FULL.md §4.G "FIFO engine" steps 1-5, independent of storage so it
/// can be exercised directly in tests.
fn replay_pure(mut buys: Vec<BuyRow>, mut sells: Vec<SellRow>) -> ReplayResult {
    let mut allocations = Vec::new();
    let mut uncovered_sells = Vec::new();

    for sell in sells.iter_mut() {
        for buy in buys.iter_mut() {
            if sell.need <= Decimal::ZERO {
                break;
            }
            if buy.remaining <= Decimal::ZERO {
                continue;
            }

            let take = buy.remaining.min(sell.need);
            let buy_cost_fraction = if buy.size > Decimal::ZERO {
                take / buy.size
            } else {
                Decimal::ZERO
            };
            let sell_fraction = if sell.size > Decimal::ZERO {
                take / sell.size
            } else {
                Decimal::ZERO
            };

            let cost_basis = (buy.price * take) + (buy.fees * buy_cost_fraction);
            let gross_proceeds = sell.price * take;
            let allocated_fees = sell.fees * sell_fraction;
            let net_proceeds = gross_proceeds - allocated_fees;
            let pnl = net_proceeds - cost_basis;

            allocations.push(AllocationRow {
                sell_order_id: sell.order_id.clone(),
                buy_order_id: Some(buy.order_id.clone()),
                allocated_size: take,
                cost_basis_usd: cost_basis,
                proceeds_usd: net_proceeds,
                pnl_usd: pnl,
                sell_time: sell.order_time,
                sell_price: sell.price,
                notes: None,
            });

            buy.remaining -= take;
            sell.need -= take;
        }

        if sell.need > BASE_EPSILON {
            uncovered_sells.push(sell.order_id.clone());
            allocations.push(AllocationRow {
                sell_order_id: sell.order_id.clone(),
                buy_order_id: None,
                allocated_size: sell.need,
                cost_basis_usd: Decimal::ZERO,
                proceeds_usd: Decimal::ZERO,
                pnl_usd: Decimal::ZERO,
                sell_time: sell.order_time,
                sell_price: sell.price,
                notes: Some("uncovered: exhausted available buy inventory".to_string()),
            });
        }
    }

    let buy_remaining = buys
        .into_iter()
        .map(|b| (b.order_id, b.remaining))
        .collect();

    ReplayResult {
        allocations,
        buy_remaining,
        uncovered_sells,
    }
}

pub struct FifoEngine {
    db: Arc<Db>,
    /// Advisory lock keyed by `(version, symbol)` so concurrent replays of
    /// the same key serialize (SPEC_FULL.md §5).
    locks: AsyncMutex<HashMap<(i64, String), Arc<AsyncMutex<()>>>>,
}

impl FifoEngine {
    pub fn new(db: Arc<Db>) -> Self {
        Self {
            db,
            locks: AsyncMutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, version: i64, symbol: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry((version, symbol.to_string()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Replay all filled buys/sells for `symbol`, persist allocations under
    /// `version`, and update each buy's `remaining_size`. Idempotent:
    /// running twice produces identical rows because it always recomputes
    /// from scratch rather than patching.
    pub async fn replay_for_symbol(&self, symbol: &str, version: i64) -> Result<ReplayResult, BotError> {
        let key_lock = self.lock_for(version, symbol).await;
        let _guard = key_lock.lock().await;

        let started_at = Utc::now();
        let buys = load_buys(&self.db, symbol)?;
        let sells = load_sells(&self.db, symbol)?;
        let buys_considered = buys.len();
        let sells_considered = sells.len();

        let result = replay_pure(buys, sells);

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "DELETE FROM fifo_allocations WHERE allocation_version = ?1 AND symbol = ?2",
                rusqlite::params![version, symbol],
            )?;

            for alloc in &result.allocations {
                tx.execute(
                    "INSERT INTO fifo_allocations (
                        allocation_version, sell_order_id, buy_order_id, symbol,
                        allocated_size, allocation_cost_basis_usd, allocation_proceeds_usd,
                        pnl_usd, sell_time, sell_price, notes
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    rusqlite::params![
                        version,
                        alloc.sell_order_id,
                        alloc.buy_order_id,
                        symbol,
                        alloc.allocated_size.to_string(),
                        alloc.cost_basis_usd.to_string(),
                        alloc.proceeds_usd.to_string(),
                        alloc.pnl_usd.to_string(),
                        alloc.sell_time.to_rfc3339(),
                        alloc.sell_price.to_string(),
                        alloc.notes,
                    ],
                )?;
            }

            for (order_id, remaining) in &result.buy_remaining {
                tx.execute(
                    "UPDATE trade_records SET remaining_size = ?1 WHERE order_id = ?2",
                    rusqlite::params![remaining.to_string(), order_id],
                )?;
            }

            // Finalize fully-covered sells' aggregate totals.
            let mut per_sell_totals: HashMap<String, (Decimal, Decimal, Decimal)> = HashMap::new();
            for alloc in &result.allocations {
                if alloc.buy_order_id.is_none() {
                    continue;
                }
                let entry = per_sell_totals
                    .entry(alloc.sell_order_id.clone())
                    .or_insert((Decimal::ZERO, Decimal::ZERO, Decimal::ZERO));
                entry.0 += alloc.cost_basis_usd;
                entry.1 += alloc.proceeds_usd;
                entry.2 += alloc.pnl_usd;
            }
            for (sell_id, (cost, proceeds, pnl)) in per_sell_totals {
                if result.uncovered_sells.contains(&sell_id) {
                    continue;
                }
                tx.execute(
                    "UPDATE trade_records SET cost_basis_usd = ?1, sale_proceeds_usd = ?2,
                        net_sale_proceeds_usd = ?2
                     WHERE order_id = ?3",
                    rusqlite::params![cost.to_string(), proceeds.to_string(), sell_id],
                )?;
                let _ = pnl; // pnl lives on the allocation rows, not duplicated on trade_records
            }

            tx.execute(
                "INSERT INTO fifo_computation_log (
                    allocation_version, symbol, started_at, finished_at,
                    buys_considered, sells_considered, uncovered_sells
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    version,
                    symbol,
                    started_at.to_rfc3339(),
                    Utc::now().to_rfc3339(),
                    buys_considered as i64,
                    sells_considered as i64,
                    result.uncovered_sells.len() as i64,
                ],
            )?;

            tx.commit()?;
            Ok(())
        })?;

        if !result.uncovered_sells.is_empty() {
            warn!(symbol, count = result.uncovered_sells.len(), "uncovered sells after FIFO replay, routed to manual review");
        }
        info!(symbol, allocations = result.allocations.len(), "FIFO replay complete");

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn buy(id: &str, t: i64, price: Decimal, size: Decimal, fees: Decimal) -> BuyRow {
        BuyRow {
            order_id: id.to_string(),
            order_time: DateTime::from_timestamp(t, 0).unwrap(),
            price,
            size,
            fees,
            remaining: size,
        }
    }

    fn sell(id: &str, t: i64, price: Decimal, size: Decimal, fees: Decimal) -> SellRow {
        SellRow {
            order_id: id.to_string(),
            order_time: DateTime::from_timestamp(t, 0).unwrap(),
            price,
            size,
            fees,
            need: size,
        }
    }

    #[test]
    fn simple_round_trip_matches_expected_numbers() {
        let buys = vec![buy("b1", 0, dec!(40000), dec!(0.01), dec!(0.40))];
        let sells = vec![sell("s1", 1, dec!(41000), dec!(0.01), dec!(0.41))];

        let result = replay_pure(buys, sells);
        assert_eq!(result.allocations.len(), 1);
        let alloc = &result.allocations[0];
        assert_eq!(alloc.allocated_size, dec!(0.01));
        assert_eq!(alloc.cost_basis_usd, dec!(400.40));
        assert_eq!(alloc.proceeds_usd, dec!(409.59));
        assert_eq!(alloc.pnl_usd, dec!(9.19));
        assert_eq!(*result.buy_remaining.get("b1").unwrap(), dec!(0));
    }

    #[test]
    fn partial_sell_across_two_buys_matches_expected_numbers() {
        let buys = vec![
            buy("b1", 0, dec!(40000), dec!(0.01), dec!(0.40)),
            buy("b2", 1, dec!(42000), dec!(0.01), dec!(0.42)),
        ];
        let sells = vec![sell("s1", 2, dec!(43000), dec!(0.015), dec!(0.645))];

        let result = replay_pure(buys, sells);
        assert_eq!(result.allocations.len(), 2);

        let alloc1 = &result.allocations[0];
        assert_eq!(alloc1.buy_order_id.as_deref(), Some("b1"));
        assert_eq!(alloc1.allocated_size, dec!(0.01));
        assert_eq!(alloc1.cost_basis_usd, dec!(400.40));

        let alloc2 = &result.allocations[1];
        assert_eq!(alloc2.buy_order_id.as_deref(), Some("b2"));
        assert_eq!(alloc2.allocated_size, dec!(0.005));
        assert_eq!(alloc2.cost_basis_usd, dec!(210.21));

        assert_eq!(*result.buy_remaining.get("b2").unwrap(), dec!(0.005));
        assert_eq!(*result.buy_remaining.get("b1").unwrap(), dec!(0));

        let total_pnl: Decimal = result.allocations.iter().map(|a| a.pnl_usd).sum();
        assert_eq!(total_pnl, dec!(33.745));
    }

    #[test]
    fn uncovered_sell_is_flagged_not_mutated() {
        let buys = vec![buy("b1", 0, dec!(40000), dec!(0.01), dec!(0.40))];
        let sells = vec![sell("s1", 1, dec!(41000), dec!(0.02), dec!(0.82))];

        let result = replay_pure(buys, sells);
        assert_eq!(result.uncovered_sells, vec!["s1".to_string()]);
        // Two allocation rows: one covered slice, one uncovered placeholder.
        assert_eq!(result.allocations.len(), 2);
        let placeholder = result
            .allocations
            .iter()
            .find(|a| a.buy_order_id.is_none())
            .unwrap();
        assert_eq!(placeholder.allocated_size, dec!(0.01));
    }

    #[test]
    fn replay_is_deterministic_across_runs() {
        let buys = || {
            vec![
                buy("b1", 0, dec!(40000), dec!(0.01), dec!(0.40)),
                buy("b2", 1, dec!(42000), dec!(0.01), dec!(0.42)),
            ]
        };
        let sells = || vec![sell("s1", 2, dec!(43000), dec!(0.015), dec!(0.645))];

        let first = replay_pure(buys(), sells());
        let second = replay_pure(buys(), sells());

        assert_eq!(first.allocations.len(), second.allocations.len());
        for (a, b) in first.allocations.iter().zip(second.allocations.iter()) {
            assert_eq!(a.allocated_size, b.allocated_size);
            assert_eq!(a.pnl_usd, b.pnl_usd);
        }
    }

    #[test]
    fn allocation_sell_time_never_precedes_matched_buy_time() {
        let buys = vec![buy("b1", 100, dec!(40000), dec!(0.01), dec!(0.40))];
        let sells = vec![sell("s1", 200, dec!(41000), dec!(0.01), dec!(0.41))];
        let result = replay_pure(buys, sells);
        let alloc = &result.allocations[0];
        assert!(alloc.sell_time.timestamp() >= 100);
    }
}
