// =============================================================================
// Strategy Snapshot Service (SPEC_FULL.md §4.I)
// =============================================================================
//
// Hashes the active configuration (canonical JSON -> SHA-256) and writes an
// immutable snapshot row whenever the hash changes. Exactly one row carries
// `active_until = NULL` at any instant (SNAP-1); the schema additionally
// enforces this with a unique partial index as a belt-and-braces check.
//
// Grounded in original_source/sighook/strategy_snapshot_manager.py.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::db::Db;
use crate::error::BotError;
use crate::types::StrategySnapshot;

/// The subset of `RuntimeConfig` that participates in the snapshot
/// fingerprint — everything that, if changed, should produce a new
/// immutable snapshot row and re-link subsequent trades to it.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInput {
    pub score_buy_target: f64,
    pub score_sell_target: f64,
    pub indicator_weights: BTreeMap<String, f64>,
    pub rsi_oversold: f64,
    pub rsi_overbought: f64,
    pub macd_fast: u32,
    pub macd_slow: u32,
    pub macd_signal: u32,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub cooldown_bars: u64,
    pub flip_hysteresis_pct: f64,
    pub min_indicators_required: u32,
    pub excluded_symbols: Vec<String>,
}

impl SnapshotInput {
    /// SHA-256 of the canonical (key-sorted, via `BTreeMap`/`serde_json`'s
    /// stable struct field order) JSON form.
    pub fn config_hash(&self) -> Result<String, BotError> {
        let canonical = serde_json::to_vec(self)?;
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Ok(hex::encode(hasher.finalize()))
    }
}

pub struct SnapshotService {
    db: Arc<Db>,
}

impl SnapshotService {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    fn current_active_hash(&self) -> Result<Option<(Uuid, String)>, BotError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT snapshot_id, config_hash FROM strategy_snapshots WHERE active_until IS NULL",
            )?;
            let mut rows = stmt.query([])?;
            if let Some(row) = rows.next()? {
                let id: String = row.get(0)?;
                let hash: String = row.get(1)?;
                let uuid = Uuid::parse_str(&id)
                    .map_err(|e| rusqlite::Error::InvalidParameterName(e.to_string()))?;
                Ok(Some((uuid, hash)))
            } else {
                Ok(None)
            }
        })
    }

    /// Ensure the config currently active matches `input`'s hash. If it
    /// differs (or no snapshot exists yet), retires the current active row
    /// and inserts a new one, returning its id. Returns the existing id
    /// unchanged when the hash is identical (SNAP-1: never two actives).
    pub fn ensure_active(&self, input: &SnapshotInput) -> Result<Uuid, BotError> {
        let hash = input.config_hash()?;

        if let Some((id, existing_hash)) = self.current_active_hash()? {
            if existing_hash == hash {
                return Ok(id);
            }
        }

        let new_id = Uuid::new_v4();
        let now = Utc::now();

        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "UPDATE strategy_snapshots SET active_until = ?1 WHERE active_until IS NULL",
                rusqlite::params![now.to_rfc3339()],
            )?;
            tx.execute(
                "INSERT INTO strategy_snapshots (
                    snapshot_id, active_from, active_until, score_buy_target, score_sell_target,
                    indicator_weights, rsi_oversold, rsi_overbought, macd_fast, macd_slow,
                    macd_signal, take_profit_pct, stop_loss_pct, cooldown_bars,
                    flip_hysteresis_pct, min_indicators_required, excluded_symbols, config_hash
                ) VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                rusqlite::params![
                    new_id.to_string(),
                    now.to_rfc3339(),
                    input.score_buy_target,
                    input.score_sell_target,
                    serde_json::to_string(&input.indicator_weights)?,
                    input.rsi_oversold,
                    input.rsi_overbought,
                    input.macd_fast,
                    input.macd_slow,
                    input.macd_signal,
                    input.take_profit_pct,
                    input.stop_loss_pct,
                    input.cooldown_bars as i64,
                    input.flip_hysteresis_pct,
                    input.min_indicators_required,
                    serde_json::to_string(&input.excluded_symbols)?,
                    hash,
                ],
            )?;
            tx.commit()?;
            Ok(())
        })?;

        info!(snapshot_id = %new_id, "new strategy snapshot activated");
        Ok(new_id)
    }

    /// Link an emitted trade to the snapshot active at placement time.
    pub fn link_trade(&self, order_id: &str, snapshot_id: Uuid) -> Result<(), BotError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO trade_strategy_link (order_id, snapshot_id) VALUES (?1, ?2)",
                rusqlite::params![order_id, snapshot_id.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn load(&self, snapshot_id: Uuid) -> Result<Option<StrategySnapshot>, BotError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT snapshot_id, active_from, active_until, score_buy_target, score_sell_target,
                        indicator_weights, rsi_oversold, rsi_overbought, macd_fast, macd_slow,
                        macd_signal, take_profit_pct, stop_loss_pct, cooldown_bars,
                        flip_hysteresis_pct, min_indicators_required, excluded_symbols, config_hash
                 FROM strategy_snapshots WHERE snapshot_id = ?1",
            )?;
            let mut rows = stmt.query(rusqlite::params![snapshot_id.to_string()])?;
            if let Some(row) = rows.next()? {
                let active_from: String = row.get(1)?;
                let active_until: Option<String> = row.get(2)?;
                let weights: String = row.get(5)?;
                let excluded: String = row.get(16)?;
                Ok(Some(StrategySnapshot {
                    snapshot_id,
                    active_from: active_from.parse().unwrap_or_else(|_| Utc::now()),
                    active_until: active_until.and_then(|s| s.parse().ok()),
                    score_buy_target: row.get(3)?,
                    score_sell_target: row.get(4)?,
                    indicator_weights: serde_json::from_str(&weights).unwrap_or_default(),
                    rsi_oversold: row.get(6)?,
                    rsi_overbought: row.get(7)?,
                    macd_fast: row.get::<_, i64>(8)? as u32,
                    macd_slow: row.get::<_, i64>(9)? as u32,
                    macd_signal: row.get::<_, i64>(10)? as u32,
                    take_profit_pct: row.get(11)?,
                    stop_loss_pct: row.get(12)?,
                    cooldown_bars: row.get::<_, i64>(13)? as u64,
                    flip_hysteresis_pct: row.get(14)?,
                    min_indicators_required: row.get::<_, i64>(15)? as u32,
                    excluded_symbols: serde_json::from_str(&excluded).unwrap_or_default(),
                    config_hash: row.get(17)?,
                }))
            } else {
                Ok(None)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_input(buy_target: f64) -> SnapshotInput {
        SnapshotInput {
            score_buy_target: buy_target,
            score_sell_target: -0.5,
            indicator_weights: BTreeMap::new(),
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            take_profit_pct: 1.0,
            stop_loss_pct: 1.0,
            cooldown_bars: 7,
            flip_hysteresis_pct: 0.1,
            min_indicators_required: 2,
            excluded_symbols: vec![],
        }
    }

    #[test]
    fn identical_config_reuses_same_snapshot() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let svc = SnapshotService::new(db);
        let id1 = svc.ensure_active(&sample_input(0.5)).unwrap();
        let id2 = svc.ensure_active(&sample_input(0.5)).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn changed_config_creates_new_snapshot_and_retires_old() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let svc = SnapshotService::new(db.clone());
        let id1 = svc.ensure_active(&sample_input(0.5)).unwrap();
        let id2 = svc.ensure_active(&sample_input(0.6)).unwrap();
        assert_ne!(id1, id2);

        let active_count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT count(*) FROM strategy_snapshots WHERE active_until IS NULL",
                    [],
                    |row| row.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(active_count, 1);
    }

    #[test]
    fn link_trade_and_load_round_trip() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let svc = SnapshotService::new(db);
        let id = svc.ensure_active(&sample_input(0.5)).unwrap();
        svc.link_trade("order-1", id).unwrap();
        let loaded = svc.load(id).unwrap().expect("snapshot exists");
        assert_eq!(loaded.snapshot_id, id);
        assert!(loaded.active_until.is_none());
    }
}
