// =============================================================================
// Schema DDL
// =============================================================================

use rusqlite::Connection;

use crate::error::BotError;

pub fn create_all(conn: &Connection) -> Result<(), BotError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS trade_records (
            order_id              TEXT PRIMARY KEY,
            parent_id             TEXT,
            parent_ids            TEXT,              -- JSON array
            symbol                TEXT NOT NULL,
            side                  TEXT NOT NULL,
            order_time            TEXT NOT NULL,
            price                 TEXT NOT NULL,     -- decimal string
            size                  TEXT NOT NULL,
            total_fees_usd        TEXT NOT NULL,
            trigger               TEXT NOT NULL,
            order_type            TEXT NOT NULL,
            status                TEXT NOT NULL,
            source                TEXT NOT NULL,
            cost_basis_usd        TEXT,
            sale_proceeds_usd     TEXT,
            net_sale_proceeds_usd TEXT,
            remaining_size        TEXT,
            realized_profit       TEXT,
            ingest_via            TEXT NOT NULL,
            last_reconciled_at    TEXT,
            last_reconciled_via   TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_trade_records_symbol_time
            ON trade_records (symbol, order_time);

        CREATE TABLE IF NOT EXISTS fifo_allocations (
            id                        INTEGER PRIMARY KEY AUTOINCREMENT,
            allocation_version        INTEGER NOT NULL,
            sell_order_id             TEXT NOT NULL,
            buy_order_id              TEXT,
            symbol                    TEXT NOT NULL,
            allocated_size            TEXT NOT NULL,
            allocation_cost_basis_usd TEXT NOT NULL,
            allocation_proceeds_usd   TEXT NOT NULL,
            pnl_usd                   TEXT NOT NULL,
            sell_time                 TEXT NOT NULL,
            sell_price                TEXT NOT NULL,
            notes                     TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_fifo_allocations_version_sell
            ON fifo_allocations (allocation_version, sell_order_id);

        CREATE TABLE IF NOT EXISTS fifo_computation_log (
            id                 INTEGER PRIMARY KEY AUTOINCREMENT,
            allocation_version INTEGER NOT NULL,
            symbol             TEXT NOT NULL,
            started_at         TEXT NOT NULL,
            finished_at        TEXT,
            buys_considered    INTEGER NOT NULL,
            sells_considered   INTEGER NOT NULL,
            uncovered_sells    INTEGER NOT NULL DEFAULT 0,
            notes              TEXT
        );

        CREATE TABLE IF NOT EXISTS active_symbols (
            symbol  TEXT PRIMARY KEY,
            enabled INTEGER NOT NULL DEFAULT 1,
            added_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS passive_orders (
            order_id   TEXT PRIMARY KEY,
            symbol     TEXT NOT NULL,
            side       TEXT NOT NULL,
            price      TEXT NOT NULL,
            size       TEXT NOT NULL,
            status     TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS shared_data (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cash_transactions (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_time    TEXT NOT NULL,
            amount_usd TEXT NOT NULL,
            kind       TEXT NOT NULL,
            notes      TEXT
        );

        CREATE TABLE IF NOT EXISTS strategy_snapshots (
            snapshot_id             TEXT PRIMARY KEY,
            active_from             TEXT NOT NULL,
            active_until            TEXT,
            score_buy_target        REAL NOT NULL,
            score_sell_target       REAL NOT NULL,
            indicator_weights       TEXT NOT NULL, -- JSON
            rsi_oversold            REAL NOT NULL,
            rsi_overbought          REAL NOT NULL,
            macd_fast               INTEGER NOT NULL,
            macd_slow               INTEGER NOT NULL,
            macd_signal             INTEGER NOT NULL,
            take_profit_pct         REAL NOT NULL,
            stop_loss_pct           REAL NOT NULL,
            cooldown_bars           INTEGER NOT NULL,
            flip_hysteresis_pct     REAL NOT NULL,
            min_indicators_required INTEGER NOT NULL,
            excluded_symbols        TEXT NOT NULL, -- JSON
            config_hash             TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_strategy_snapshots_one_active
            ON strategy_snapshots (active_until)
            WHERE active_until IS NULL;

        CREATE TABLE IF NOT EXISTS trade_strategy_link (
            order_id    TEXT PRIMARY KEY,
            snapshot_id TEXT NOT NULL REFERENCES strategy_snapshots(snapshot_id)
        );

        CREATE TABLE IF NOT EXISTS strategy_performance_summary (
            snapshot_id   TEXT PRIMARY KEY REFERENCES strategy_snapshots(snapshot_id),
            trade_count   INTEGER NOT NULL DEFAULT 0,
            win_count     INTEGER NOT NULL DEFAULT 0,
            total_pnl_usd TEXT NOT NULL DEFAULT '0',
            updated_at    TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ohlcv_data (
            symbol     TEXT NOT NULL,
            interval   TEXT NOT NULL,
            open_time  INTEGER NOT NULL,
            open       REAL NOT NULL,
            high       REAL NOT NULL,
            low        REAL NOT NULL,
            close      REAL NOT NULL,
            volume     REAL NOT NULL,
            PRIMARY KEY (symbol, interval, open_time)
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_enforces_single_active_snapshot() {
        let conn = Connection::open_in_memory().unwrap();
        create_all(&conn).unwrap();
        conn.execute(
            "INSERT INTO strategy_snapshots (snapshot_id, active_from, active_until, score_buy_target, score_sell_target, indicator_weights, rsi_oversold, rsi_overbought, macd_fast, macd_slow, macd_signal, take_profit_pct, stop_loss_pct, cooldown_bars, flip_hysteresis_pct, min_indicators_required, excluded_symbols, config_hash) VALUES ('a', '2024-01-01', NULL, 0.5, -0.5, '{}', 30.0, 70.0, 12, 26, 9, 1.0, 1.0, 7, 0.1, 2, '[]', 'hash1')",
            [],
        )
        .unwrap();

        let second = conn.execute(
            "INSERT INTO strategy_snapshots (snapshot_id, active_from, active_until, score_buy_target, score_sell_target, indicator_weights, rsi_oversold, rsi_overbought, macd_fast, macd_slow, macd_signal, take_profit_pct, stop_loss_pct, cooldown_bars, flip_hysteresis_pct, min_indicators_required, excluded_symbols, config_hash) VALUES ('b', '2024-01-02', NULL, 0.5, -0.5, '{}', 30.0, 70.0, 12, 26, 9, 1.0, 1.0, 7, 0.1, 2, '[]', 'hash2')",
            [],
        );
        assert!(second.is_err(), "second active row should violate the unique partial index");
    }
}
