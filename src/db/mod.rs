// =============================================================================
// Embedded SQL persistence
// =============================================================================
//
// Tables named in SPEC_FULL.md §6: trade_records, fifo_allocations,
// fifo_computation_log, active_symbols, passive_orders, shared_data,
// cash_transactions, strategy_snapshots, trade_strategy_link,
// strategy_performance_summary, ohlcv_data.
//
// Uses an embedded `rusqlite` connection (bundled SQLite) rather than a
// client/server database so the daemon has no external service dependency —
// the relational shape (FIFO allocation versioning, one-active-snapshot
// invariant) is unchanged regardless of engine. All money-like columns are
// stored as TEXT holding a canonical decimal string so no precision is lost
// going through the database (`rusqlite` has no native arbitrary-precision
// numeric type).
// =============================================================================

pub mod schema;

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::BotError;

/// A single embedded connection behind a lock. All core writers pass
/// through `AppState`'s bounded concurrency limiter before acquiring this
/// lock (SPEC_FULL.md §4.B / §5) so a burst of callers can't starve it.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BotError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::create_all(&conn)?;
        info!("database opened and schema ensured");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, BotError> {
        let conn = Connection::open_in_memory()?;
        schema::create_all(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with exclusive access to the underlying connection.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, BotError>) -> Result<T, BotError> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_in_memory_and_creates_schema() {
        let db = Db::open_in_memory().expect("open");
        db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='trade_records'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(count, 1);
            Ok(())
        })
        .unwrap();
    }
}
