// =============================================================================
// Trade Recorder & FIFO Engine (SPEC_FULL.md §4.G)
// =============================================================================
//
// `recorder` accepts fill events through an in-process bounded queue and
// upserts a `trade_records` row per fill. `fifo` is the separate, replayable
// engine that walks a symbol's buys/sells in time order to produce FIFO
// allocations, cost basis, and realized P&L. Grounded in
// original_source/SharedDataManager/trade_recorder.py and
// original_source/TestDebugMaintenance/trade_record_maintenance.py.
// =============================================================================

pub mod fifo;
pub mod recorder;

pub use fifo::FifoEngine;
pub use recorder::{TradeRecorder, TradeFill};
