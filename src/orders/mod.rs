// =============================================================================
// Orders Module
// =============================================================================
//
// Trade Order Manager: sizing, precision adjustment, and idempotent
// placement against the exchange client.

pub mod manager;

pub use manager::{adjust_price_and_size, build_order_data, BuildOrderInputs, OrderManager, SymbolPrecision};
