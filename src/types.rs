// =============================================================================
// Shared types used across the trading engine
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively trading, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether we are running against real funds or simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountMode {
    Demo,
    Live,
}

impl Default for AccountMode {
    fn default() -> Self {
        Self::Demo
    }
}

impl std::fmt::Display for AccountMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Demo => write!(f, "Demo"),
            Self::Live => write!(f, "Live"),
        }
    }
}

// =============================================================================
// Core data model (see SPEC_FULL.md §3)
// =============================================================================

/// One OHLCV sample for one symbol at one time. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// One named indicator's reading on a bar: whether it fired, the observed
/// value, and the threshold it was compared against.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorTuple {
    pub fired: bool,
    pub observed: Option<f64>,
    pub threshold: Option<f64>,
}

impl IndicatorTuple {
    pub const NONE: IndicatorTuple = IndicatorTuple {
        fired: false,
        observed: None,
        threshold: None,
    };

    pub fn fired(observed: f64, threshold: f64) -> Self {
        Self {
            fired: true,
            observed: Some(observed),
            threshold: Some(threshold),
        }
    }

    pub fn not_fired(observed: f64, threshold: f64) -> Self {
        Self {
            fired: false,
            observed: Some(observed),
            threshold: Some(threshold),
        }
    }
}

/// A bar annotated with every named buy/sell indicator tuple plus derived
/// raw scalars. Produced by the indicator pipeline; consumed by the signal
/// engine. An indicator computation failure degrades its tuple to
/// `IndicatorTuple::NONE` rather than propagating (SPEC_FULL.md §4.C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotatedBar {
    pub bar: Bar,
    pub bar_idx: u64,

    pub buy_bollinger_ratio: IndicatorTuple,
    pub sell_bollinger_ratio: IndicatorTuple,
    pub buy_bollinger_touch: IndicatorTuple,
    pub sell_bollinger_touch: IndicatorTuple,
    pub buy_rsi: IndicatorTuple,
    pub sell_rsi: IndicatorTuple,
    pub buy_roc: IndicatorTuple,
    pub sell_roc: IndicatorTuple,
    pub buy_macd: IndicatorTuple,
    pub sell_macd: IndicatorTuple,
    pub buy_swing: IndicatorTuple,
    pub sell_swing: IndicatorTuple,
    pub buy_pattern: IndicatorTuple,
    pub sell_pattern: IndicatorTuple,

    pub raw_roc: Option<f64>,
    pub raw_rsi: Option<f64>,
    pub raw_macd_hist: Option<f64>,
    pub raw_upper_band: Option<f64>,
    pub raw_lower_band: Option<f64>,
}

/// Per-evaluation record produced by the signal engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalScores {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub bar_idx: u64,
    pub price: Decimal,
    pub buy_score: f64,
    pub sell_score: f64,
    pub contributions: Vec<IndicatorContribution>,
    pub action: SignalAction,
    pub trigger: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorContribution {
    pub indicator: String,
    pub decision: i8,
    pub value: Option<f64>,
    pub threshold: Option<f64>,
    pub weight: f64,
    pub contribution: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl std::fmt::Display for SignalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
            Self::Hold => write!(f, "hold"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSource {
    Webhook,
    Websocket,
    PositionMonitor,
    Passive,
    Manual,
}

impl std::fmt::Display for OrderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Webhook => "webhook",
            Self::Websocket => "websocket",
            Self::PositionMonitor => "position_monitor",
            Self::Passive => "passive",
            Self::Manual => "manual",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// An intent to place one order. Once placed successfully, `source` and
/// `snapshot_id` are immutable (enforced by the order manager, not by the
/// type itself).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderData {
    pub client_order_id: Uuid,
    pub source: OrderSource,
    pub trigger: String,
    pub symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub requested_fiat_amount: Option<Decimal>,
    pub requested_base_amount: Option<Decimal>,
    pub adjusted_price: Option<Decimal>,
    pub adjusted_size: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub snapshot_id: Option<Uuid>,
    pub available_fiat_balance: Decimal,
    pub available_base_balance: Decimal,
}

/// "Unknownish" placeholder sources subject to upgrade (SPEC_FULL.md §9).
pub fn is_unknownish_source(source: &str) -> bool {
    matches!(source, "" | "unknown" | "reconciled")
}

/// Resolve the final `source` for an upsert given the existing stored value
/// (if any) and the incoming value. Truth table: both empty -> incoming;
/// existing unknownish + incoming concrete -> incoming; existing concrete
/// -> existing. (SRC-1 / SPEC_FULL.md §9 "Unknownish source upgrade".)
pub fn resolve_source_upgrade(existing: Option<&str>, incoming: &str) -> String {
    match existing {
        None => incoming.to_string(),
        Some(existing) if is_unknownish_source(existing) => incoming.to_string(),
        Some(existing) => existing.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeRecordStatus {
    Pending,
    Filled,
    Cancelled,
    Rejected,
}

/// One settled fill row. Primary key = `order_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub order_id: String,
    pub parent_id: Option<String>,
    pub parent_ids: Option<Vec<String>>,
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
    pub cost_basis_usd: Option<Decimal>,
    pub sale_proceeds_usd: Option<Decimal>,
    pub net_sale_proceeds_usd: Option<Decimal>,
    /// Remaining unallocated size, meaningful for buys only.
    /// Invariant: `0 <= remaining_size <= size`.
    pub remaining_size: Option<Decimal>,
    /// Deprecated legacy column; never read by ledger computations
    /// (see DESIGN.md Open Question 1).
    pub realized_profit: Option<Decimal>,
    pub ingest_via: String,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub last_reconciled_via: Option<String>,
}

/// One link from a sell fill slice to one buy fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FifoAllocation {
    pub allocation_version: i64,
    pub sell_order_id: String,
    pub buy_order_id: Option<String>,
    pub symbol: String,
    pub allocated_size: Decimal,
    pub allocation_cost_basis_usd: Decimal,
    pub allocation_proceeds_usd: Decimal,
    pub pnl_usd: Decimal,
    pub sell_time: DateTime<Utc>,
    pub sell_price: Decimal,
    pub notes: Option<String>,
}

/// Derived view: one open base-currency holding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub total_balance: Decimal,
    pub available_balance: Decimal,
    pub average_entry: Decimal,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketStatus {
    Pending,
    Active,
    Triggered,
    Cancelled,
}

/// Exchange-side `{entry, stop, tp}` order trio, indexed by trading pair.
/// The position monitor reads and coordinates with these; it does not
/// create them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BracketOrder {
    pub entry_order_id: String,
    pub stop_order_id: Option<String>,
    pub tp_order_id: Option<String>,
    pub entry_price: Decimal,
    pub stop_price: Decimal,
    pub tp_price: Decimal,
    pub status: BracketStatus,
}

/// Immutable configuration fingerprint. Exactly one row has
/// `active_until = None` at any time (SNAP-1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySnapshot {
    pub snapshot_id: Uuid,
    pub active_from: DateTime<Utc>,
    pub active_until: Option<DateTime<Utc>>,
    pub score_buy_target: f64,
    pub score_sell_target: f64,
    pub indicator_weights: std::collections::BTreeMap<String, f64>,
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
    pub config_hash: String,
}

/// Per-symbol trailing-stop state. Created on first evaluation while open,
/// deleted when the position closes or the stop triggers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrailingStopState {
    pub last_high: Decimal,
    pub stop_price: Option<Decimal>,
    pub last_atr_pct: f64,
    pub trailing_active: bool,
}

#[cfg(test)]
mod data_model_tests {
    use super::*;

    #[test]
    fn unknownish_source_classification() {
        assert!(is_unknownish_source(""));
        assert!(is_unknownish_source("unknown"));
        assert!(is_unknownish_source("reconciled"));
        assert!(!is_unknownish_source("webhook"));
    }

    #[test]
    fn source_upgrade_truth_table() {
        assert_eq!(resolve_source_upgrade(None, "webhook"), "webhook");
        assert_eq!(resolve_source_upgrade(Some(""), "webhook"), "webhook");
        assert_eq!(
            resolve_source_upgrade(Some("unknown"), "websocket"),
            "websocket"
        );
        assert_eq!(
            resolve_source_upgrade(Some("webhook"), "reconciled"),
            "webhook"
        );
    }
}
