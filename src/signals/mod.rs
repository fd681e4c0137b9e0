// =============================================================================
// Signals Module
// =============================================================================
//
// Signal processing pipeline for the trading engine (SPEC_FULL.md §4.D):
// weighted indicator scoring, minimum-indicator confirmation, hysteresis,
// and per-symbol cooldown.

pub mod engine;

pub use engine::{SignalEngine, SignalEngineConfig};
