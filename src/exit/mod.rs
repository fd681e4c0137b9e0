// =============================================================================
// Exit Management Module
// =============================================================================
//
// Position monitor: priority-ordered exit-decision table plus the trailing
// stop algorithm backing it.

pub mod monitor;
pub mod trailing;

pub use monitor::{decide_exit, ExitContext, ExitDecision, PositionMonitorConfig};
pub use trailing::{update as update_trailing_stop, TrailingConfig};
