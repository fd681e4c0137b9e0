// =============================================================================
// Position Monitor — exit-decision state machine (SPEC_FULL.md §4.F)
// =============================================================================
//
// `decide_exit` is the pure priority-ordered table: hard stop always wins;
// soft stop defers to an aligned bracket order; trailing stop activate/raise/
// hit; signal-exit while trailing is armed but not yet active; take-profit
// deferring to an aligned bracket. `run_position_monitor` wraps this with
// the per-tick position iteration, trailing-state bookkeeping, and
// exit-close handling, following the teacher's interval-driven task shape.
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::exit::trailing::{self, TrailingConfig};
use crate::types::{BracketOrder, TrailingStopState};

#[derive(Debug, Clone, Copy)]
pub struct PositionMonitorConfig {
    pub hard_stop_pct: f64,
    pub max_loss_pct: f64,
    pub min_profit_pct: f64,
    pub signal_exit_min_profit: f64,
    pub soft_stop_market_threshold_pct: f64,
    pub bracket_tolerance_pct: f64,
    pub enable_trailing: bool,
    pub enable_signal_exit: bool,
}

impl Default for PositionMonitorConfig {
    fn default() -> Self {
        Self {
            hard_stop_pct: 0.05,
            max_loss_pct: 0.02,
            min_profit_pct: 0.015,
            signal_exit_min_profit: 0.005,
            soft_stop_market_threshold_pct: -0.03,
            bracket_tolerance_pct: 0.005,
            enable_trailing: true,
            enable_signal_exit: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExitContext {
    pub mid: Decimal,
    pub entry: Decimal,
    pub pnl_pct: f64,
    pub trailing_active: bool,
    pub trailing_hit: bool,
    pub signal_is_sell: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    EmergencyStop,
    DeferToBracketStop,
    SoftStop { use_market: bool },
    TrailingStop,
    SignalExit,
    DeferToBracketTakeProfit,
    TakeProfit,
    Hold,
}

impl ExitDecision {
    pub fn is_exit(self) -> bool {
        !matches!(self, ExitDecision::Hold | ExitDecision::DeferToBracketStop | ExitDecision::DeferToBracketTakeProfit)
    }
}

fn within_tolerance(a: f64, b: f64, tolerance_pct: f64) -> bool {
    if a == 0.0 {
        return false;
    }
    ((a - b) / a).abs() <= tolerance_pct
}

/// Evaluate the priority-ordered exit table for one position on one tick.
pub fn decide_exit(ctx: &ExitContext, bracket: Option<&BracketOrder>, config: &PositionMonitorConfig) -> ExitDecision {
    // Priority 1: hard stop always wins, regardless of bracket state.
    if ctx.pnl_pct <= -config.hard_stop_pct {
        return ExitDecision::EmergencyStop;
    }

    // Priority 2 / 2': soft stop, deferring to an aligned bracket stop.
    if ctx.pnl_pct <= -config.max_loss_pct {
        let entry_f = ctx.entry.to_string().parse::<f64>().unwrap_or(0.0);
        let monitor_sl = entry_f * (1.0 - config.max_loss_pct);

        let bracket_aligned = bracket
            .and_then(|b| b.stop_order_id.as_ref().map(|_| b.stop_price))
            .map(|sp| within_tolerance(monitor_sl, sp.to_string().parse::<f64>().unwrap_or(0.0), config.bracket_tolerance_pct))
            .unwrap_or(false);

        if bracket_aligned {
            return ExitDecision::DeferToBracketStop;
        }

        return ExitDecision::SoftStop {
            use_market: ctx.pnl_pct <= config.soft_stop_market_threshold_pct,
        };
    }

    // Priority 3 / 3' / 3'': trailing stop and its signal-exit escape hatch.
    if config.enable_trailing {
        if ctx.trailing_active && ctx.trailing_hit {
            return ExitDecision::TrailingStop;
        }
        if !ctx.trailing_active
            && config.enable_signal_exit
            && ctx.signal_is_sell
            && ctx.pnl_pct >= config.signal_exit_min_profit
        {
            return ExitDecision::SignalExit;
        }
        return ExitDecision::Hold;
    }

    // Priority 4 / 4': take-profit, deferring to an aligned bracket TP.
    if ctx.pnl_pct >= config.min_profit_pct {
        let entry_f = ctx.entry.to_string().parse::<f64>().unwrap_or(0.0);
        let monitor_tp = entry_f * (1.0 + config.min_profit_pct);

        let bracket_aligned = bracket
            .and_then(|b| b.tp_order_id.as_ref().map(|_| b.tp_price))
            .map(|tp| within_tolerance(monitor_tp, tp.to_string().parse::<f64>().unwrap_or(0.0), config.bracket_tolerance_pct))
            .unwrap_or(false);

        if bracket_aligned {
            return ExitDecision::DeferToBracketTakeProfit;
        }

        return ExitDecision::TakeProfit;
    }

    ExitDecision::Hold
}

/// Interval between position-monitor sweeps (SPEC_FULL.md §4.F default: 3s
/// wall clock, gated internally to `POSITION_CHECK_INTERVAL`, default 30s).
const SWEEP_INTERVAL_SECS: u64 = 3;
const POSITION_CHECK_INTERVAL_SECS: u64 = 30;

pub type TrailingStates = Arc<parking_lot::RwLock<HashMap<String, TrailingStopState>>>;

pub fn new_trailing_states() -> TrailingStates {
    Arc::new(parking_lot::RwLock::new(HashMap::new()))
}

fn decimal_from_f64(v: f64) -> Decimal {
    Decimal::from_str(&format!("{v:.8}")).unwrap_or(Decimal::ZERO)
}

/// Sweep open positions every [`SWEEP_INTERVAL_SECS`], gated to an actual
/// evaluation every [`POSITION_CHECK_INTERVAL_SECS`], applying the
/// priority-ordered exit table to each. Closes triggered positions and
/// records realized P&L on the risk engine, matching the teacher's existing
/// interval-driven task shape.
pub async fn run_position_monitor(state: Arc<AppState>, trailing_states: TrailingStates, config: PositionMonitorConfig) {
    info!(interval_secs = SWEEP_INTERVAL_SECS, "position monitor started");
    let mut ticker = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
    let mut ticks_since_check = 0u64;

    loop {
        ticker.tick().await;
        ticks_since_check += 1;
        if ticks_since_check * SWEEP_INTERVAL_SECS < POSITION_CHECK_INTERVAL_SECS {
            continue;
        }
        ticks_since_check = 0;

        let open_positions = state.position_manager.get_open_positions();
        if open_positions.is_empty() {
            debug!("position monitor: no open positions");
            continue;
        }

        for position in &open_positions {
            if position.current_price <= 0.0 || position.entry_price <= 0.0 {
                continue;
            }

            let mid = decimal_from_f64(position.current_price);
            let entry = decimal_from_f64(position.entry_price);

            let trailing_before = {
                let mut states = trailing_states.write();
                states
                    .entry(position.id.clone())
                    .or_insert_with(|| trailing::initial_state(entry))
                    .clone()
            };

            let atr_pct = state
                .atr_pct
                .read()
                .get(&position.symbol)
                .copied()
                .unwrap_or(0.02);

            let (trailing_after, trailing_hit) = trailing::update(
                trailing_before,
                mid,
                atr_pct,
                position.unrealized_pnl_pct,
                &TrailingConfig::default(),
            );
            trailing_states.write().insert(position.id.clone(), trailing_after);

            let signal_is_sell = matches!(
                state.last_signal_action.read().get(&position.symbol),
                Some(crate::types::SignalAction::Sell)
            );
            let bracket = state.bracket_orders.read().get(&position.symbol).cloned();

            let ctx = ExitContext {
                mid,
                entry,
                pnl_pct: position.unrealized_pnl_pct,
                trailing_active: trailing_after.trailing_active,
                trailing_hit,
                signal_is_sell,
            };

            let decision = decide_exit(&ctx, bracket.as_ref(), &config);

            if decision.is_exit() {
                info!(
                    id = %position.id,
                    symbol = %position.symbol,
                    decision = ?decision,
                    price = position.current_price,
                    "position monitor exit triggered"
                );

                let reason = format!("{decision:?}");
                if let Some(pnl) = state
                    .position_manager
                    .close_position(&position.id, &reason, position.current_price)
                {
                    state.risk_engine.record_trade_result(pnl);
                    trailing_states.write().remove(&position.id);
                    state.increment_version();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BracketStatus;
    use rust_decimal_macros::dec;

    fn ctx(pnl_pct: f64) -> ExitContext {
        ExitContext {
            mid: dec!(100),
            entry: dec!(100),
            pnl_pct,
            trailing_active: false,
            trailing_hit: false,
            signal_is_sell: false,
        }
    }

    #[test]
    fn hard_stop_always_wins_even_with_aligned_bracket() {
        let config = PositionMonitorConfig::default();
        let bracket = BracketOrder {
            entry_order_id: "e1".into(),
            stop_order_id: Some("s1".into()),
            tp_order_id: None,
            entry_price: dec!(100),
            stop_price: dec!(98),
            tp_price: dec!(105),
            status: BracketStatus::Active,
        };
        let decision = decide_exit(&ctx(-0.10), Some(&bracket), &config);
        assert_eq!(decision, ExitDecision::EmergencyStop);
    }

    #[test]
    fn soft_stop_defers_to_aligned_bracket() {
        let mut config = PositionMonitorConfig::default();
        config.enable_trailing = false;
        let bracket = BracketOrder {
            entry_order_id: "e1".into(),
            stop_order_id: Some("s1".into()),
            tp_order_id: None,
            entry_price: dec!(100),
            stop_price: dec!(98), // matches monitor SL of 100*(1-0.02)=98
            tp_price: dec!(105),
            status: BracketStatus::Active,
        };
        let decision = decide_exit(&ctx(-0.025), Some(&bracket), &config);
        assert_eq!(decision, ExitDecision::DeferToBracketStop);
    }

    #[test]
    fn soft_stop_overrides_mismatched_bracket_with_aggressive_limit() {
        let config = PositionMonitorConfig::default();
        let bracket = BracketOrder {
            entry_order_id: "e1".into(),
            stop_order_id: Some("s1".into()),
            tp_order_id: None,
            entry_price: dec!(100),
            stop_price: dec!(90), // far from monitor SL
            tp_price: dec!(105),
            status: BracketStatus::Active,
        };
        let decision = decide_exit(&ctx(-0.025), Some(&bracket), &config);
        assert_eq!(decision, ExitDecision::SoftStop { use_market: false });
    }

    #[test]
    fn soft_stop_uses_market_order_past_three_percent_loss() {
        let config = PositionMonitorConfig::default();
        let decision = decide_exit(&ctx(-0.04), None, &config);
        assert_eq!(decision, ExitDecision::SoftStop { use_market: true });
    }

    #[test]
    fn trailing_hit_triggers_exit_when_active() {
        let config = PositionMonitorConfig::default();
        let mut context = ctx(0.02);
        context.trailing_active = true;
        context.trailing_hit = true;
        let decision = decide_exit(&context, None, &config);
        assert_eq!(decision, ExitDecision::TrailingStop);
    }

    #[test]
    fn signal_exit_fires_before_trailing_activates() {
        let config = PositionMonitorConfig::default();
        let mut context = ctx(0.01);
        context.trailing_active = false;
        context.signal_is_sell = true;
        let decision = decide_exit(&context, None, &config);
        assert_eq!(decision, ExitDecision::SignalExit);
    }

    #[test]
    fn take_profit_fires_when_trailing_disabled() {
        let mut config = PositionMonitorConfig::default();
        config.enable_trailing = false;
        let decision = decide_exit(&ctx(0.02), None, &config);
        assert_eq!(decision, ExitDecision::TakeProfit);
    }

    #[test]
    fn take_profit_defers_to_aligned_bracket() {
        let mut config = PositionMonitorConfig::default();
        config.enable_trailing = false;
        let bracket = BracketOrder {
            entry_order_id: "e1".into(),
            stop_order_id: None,
            tp_order_id: Some("t1".into()),
            entry_price: dec!(100),
            stop_price: dec!(95),
            tp_price: dec!(101.5), // matches monitor TP of 100*(1+0.015)=101.5
            status: BracketStatus::Active,
        };
        let decision = decide_exit(&ctx(0.02), Some(&bracket), &config);
        assert_eq!(decision, ExitDecision::DeferToBracketTakeProfit);
    }

    #[test]
    fn hold_when_nothing_triggers() {
        let mut config = PositionMonitorConfig::default();
        config.enable_trailing = false;
        let decision = decide_exit(&ctx(0.005), None, &config);
        assert_eq!(decision, ExitDecision::Hold);
    }
}
