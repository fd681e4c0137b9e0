// =============================================================================
// Trailing Stop — pure update function (SPEC_FULL.md §4.F)
// =============================================================================
//
// One call per position per monitor tick. `last_high`/`stop_price` only ever
// move in the profitable direction: the high-water mark rises monotonically,
// the stop price is raised, never lowered. Activation requires the position
// to already be in profit.
// =============================================================================

use rust_decimal::Decimal;

use crate::types::TrailingStopState;

#[derive(Debug, Clone, Copy)]
pub struct TrailingConfig {
    pub atr_mult: f64,
    pub min_dist_pct: f64,
    pub max_dist_pct: f64,
    pub activation_pct: f64,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            atr_mult: 2.0,
            min_dist_pct: 0.003,
            max_dist_pct: 0.03,
            activation_pct: 0.01,
        }
    }
}

pub fn initial_state(mid: Decimal) -> TrailingStopState {
    TrailingStopState {
        last_high: mid,
        stop_price: None,
        last_atr_pct: 0.0,
        trailing_active: false,
    }
}

/// Advance `state` for the current `mid`/`atr_pct`/`pnl_pct` reading.
/// Returns the updated state and whether the trailing stop has been hit
/// (`mid <= stop_price` while active).
pub fn update(
    state: TrailingStopState,
    mid: Decimal,
    atr_pct: f64,
    pnl_pct: f64,
    config: &TrailingConfig,
) -> (TrailingStopState, bool) {
    let mut next = state;

    if mid > next.last_high {
        next.last_high = mid;
        next.last_atr_pct = atr_pct;
    }

    if !next.trailing_active && pnl_pct >= config.activation_pct {
        next.trailing_active = true;
    }

    if !next.trailing_active {
        return (next, false);
    }

    let high_f = next.last_high.to_string().parse::<f64>().unwrap_or(0.0);
    let candidate = high_f * (1.0 - next.last_atr_pct * config.atr_mult);

    let floor = mid.to_string().parse::<f64>().unwrap_or(0.0) * (1.0 - config.max_dist_pct);
    let ceiling = mid.to_string().parse::<f64>().unwrap_or(0.0) * (1.0 - config.min_dist_pct);
    let clamped = candidate.max(floor).min(ceiling);

    let clamped_decimal = Decimal::try_from(clamped).unwrap_or(next.last_high);

    next.stop_price = Some(match next.stop_price {
        Some(existing) if existing >= clamped_decimal => existing,
        _ => clamped_decimal,
    });

    let hit = next.stop_price.map(|sp| mid <= sp).unwrap_or(false);

    (next, hit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn inactive_below_activation_threshold_never_sets_stop() {
        let state = initial_state(dec!(100));
        let config = TrailingConfig::default();
        let (next, hit) = update(state, dec!(100.5), 0.01, 0.005, &config);
        assert!(!next.trailing_active);
        assert!(next.stop_price.is_none());
        assert!(!hit);
    }

    #[test]
    fn activates_and_sets_stop_once_in_profit() {
        let state = initial_state(dec!(100));
        let config = TrailingConfig::default();
        let (next, hit) = update(state, dec!(102), 0.01, 0.02, &config);
        assert!(next.trailing_active);
        assert!(next.stop_price.is_some());
        assert!(!hit);
    }

    #[test]
    fn stop_never_lowers_when_price_pulls_back() {
        let state = initial_state(dec!(100));
        let config = TrailingConfig::default();
        let (state, _) = update(state, dec!(110), 0.01, 0.10, &config);
        let high_stop = state.stop_price.unwrap();

        let (state2, _) = update(state, dec!(105), 0.01, 0.05, &config);
        assert_eq!(state2.stop_price.unwrap(), high_stop);
        assert_eq!(state2.last_high, dec!(110));
    }

    #[test]
    fn stop_raises_as_new_highs_are_made() {
        let state = initial_state(dec!(100));
        let config = TrailingConfig::default();
        let (state, _) = update(state, dec!(105), 0.01, 0.05, &config);
        let first_stop = state.stop_price.unwrap();

        let (state2, _) = update(state, dec!(115), 0.01, 0.15, &config);
        assert!(state2.stop_price.unwrap() > first_stop);
    }

    #[test]
    fn fires_when_price_falls_to_stop() {
        let state = initial_state(dec!(100));
        let config = TrailingConfig::default();
        let (state, _) = update(state, dec!(110), 0.02, 0.10, &config);
        let stop = state.stop_price.unwrap();

        let crash_price = stop - dec!(0.01);
        let (_, hit) = update(state, crash_price, 0.02, -0.01, &config);
        assert!(hit);
    }
}
