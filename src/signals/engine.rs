// =============================================================================
// Signal Engine (SPEC_FULL.md §4.D)
// =============================================================================
//
// `Score(symbol, annotatedBar) -> SignalScores`, implementing the eight-step
// algorithm: momentum override, weighted scoring, minimum-indicator
// confirmation, hysteresis, cooldown, conflict resolution, state update,
// unconditional JSONL log emission. Guardrail state (`last_side`,
// `cooldown_until`) is per symbol and persists across evaluations.
// =============================================================================

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::warn;

use crate::types::{AnnotatedBar, IndicatorContribution, SignalAction, SignalScores};

#[derive(Debug, Clone)]
pub struct SignalEngineConfig {
    pub indicator_weights: HashMap<String, f64>,
    pub score_buy_target: f64,
    pub score_sell_target: f64,
    pub min_indicators_required: u32,
    pub cooldown_bars: u64,
    pub flip_hysteresis_pct: f64,
    pub roc_24h_buy_threshold: f64,
    pub roc_24h_sell_threshold: f64,
    pub roc_24h_rsi_band: (f64, f64),
    pub score_log_path: Option<PathBuf>,
}

impl Default for SignalEngineConfig {
    fn default() -> Self {
        let mut weights = HashMap::new();
        weights.insert("bollinger_ratio".to_string(), 0.15);
        weights.insert("bollinger_touch".to_string(), 0.10);
        weights.insert("rsi".to_string(), 0.20);
        weights.insert("roc".to_string(), 0.15);
        weights.insert("macd".to_string(), 0.15);
        weights.insert("swing".to_string(), 0.15);
        weights.insert("pattern".to_string(), 0.10);

        Self {
            indicator_weights: weights,
            score_buy_target: 0.5,
            score_sell_target: 0.5,
            min_indicators_required: 2,
            cooldown_bars: 7,
            flip_hysteresis_pct: 0.10,
            roc_24h_buy_threshold: 10.0,
            roc_24h_sell_threshold: -5.0,
            roc_24h_rsi_band: (45.0, 55.0),
            score_log_path: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SymbolGuardState {
    last_side: Option<SignalAction>,
    cooldown_until: Option<u64>,
}

pub struct SignalEngine {
    config: RwLock<SignalEngineConfig>,
    states: RwLock<HashMap<String, SymbolGuardState>>,
}

struct NamedTuples<'a> {
    name: &'static str,
    buy: &'a crate::types::IndicatorTuple,
    sell: &'a crate::types::IndicatorTuple,
}

fn named_tuples(bar: &AnnotatedBar) -> Vec<NamedTuples<'_>> {
    vec![
        NamedTuples { name: "bollinger_ratio", buy: &bar.buy_bollinger_ratio, sell: &bar.sell_bollinger_ratio },
        NamedTuples { name: "bollinger_touch", buy: &bar.buy_bollinger_touch, sell: &bar.sell_bollinger_touch },
        NamedTuples { name: "rsi", buy: &bar.buy_rsi, sell: &bar.sell_rsi },
        NamedTuples { name: "roc", buy: &bar.buy_roc, sell: &bar.sell_roc },
        NamedTuples { name: "macd", buy: &bar.buy_macd, sell: &bar.sell_macd },
        NamedTuples { name: "swing", buy: &bar.buy_swing, sell: &bar.sell_swing },
        NamedTuples { name: "pattern", buy: &bar.buy_pattern, sell: &bar.sell_pattern },
    ]
}

impl SignalEngine {
    pub fn new(config: SignalEngineConfig) -> Self {
        Self {
            config: RwLock::new(config),
            states: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_config(&self, config: SignalEngineConfig) {
        *self.config.write() = config;
    }

    /// Score `symbol` from its most recent annotated bar. `roc_24h` is the
    /// 24-hour price change read from the USD pairs cache (§4.D step 1);
    /// `price` is the current mid/last price for the score log.
    pub fn score(&self, symbol: &str, bar: &AnnotatedBar, roc_24h: Option<f64>, price: Decimal) -> SignalScores {
        let config = self.config.read().clone();
        let mut states = self.states.write();
        let state = states.entry(symbol.to_string()).or_default();

        // ---- Step 1: momentum override -------------------------------------
        if let (Some(roc24), Some(rsi)) = (roc_24h, bar.raw_rsi) {
            let (lo, hi) = config.roc_24h_rsi_band;
            if roc24 > config.roc_24h_buy_threshold && rsi >= lo && rsi <= hi {
                let result = finalize(
                    symbol,
                    bar,
                    price,
                    SignalAction::Buy,
                    "roc_momo_24h".to_string(),
                    0.0,
                    0.0,
                    Vec::new(),
                );
                update_state(state, SignalAction::Buy, bar.bar_idx, config.cooldown_bars);
                log_result(&config, &result);
                return result;
            }
            if roc24 < config.roc_24h_sell_threshold && rsi >= lo && rsi <= hi {
                let result = finalize(
                    symbol,
                    bar,
                    price,
                    SignalAction::Sell,
                    "roc_momo_24h".to_string(),
                    0.0,
                    0.0,
                    Vec::new(),
                );
                update_state(state, SignalAction::Sell, bar.bar_idx, config.cooldown_bars);
                log_result(&config, &result);
                return result;
            }
        }

        // ---- Step 2: weighted scoring ---------------------------------------
        let mut buy_score = 0.0;
        let mut sell_score = 0.0;
        let mut buy_fired_count = 0u32;
        let mut sell_fired_count = 0u32;
        let mut contributions = Vec::new();

        for t in named_tuples(bar) {
            let weight = config.indicator_weights.get(t.name).copied().unwrap_or(0.0);

            let buy_decision = t.buy.fired as i8;
            buy_score += weight * buy_decision as f64;
            if t.buy.fired {
                buy_fired_count += 1;
            }
            contributions.push(IndicatorContribution {
                indicator: format!("buy_{}", t.name),
                decision: buy_decision,
                value: t.buy.observed,
                threshold: t.buy.threshold,
                weight,
                contribution: weight * buy_decision as f64,
            });

            let sell_decision = t.sell.fired as i8;
            sell_score += weight * sell_decision as f64;
            if t.sell.fired {
                sell_fired_count += 1;
            }
            contributions.push(IndicatorContribution {
                indicator: format!("sell_{}", t.name),
                decision: sell_decision,
                value: t.sell.observed,
                threshold: t.sell.threshold,
                weight,
                contribution: weight * sell_decision as f64,
            });
        }

        let mut buy_passes = buy_score >= config.score_buy_target;
        let mut sell_passes = sell_score >= config.score_sell_target;
        let mut trigger_buy_suppress: Option<String> = None;
        let mut trigger_sell_suppress: Option<String> = None;

        // ---- Step 3: minimum-indicator confirmation -------------------------
        if buy_passes && buy_fired_count < config.min_indicators_required {
            buy_passes = false;
            trigger_buy_suppress = Some(format!(
                "buy_suppressed_insufficient_indicators_{}_of_{}",
                buy_fired_count, config.min_indicators_required
            ));
        }
        if sell_passes && sell_fired_count < config.min_indicators_required {
            sell_passes = false;
            trigger_sell_suppress = Some(format!(
                "sell_suppressed_insufficient_indicators_{}_of_{}",
                sell_fired_count, config.min_indicators_required
            ));
        }

        // ---- Step 4: hysteresis ----------------------------------------------
        if buy_passes && state.last_side == Some(SignalAction::Sell) {
            let required = config.score_buy_target * (1.0 + config.flip_hysteresis_pct);
            if buy_score <= required {
                buy_passes = false;
                trigger_buy_suppress = Some("buy_suppressed_by_hysteresis".to_string());
            }
        }
        if sell_passes && state.last_side == Some(SignalAction::Buy) {
            let required = config.score_sell_target * (1.0 + config.flip_hysteresis_pct);
            if sell_score <= required {
                sell_passes = false;
                trigger_sell_suppress = Some("sell_suppressed_by_hysteresis".to_string());
            }
        }

        // ---- Step 5: cooldown --------------------------------------------------
        if let Some(cooldown_until) = state.cooldown_until {
            if bar.bar_idx < cooldown_until {
                if buy_passes && state.last_side == Some(SignalAction::Sell) {
                    buy_passes = false;
                    trigger_buy_suppress = Some("buy_suppressed_by_cooldown".to_string());
                }
                if sell_passes && state.last_side == Some(SignalAction::Buy) {
                    sell_passes = false;
                    trigger_sell_suppress = Some("sell_suppressed_by_cooldown".to_string());
                }
            }
        }

        // ---- Step 6: conflict resolution --------------------------------------
        let (action, trigger) = match (buy_passes, sell_passes) {
            (true, true) => {
                if buy_score >= sell_score {
                    (SignalAction::Buy, "score".to_string())
                } else {
                    (SignalAction::Sell, "score".to_string())
                }
            }
            (true, false) => (SignalAction::Buy, "score".to_string()),
            (false, true) => (SignalAction::Sell, "score".to_string()),
            (false, false) => {
                let reason = trigger_sell_suppress
                    .or(trigger_buy_suppress)
                    .unwrap_or_else(|| "hold".to_string());
                (SignalAction::Hold, reason)
            }
        };

        // ---- Step 7: state update ----------------------------------------------
        if action != SignalAction::Hold && state.last_side != Some(action) {
            update_state(state, action, bar.bar_idx, config.cooldown_bars);
        }

        let result = finalize(symbol, bar, price, action, trigger, buy_score, sell_score, contributions);

        // ---- Step 8: log emission (unconditional, never propagates failure) ---
        log_result(&config, &result);

        result
    }
}

fn update_state(state: &mut SymbolGuardState, action: SignalAction, bar_idx: u64, cooldown_bars: u64) {
    state.last_side = Some(action);
    state.cooldown_until = Some(bar_idx + cooldown_bars);
}

fn finalize(
    symbol: &str,
    bar: &AnnotatedBar,
    price: Decimal,
    action: SignalAction,
    trigger: String,
    buy_score: f64,
    sell_score: f64,
    contributions: Vec<IndicatorContribution>,
) -> SignalScores {
    SignalScores {
        symbol: symbol.to_string(),
        timestamp: bar.bar.timestamp,
        bar_idx: bar.bar_idx,
        price,
        buy_score,
        sell_score,
        contributions,
        action,
        trigger,
    }
}

fn top_components(contributions: &[IndicatorContribution], prefix: &str, n: usize) -> Vec<serde_json::Value> {
    let mut filtered: Vec<&IndicatorContribution> = contributions
        .iter()
        .filter(|c| c.indicator.starts_with(prefix))
        .collect();
    filtered.sort_by(|a, b| b.contribution.abs().partial_cmp(&a.contribution.abs()).unwrap_or(std::cmp::Ordering::Equal));
    filtered
        .into_iter()
        .take(n)
        .map(|c| {
            serde_json::json!({
                "indicator": c.indicator,
                "decision": c.decision,
                "value": c.value,
                "threshold": c.threshold,
                "weight": c.weight,
                "contribution": c.contribution,
            })
        })
        .collect()
}

fn log_result(config: &SignalEngineConfig, result: &SignalScores) {
    let Some(path) = &config.score_log_path else {
        return;
    };

    let record = serde_json::json!({
        "ts": result.timestamp.to_rfc3339(),
        "symbol": result.symbol,
        "bar_idx": result.bar_idx,
        "price": result.price.to_string(),
        "action": result.action.to_string(),
        "trigger": result.trigger,
        "buy_score": result.buy_score,
        "sell_score": result.sell_score,
        "target_buy": config.score_buy_target,
        "target_sell": config.score_sell_target,
        "last_side": result.action.to_string(),
        "cooldown_until": serde_json::Value::Null,
        "top_buy_components": top_components(&result.contributions, "buy_", 5),
        "top_sell_components": top_components(&result.contributions, "sell_", 5),
    });

    let line = match serde_json::to_string(&record) {
        Ok(l) => l,
        Err(err) => {
            warn!(error = %err, "failed to serialise score log record");
            return;
        }
    };

    let file = OpenOptions::new().create(true).append(true).open(path);
    match file {
        Ok(mut f) => {
            if let Err(err) = writeln!(f, "{line}") {
                warn!(error = %err, "failed to write score log record");
            }
        }
        Err(err) => {
            warn!(error = %err, path = %path.display(), "failed to open score log file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Bar, IndicatorTuple};
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn empty_bar(bar_idx: u64) -> AnnotatedBar {
        AnnotatedBar {
            bar: Bar {
                symbol: "BTC-USD".into(),
                timestamp: Utc::now(),
                open: dec!(1),
                high: dec!(1),
                low: dec!(1),
                close: dec!(1),
                volume: dec!(1),
            },
            bar_idx,
            buy_bollinger_ratio: IndicatorTuple::NONE,
            sell_bollinger_ratio: IndicatorTuple::NONE,
            buy_bollinger_touch: IndicatorTuple::NONE,
            sell_bollinger_touch: IndicatorTuple::NONE,
            buy_rsi: IndicatorTuple::NONE,
            sell_rsi: IndicatorTuple::NONE,
            buy_roc: IndicatorTuple::NONE,
            sell_roc: IndicatorTuple::NONE,
            buy_macd: IndicatorTuple::NONE,
            sell_macd: IndicatorTuple::NONE,
            buy_swing: IndicatorTuple::NONE,
            sell_swing: IndicatorTuple::NONE,
            buy_pattern: IndicatorTuple::NONE,
            sell_pattern: IndicatorTuple::NONE,
            raw_roc: None,
            raw_rsi: Some(50.0),
            raw_macd_hist: None,
            raw_upper_band: None,
            raw_lower_band: None,
        }
    }

    #[test]
    fn momentum_override_wins_on_strong_24h_roc() {
        let engine = SignalEngine::new(SignalEngineConfig::default());
        let bar = empty_bar(1);
        let result = engine.score("BTC-USD", &bar, Some(15.0), dec!(40000));
        assert_eq!(result.action, SignalAction::Buy);
        assert_eq!(result.trigger, "roc_momo_24h");
    }

    #[test]
    fn no_signals_is_hold() {
        let engine = SignalEngine::new(SignalEngineConfig::default());
        let bar = empty_bar(1);
        let result = engine.score("BTC-USD", &bar, None, dec!(40000));
        assert_eq!(result.action, SignalAction::Hold);
    }

    #[test]
    fn minimum_indicator_confirmation_suppresses_single_fire() {
        let mut engine_config = SignalEngineConfig::default();
        engine_config.score_buy_target = 0.1;
        engine_config.min_indicators_required = 2;
        let engine = SignalEngine::new(engine_config);

        let mut bar = empty_bar(1);
        bar.buy_rsi = IndicatorTuple::fired(20.0, 37.0); // only one indicator fires

        let result = engine.score("BTC-USD", &bar, None, dec!(40000));
        assert_eq!(result.action, SignalAction::Hold);
        assert!(result.trigger.starts_with("buy_suppressed_insufficient_indicators"));
    }

    #[test]
    fn cooldown_suppresses_opposite_side_flip() {
        let mut cfg = SignalEngineConfig::default();
        cfg.score_buy_target = 0.1;
        cfg.score_sell_target = 0.1;
        cfg.min_indicators_required = 1;
        cfg.cooldown_bars = 7;
        cfg.flip_hysteresis_pct = 10.0; // make hysteresis unreachable so cooldown is the blocker
        let engine = SignalEngine::new(cfg);

        let mut buy_bar = empty_bar(100);
        buy_bar.buy_rsi = IndicatorTuple::fired(20.0, 37.0);
        let buy_result = engine.score("BTC-USD", &buy_bar, None, dec!(40000));
        assert_eq!(buy_result.action, SignalAction::Buy);

        let mut sell_bar = empty_bar(104);
        sell_bar.sell_rsi = IndicatorTuple::fired(80.0, 63.0);
        let sell_result = engine.score("BTC-USD", &sell_bar, None, dec!(40000));
        assert_eq!(sell_result.action, SignalAction::Hold);
        assert!(sell_result.trigger.contains("suppressed"));
    }

    #[test]
    fn hysteresis_blocks_marginal_flip() {
        let mut cfg = SignalEngineConfig::default();
        cfg.score_buy_target = 0.1;
        cfg.score_sell_target = 0.1;
        cfg.min_indicators_required = 1;
        cfg.cooldown_bars = 0;
        cfg.flip_hysteresis_pct = 10.0; // sell needs > 0.1 * 11 = 1.1, unreachable with one indicator
        let engine = SignalEngine::new(cfg);

        let mut buy_bar = empty_bar(1);
        buy_bar.buy_rsi = IndicatorTuple::fired(20.0, 37.0);
        engine.score("BTC-USD", &buy_bar, None, dec!(40000));

        let mut sell_bar = empty_bar(2);
        sell_bar.sell_rsi = IndicatorTuple::fired(80.0, 63.0);
        let result = engine.score("BTC-USD", &sell_bar, None, dec!(40000));
        assert_eq!(result.action, SignalAction::Hold);
        assert_eq!(result.trigger, "sell_suppressed_by_hysteresis");
    }
}
