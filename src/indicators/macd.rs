// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
// MACD line = EMA_fast - EMA_slow
// Signal    = EMA(MACD line, signal_period)
// Histogram = MACD line - Signal
//
// The fast/slow EMAs are computed over the full close series (not windowed
// independently) so they share a common time axis before subtracting;
// `align_series` trims the longer series to match the shorter one's length.
// =============================================================================

use super::ema::calculate_ema;

#[derive(Debug, Clone, Copy)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

fn align_series(fast: &[f64], slow: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let len = fast.len().min(slow.len());
    let fast_tail = fast[fast.len() - len..].to_vec();
    let slow_tail = slow[slow.len() - len..].to_vec();
    (fast_tail, slow_tail)
}

/// Compute the MACD line series (no signal smoothing) for `closes`.
///
/// Returns an empty `Vec` if there isn't enough data for the slow EMA.
pub fn calculate_macd_line(closes: &[f64], fast_period: usize, slow_period: usize) -> Vec<f64> {
    if closes.len() < slow_period || fast_period == 0 || slow_period == 0 {
        return Vec::new();
    }

    let fast = calculate_ema(closes, fast_period);
    let slow = calculate_ema(closes, slow_period);
    if fast.is_empty() || slow.is_empty() {
        return Vec::new();
    }

    let (fast, slow) = align_series(&fast, &slow);
    fast.iter().zip(slow.iter()).map(|(f, s)| f - s).collect()
}

/// Compute the full MACD triple (line, signal, histogram) as of the most
/// recent closed bar. Returns `None` when there isn't enough data to seed
/// the signal EMA.
pub fn current_macd(
    closes: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> Option<MacdOutput> {
    let macd_line = calculate_macd_line(closes, fast_period, slow_period);
    if macd_line.len() < signal_period || signal_period == 0 {
        return None;
    }

    let signal_series = calculate_ema(&macd_line, signal_period);
    let signal = *signal_series.last()?;
    let macd = *macd_line.last()?;
    let histogram = macd - signal;

    if !macd.is_finite() || !signal.is_finite() || !histogram.is_finite() {
        return None;
    }

    Some(MacdOutput {
        macd,
        signal,
        histogram,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ascending(n: usize) -> Vec<f64> {
        (1..=n).map(|i| i as f64).collect()
    }

    #[test]
    fn macd_line_empty_on_insufficient_data() {
        assert!(calculate_macd_line(&ascending(10), 12, 26).is_empty());
    }

    #[test]
    fn macd_line_zero_period_guard() {
        assert!(calculate_macd_line(&ascending(50), 0, 26).is_empty());
    }

    #[test]
    fn macd_line_nonempty_on_sufficient_data() {
        let line = calculate_macd_line(&ascending(60), 12, 26);
        assert!(!line.is_empty());
    }

    #[test]
    fn current_macd_none_when_insufficient_for_signal() {
        // Enough for the line but not enough line points to seed a 9-period signal.
        assert!(current_macd(&ascending(27), 12, 26, 9).is_none());
    }

    #[test]
    fn current_macd_ascending_trend_is_positive_histogram_eventually() {
        let closes = ascending(200);
        let out = current_macd(&closes, 12, 26, 9).expect("enough data");
        // A steadily ascending series has a positive, growing MACD line.
        assert!(out.macd > 0.0);
        assert!(out.macd.is_finite() && out.signal.is_finite() && out.histogram.is_finite());
    }

    #[test]
    fn current_macd_flat_series_is_near_zero() {
        let closes = vec![50.0; 200];
        let out = current_macd(&closes, 12, 26, 9).expect("enough data");
        assert!(out.macd.abs() < 1e-9);
        assert!(out.histogram.abs() < 1e-9);
    }
}
