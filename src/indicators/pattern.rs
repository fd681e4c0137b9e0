// =============================================================================
// W-Bottom / M-Top pattern detector
// =============================================================================
//
// A W-bottom is two local minima close to (or below) the lower Bollinger
// band, where the second low is higher than the first (a "higher low") and
// the bar following the second low shows volume confirmation (above the
// rolling mean). An M-top is the symmetric inverse against the upper band.
//
// This only looks at the trailing `lookback` bars — it is a short-horizon
// reversal confirmation, not a standalone trend signal.
// =============================================================================

const DEFAULT_LOOKBACK: usize = 20;
const VOLUME_CONFIRM_MULT: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternSignal {
    WBottom,
    MTop,
}

/// Find local minima/maxima indices in `closes[start..]` (inclusive of
/// `start`), where a local extremum is strictly lower/higher than both
/// neighbours.
fn local_minima(closes: &[f64]) -> Vec<usize> {
    let mut out = Vec::new();
    for i in 1..closes.len().saturating_sub(1) {
        if closes[i] < closes[i - 1] && closes[i] < closes[i + 1] {
            out.push(i);
        }
    }
    out
}

fn local_maxima(closes: &[f64]) -> Vec<usize> {
    let mut out = Vec::new();
    for i in 1..closes.len().saturating_sub(1) {
        if closes[i] > closes[i - 1] && closes[i] > closes[i + 1] {
            out.push(i);
        }
    }
    out
}

/// Detect a W-bottom or M-top in the trailing `lookback` bars of `closes`,
/// confirmed by `volumes` on the most recent bar exceeding the window's mean
/// volume by at least `VOLUME_CONFIRM_MULT`, with the extrema touching the
/// Bollinger band passed in `lower_band`/`upper_band` (most recent value).
///
/// Returns `None` when there isn't enough data, no qualifying pair of
/// extrema exists, or volume doesn't confirm.
pub fn detect_pattern(
    closes: &[f64],
    volumes: &[f64],
    lower_band: f64,
    upper_band: f64,
    lookback: usize,
) -> Option<PatternSignal> {
    let lookback = if lookback == 0 { DEFAULT_LOOKBACK } else { lookback };
    if closes.len() < lookback || volumes.len() != closes.len() {
        return None;
    }

    let window = &closes[closes.len() - lookback..];
    let vol_window = &volumes[volumes.len() - lookback..];
    let mean_volume = vol_window.iter().sum::<f64>() / vol_window.len() as f64;
    let last_volume = *vol_window.last()?;
    if !mean_volume.is_finite() || mean_volume <= 0.0 {
        return None;
    }
    let volume_confirmed = last_volume >= mean_volume * VOLUME_CONFIRM_MULT;
    if !volume_confirmed {
        return None;
    }

    // W-bottom: last two local minima, second higher than first, both near
    // or below the lower band.
    let minima = local_minima(window);
    if minima.len() >= 2 {
        let (i1, i2) = (minima[minima.len() - 2], minima[minima.len() - 1]);
        let (low1, low2) = (window[i1], window[i2]);
        if low2 > low1 && low1 <= lower_band * 1.01 {
            return Some(PatternSignal::WBottom);
        }
    }

    // M-top: last two local maxima, second lower than first, both near or
    // above the upper band.
    let maxima = local_maxima(window);
    if maxima.len() >= 2 {
        let (i1, i2) = (maxima[maxima.len() - 2], maxima[maxima.len() - 1]);
        let (high1, high2) = (window[i1], window[i2]);
        if high2 < high1 && high1 >= upper_band * 0.99 {
            return Some(PatternSignal::MTop);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_data_returns_none() {
        let closes = vec![1.0, 2.0, 3.0];
        let volumes = vec![1.0, 1.0, 1.0];
        assert!(detect_pattern(&closes, &volumes, 0.9, 3.5, 20).is_none());
    }

    #[test]
    fn mismatched_volume_length_returns_none() {
        let closes = vec![1.0; 25];
        let volumes = vec![1.0; 10];
        assert!(detect_pattern(&closes, &volumes, 0.5, 2.0, 20).is_none());
    }

    #[test]
    fn low_volume_suppresses_pattern() {
        // Construct a clean W shape but with a quiet final bar.
        let mut closes = vec![10.0; 20];
        closes[10] = 5.0; // first low
        closes[13] = 6.0; // second, higher low
        let mut volumes = vec![10.0; 20];
        *volumes.last_mut().unwrap() = 0.1; // quiet last bar
        assert!(detect_pattern(&closes, &volumes, 6.5, 12.0, 20).is_none());
    }

    #[test]
    fn detects_w_bottom_with_confirmation() {
        let mut closes = vec![10.0; 20];
        closes[8] = 5.0; // first low
        closes[9] = 7.0;
        closes[12] = 5.5; // second, higher low
        closes[13] = 9.0;
        let volumes = vec![10.0; 20];
        let signal = detect_pattern(&closes, &volumes, 6.0, 12.0, 20);
        assert_eq!(signal, Some(PatternSignal::WBottom));
    }

    #[test]
    fn detects_m_top_with_confirmation() {
        let mut closes = vec![1.0; 20];
        closes[8] = 5.0; // first high
        closes[9] = 3.0;
        closes[12] = 4.5; // second, lower high
        closes[13] = 1.5;
        let volumes = vec![10.0; 20];
        let signal = detect_pattern(&closes, &volumes, 0.5, 4.0, 20);
        assert_eq!(signal, Some(PatternSignal::MTop));
    }
}
