// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// Unweighted mean of the trailing `period` closes. Used directly by the
// Swing indicator (50-SMA / 200-SMA trend filter) and as a building block
// for indicators that need a plain rolling mean rather than EMA's recency
// weighting.
// =============================================================================

/// Compute the SMA series for `closes` over `period`.
///
/// Returns an empty `Vec` when `period == 0` or `closes.len() < period`.
/// Output element `i` corresponds to the mean of `closes[i..i+period]`.
pub fn calculate_sma(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(closes.len() - period + 1);
    let mut window_sum: f64 = closes[..period].iter().sum();
    result.push(window_sum / period as f64);

    for i in period..closes.len() {
        window_sum += closes[i] - closes[i - period];
        result.push(window_sum / period as f64);
    }

    result
}

/// Convenience: the most recent SMA value, or `None` if there isn't enough
/// data.
pub fn current_sma(closes: &[f64], period: usize) -> Option<f64> {
    calculate_sma(closes, period).last().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sma_empty_input() {
        assert!(calculate_sma(&[], 5).is_empty());
    }

    #[test]
    fn sma_period_zero() {
        assert!(calculate_sma(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn sma_insufficient_data() {
        assert!(calculate_sma(&[1.0, 2.0], 5).is_empty());
    }

    #[test]
    fn sma_known_values() {
        let closes = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let sma = calculate_sma(&closes, 3);
        assert_eq!(sma.len(), 3);
        assert!((sma[0] - 2.0).abs() < 1e-10);
        assert!((sma[1] - 3.0).abs() < 1e-10);
        assert!((sma[2] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn sma_period_equals_length() {
        let closes = vec![2.0, 4.0, 6.0];
        let sma = calculate_sma(&closes, 3);
        assert_eq!(sma.len(), 1);
        assert!((sma[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn current_sma_none_when_insufficient() {
        assert!(current_sma(&[1.0, 2.0], 5).is_none());
    }
}
