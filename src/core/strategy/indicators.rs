//! Rolling statistics shared by strategies and sizing.

use crate::core::domain::Bar;

/// Arithmetic mean. Returns `None` on an empty slice.
#[must_use]
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (n − 1 denominator). Returns `None` with fewer
/// than two values.
#[must_use]
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let mu = mean(values)?;
    let sum_sq: f64 = values.iter().map(|v| (v - mu).powi(2)).sum();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

/// Z-score of `value` against a rolling window. `None` when the window is
/// degenerate (fewer than two values or zero deviation).
#[must_use]
pub fn z_score(value: f64, values: &[f64]) -> Option<f64> {
    let mu = mean(values)?;
    let sigma = sample_std(values)?;
    if sigma <= f64::EPSILON {
        return None;
    }
    Some((value - mu) / sigma)
}

/// Average true range over consecutive bars. Needs at least two bars.
#[must_use]
pub fn average_true_range(bars: &[Bar]) -> Option<f64> {
    if bars.len() < 2 {
        return None;
    }
    let ranges: Vec<f64> = bars
        .windows(2)
        .map(|pair| pair[1].true_range(pair[0].close))
        .collect();
    mean(&ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::domain::{Symbol, Timeframe, Venue};

    fn bar(close: f64, high: f64, low: f64) -> Bar {
        Bar {
            venue: Venue::new("mock"),
            symbol: Symbol::normalize("BTCUSDT"),
            ts_ms: 0,
            open: close,
            high,
            low,
            close,
            volume: 1.0,
            timeframe: Timeframe::M1,
        }
    }

    #[test]
    fn mean_and_std() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        assert!((mean(&values).unwrap() - 5.0).abs() < 1e-9);
        // Sample std of this classic set is ~2.138.
        let std = sample_std(&values).unwrap();
        assert!((std - 2.138089935).abs() < 1e-6);
    }

    #[test]
    fn degenerate_windows_yield_none() {
        assert!(mean(&[]).is_none());
        assert!(sample_std(&[1.0]).is_none());
        assert!(z_score(1.0, &[5.0, 5.0, 5.0]).is_none()); // zero deviation
    }

    #[test]
    fn z_score_signs() {
        let values = [10.0, 12.0, 8.0, 11.0, 9.0];
        assert!(z_score(15.0, &values).unwrap() > 0.0);
        assert!(z_score(5.0, &values).unwrap() < 0.0);
    }

    #[test]
    fn atr_averages_true_ranges() {
        let bars = vec![
            bar(100.0, 101.0, 99.0),
            bar(102.0, 103.0, 100.0), // TR = max(3, 3, 0) = 3
            bar(101.0, 102.5, 100.5), // TR = max(2, 0.5, 1.5) = 2
        ];
        let atr = average_true_range(&bars).unwrap();
        assert!((atr - 2.5).abs() < 1e-9);
        assert!(average_true_range(&bars[..1]).is_none());
    }
}
