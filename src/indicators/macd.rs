// =============================================================================
// Moving Average Convergence / Divergence (MACD)
// =============================================================================
//
//   line      = EMA(fast) - EMA(slow)
//   signal    = EMA(signal_period) of line
//   histogram = line - signal
// =============================================================================

use super::ema::calculate_ema;

/// MACD line, signal line and histogram, each aligned with the input.
#[derive(Debug, Clone, Default)]
pub struct MacdSeries {
    pub line: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

/// Compute MACD over `closes`. Any zero period yields empty series.
pub fn calculate_macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> MacdSeries {
    if fast == 0 || slow == 0 || signal == 0 {
        return MacdSeries::default();
    }

    let ema_fast = calculate_ema(closes, fast);
    let ema_slow = calculate_ema(closes, slow);
    let line: Vec<f64> = ema_fast.iter().zip(&ema_slow).map(|(f, s)| f - s).collect();
    let signal = calculate_ema(&line, signal);
    let histogram = line.iter().zip(&signal).map(|(m, s)| m - s).collect();

    MacdSeries {
        line,
        signal,
        histogram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
        let step = (end - start) / (n - 1) as f64;
        (0..n).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn macd_shapes_and_consistency() {
        let closes = linspace(100.0, 200.0, 300);
        let m = calculate_macd(&closes, 12, 26, 9);
        assert_eq!(m.line.len(), closes.len());
        assert_eq!(m.signal.len(), closes.len());
        assert_eq!(m.histogram.len(), closes.len());
        for i in 0..closes.len() {
            assert!((m.histogram[i] - (m.line[i] - m.signal[i])).abs() <= 1e-10);
        }
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes = linspace(100.0, 200.0, 300);
        let m = calculate_macd(&closes, 12, 26, 9);
        assert!(*m.line.last().unwrap() > 0.0);
    }

    #[test]
    fn macd_flat_is_zero() {
        let m = calculate_macd(&[50.0; 40], 12, 26, 9);
        assert!(m.line.iter().all(|v| v.abs() < 1e-12));
        assert!(m.histogram.iter().all(|v| v.abs() < 1e-12));
    }

    #[test]
    fn macd_zero_period_empty() {
        assert!(calculate_macd(&[1.0, 2.0], 0, 26, 9).line.is_empty());
    }
}
