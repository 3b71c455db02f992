// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// SMA_t = (x_{t-n+1} + ... + x_t) / n
//
// The first `n - 1` points of any series have no full window and are
// undefined (`None`).
// =============================================================================

/// Compute the SMA series aligned with `values`.
///
/// The output has the same length as the input; entries before index
/// `period - 1` are `None`.  `period == 0` yields all `None`.
pub fn calculate_sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let n = period as f64;
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / n);

    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / n);
    }
    out
}
