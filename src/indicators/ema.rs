// =============================================================================
// Exponential Moving Average (EMA)
// =============================================================================
//
// EMA gives more weight to recent prices, making it more responsive to new
// information than the Simple Moving Average (SMA).
//
// Formula:
//   alpha  = 2 / (period + 1)
//   EMA_0  = x_0
//   EMA_t  = alpha * x_t + (1 - alpha) * EMA_{t-1}
//
// The series is seeded by the first observed value, so every index is
// defined.
// =============================================================================

/// Compute the EMA series for `values` with span `period`.
///
/// Returns a vector aligned with the input.  Returns an empty `Vec` when
/// the input is empty or the period is zero.
pub fn calculate_ema(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 {
        return Vec::new();
    }
    ewma(values, 2.0 / (period as f64 + 1.0))
}

/// Exponentially weighted moving average with an explicit smoothing factor,
/// seeded by the first value.  Shared with Wilder smoothing in RSI.
pub(crate) fn ewma(values: &[f64], alpha: f64) -> Vec<f64> {
    let mut out = Vec::with_capacity(values.len());
    let mut iter = values.iter();
    let Some(&first) = iter.next() else {
        return out;
    };

    let mut prev = first;
    out.push(prev);
    for &x in iter {
        prev = alpha * x + (1.0 - alpha) * prev;
        out.push(prev);
    }
    out
}
