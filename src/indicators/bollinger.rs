// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Bollinger Bands consist of a middle band (SMA), an upper band (SMA + k*σ),
// and a lower band (SMA - k*σ), where σ is the population standard
// deviation of the same rolling window.

/// One Bollinger observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerBand {
    pub lower: f64,
    pub middle: f64,
    pub upper: f64,
}

/// Calculate Bollinger Bands for every index of `closes`.
///
/// Entries before index `period - 1` are `None`, as are windows whose
/// statistics are non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Vec<Option<BollingerBand>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    let n = period as f64;
    for end in period..=closes.len() {
        let window = &closes[end - period..end];
        let middle = window.iter().sum::<f64>() / n;
        let variance = window.iter().map(|x| (x - middle).powi(2)).sum::<f64>() / n;
        let band = num_std * variance.sqrt();

        if middle.is_finite() && band.is_finite() {
            out[end - 1] = Some(BollingerBand {
                lower: middle - band,
                middle,
                upper: middle + band,
            });
        }
    }
    out
}
