// =============================================================================
// Relative Strength Index (RSI) — Wilder's Smoothing
// =============================================================================
//
// Step 1 — Price changes from consecutive closes.
// Step 2 — Split into gain = max(delta, 0) and loss = max(-delta, 0).
// Step 3 — Wilder smoothing, i.e. an EMA with alpha = 1 / period seeded by
//          the first delta:
//            avg_t = avg_{t-1} + (x_t - avg_{t-1}) / period
// Step 4 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Edge cases, in this order:
//   avg_loss == 0  => 100
//   avg_gain == 0  => 0
// =============================================================================

use super::ema::ewma;

/// Compute the RSI series aligned with `closes`.
///
/// Index 0 has no price change and is always `None`.  `period == 0` yields
/// all `None`.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < 2 {
        return out;
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let gains: Vec<f64> = deltas.iter().map(|d| d.max(0.0)).collect();
    let losses: Vec<f64> = deltas.iter().map(|d| (-d).max(0.0)).collect();

    let alpha = 1.0 / period as f64;
    let avg_gain = ewma(&gains, alpha);
    let avg_loss = ewma(&losses, alpha);

    for (i, (&g, &l)) in avg_gain.iter().zip(avg_loss.iter()).enumerate() {
        out[i + 1] = rsi_from_averages(g, l);
    }
    out
}

/// Convert average gain / average loss into an RSI value in [0, 100].
///
/// Returns `None` only when the result is non-finite (NaN input).
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_empty_input() {
        assert!(calculate_rsi(&[], 14).is_empty());
    }

    #[test]
    fn rsi_first_index_undefined() {
        let out = calculate_rsi(&[1.0, 2.0, 1.5], 14);
        assert_eq!(out.len(), 3);
        assert!(out[0].is_none());
        assert!(out[1].is_some());
    }

    #[test]
    fn rsi_all_gains() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in calculate_rsi(&closes, 14).into_iter().flatten() {
            assert!((v - 100.0).abs() < 1e-10, "expected 100.0, got {v}");
        }
    }

    #[test]
    fn rsi_all_losses() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in calculate_rsi(&closes, 14).into_iter().flatten() {
            assert!(v.abs() < 1e-10, "expected 0.0, got {v}");
        }
    }

    #[test]
    fn rsi_flat_market_hits_loss_check_first() {
        // avg_loss == 0 is evaluated before avg_gain == 0.
        let closes = vec![100.0; 30];
        for v in calculate_rsi(&closes, 14).into_iter().flatten() {
            assert_eq!(v, 100.0);
        }
    }

    #[test]
    fn rsi_range_check() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in calculate_rsi(&closes, 14).into_iter().flatten() {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn rsi_trends() {
        // Noisy uptrend: mostly up with periodic pullbacks.
        let up: Vec<f64> = (0..200)
            .map(|i| 100.0 + i as f64 + if i % 5 == 0 { -1.5 } else { 0.0 })
            .collect();
        let last = calculate_rsi(&up, 14).last().copied().flatten().unwrap();
        assert!((0.0..=100.0).contains(&last));
        assert!(last > 60.0, "uptrend RSI {last}");

        let down: Vec<f64> = up.iter().rev().copied().collect();
        let last = calculate_rsi(&down, 14).last().copied().flatten().unwrap();
        assert!((0.0..=100.0).contains(&last));
        assert!(last < 40.0, "downtrend RSI {last}");
    }

    #[test]
    fn rsi_wilder_recurrence() {
        let closes = [10.0, 11.0, 10.5, 11.5];
        let out = calculate_rsi(&closes, 2);
        // deltas 1.0, -0.5, 1.0; alpha = 0.5
        // gain avg: 1.0, 0.5, 0.75 ; loss avg: 0.0, 0.25, 0.125
        assert_eq!(out[1], Some(100.0));
        let rs = 0.5 / 0.25;
        assert!((out[2].unwrap() - (100.0 - 100.0 / (1.0 + rs))).abs() < 1e-10);
        let rs = 0.75 / 0.125;
        assert!((out[3].unwrap() - (100.0 - 100.0 / (1.0 + rs))).abs() < 1e-10);
    }
}
