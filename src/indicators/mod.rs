// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free implementations of the indicators derived from the
// sealed candle history.  Series functions return vectors aligned with their
// input; undefined points are `None` rather than a NaN sentinel.
//
// `IndicatorEngine` evaluates every indicator over the recent window of
// closes and keeps only the last point as an `IndicatorSnapshot`.

pub mod bollinger;
pub mod ema;
pub mod macd;
pub mod rsi;
pub mod sma;

use crate::types::IndicatorSnapshot;

pub use bollinger::calculate_bollinger;
pub use ema::calculate_ema;
pub use macd::calculate_macd;
pub use rsi::calculate_rsi;
pub use sma::calculate_sma;

/// Look-back parameters for every indicator in the snapshot.
#[derive(Debug, Clone, Copy)]
pub struct IndicatorParams {
    pub sma_period: usize,
    pub ema_period: usize,
    pub rsi_period: usize,
    pub macd_fast: usize,
    pub macd_slow: usize,
    pub macd_signal: usize,
    pub bb_period: usize,
    pub bb_num_std: f64,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            sma_period: 20,
            ema_period: 20,
            rsi_period: 14,
            macd_fast: 12,
            macd_slow: 26,
            macd_signal: 9,
            bb_period: 20,
            bb_num_std: 2.0,
        }
    }
}

/// Stateless snapshot calculator over a bounded window of closes.
#[derive(Debug, Clone)]
pub struct IndicatorEngine {
    params: IndicatorParams,
    window: usize,
    min_history: usize,
}

impl IndicatorEngine {
    pub fn new(params: IndicatorParams, window: usize, min_history: usize) -> Self {
        Self {
            params,
            window,
            min_history,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Compute the snapshot for the last point of `closes` (ascending by
    /// time).  Only the trailing `window` closes are used.
    ///
    /// Returns `None` when fewer than `min_history` closes are available.
    pub fn snapshot(&self, symbol: &str, t_start_ms: i64, closes: &[f64]) -> Option<IndicatorSnapshot> {
        let closes = &closes[closes.len().saturating_sub(self.window)..];
        if closes.len() < self.min_history {
            return None;
        }

        let p = &self.params;
        let last = closes.len() - 1;

        let sma = calculate_sma(closes, p.sma_period);
        let ema = calculate_ema(closes, p.ema_period);
        let rsi = calculate_rsi(closes, p.rsi_period);
        let macd = calculate_macd(closes, p.macd_fast, p.macd_slow, p.macd_signal);
        let bands = calculate_bollinger(closes, p.bb_period, p.bb_num_std);
        let band = bands[last];

        Some(IndicatorSnapshot {
            symbol: symbol.to_string(),
            t_start_ms: Some(t_start_ms),
            close: Some(closes[last]),
            sma: sma[last],
            ema: ema.get(last).copied(),
            rsi: rsi[last],
            macd: macd.line.get(last).copied(),
            macd_signal: macd.signal.get(last).copied(),
            macd_hist: macd.histogram.get(last).copied(),
            bb_lower: band.map(|b| b.lower),
            bb_mid: band.map(|b| b.middle),
            bb_upper: band.map(|b| b.upper),
        })
    }
}

impl Default for IndicatorEngine {
    fn default() -> Self {
        Self::new(IndicatorParams::default(), 300, 30)
    }
}
