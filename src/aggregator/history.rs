use std::collections::{HashMap, VecDeque};

use crate::types::Candle;

/// Per-symbol ring of recent sealed closes, oldest first.
///
/// Each ring keeps at most `window` closes.  A symbol's ring starts unprimed
/// and is seeded from the candle store the first time one of its candles
/// seals, so restarts keep the indicator window continuous.
#[derive(Debug)]
pub struct CloseHistory {
    window: usize,
    rings: HashMap<String, VecDeque<(i64, f64)>>,
}

impl CloseHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            rings: HashMap::new(),
        }
    }

    pub fn is_primed(&self, symbol: &str) -> bool {
        self.rings.contains_key(symbol)
    }

    /// Seed `symbol` from stored candles (ascending by start).
    pub fn prime(&mut self, symbol: &str, candles: &[Candle]) {
        let ring = self
            .rings
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.window + 1));
        for c in candles {
            Self::insert(ring, c.t_start_ms, c.close);
        }
        while ring.len() > self.window {
            ring.pop_front();
        }
    }

    /// Record a sealed close.  A close for a start already held replaces it.
    pub fn push(&mut self, symbol: &str, t_start_ms: i64, close: f64) {
        let ring = self
            .rings
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.window + 1));
        Self::insert(ring, t_start_ms, close);
        while ring.len() > self.window {
            ring.pop_front();
        }
    }

    fn insert(ring: &mut VecDeque<(i64, f64)>, t_start_ms: i64, close: f64) {
        match ring.binary_search_by(|(t, _)| t.cmp(&t_start_ms)) {
            Ok(i) => ring[i].1 = close,
            Err(i) => ring.insert(i, (t_start_ms, close)),
        }
    }

    /// Closes for `symbol`, oldest first.
    pub fn closes(&self, symbol: &str) -> Vec<f64> {
        self.rings
            .get(symbol)
            .map(|ring| ring.iter().map(|(_, c)| *c).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(t: i64, close: f64) -> Candle {
        Candle::open_at("btcusdt", t, 5000, close, 1.0)
    }

    #[test]
    fn push_is_bounded_and_ordered() {
        let mut h = CloseHistory::new(3);
        assert!(!h.is_primed("btcusdt"));
        for i in 0..5 {
            h.push("btcusdt", i * 5000, i as f64);
        }
        assert!(h.is_primed("btcusdt"));
        assert_eq!(h.closes("btcusdt"), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn prime_then_push_same_start_replaces() {
        let mut h = CloseHistory::new(10);
        h.prime("btcusdt", &[candle(0, 1.0), candle(5000, 2.0)]);
        h.push("btcusdt", 5000, 2.5);
        h.push("btcusdt", 10_000, 3.0);
        assert_eq!(h.closes("btcusdt"), vec![1.0, 2.5, 3.0]);
    }

    #[test]
    fn prime_with_nothing_marks_symbol_seen() {
        let mut h = CloseHistory::new(10);
        h.prime("ethusdt", &[]);
        assert!(h.is_primed("ethusdt"));
        assert!(h.closes("ethusdt").is_empty());
        assert!(h.closes("solusdt").is_empty());
    }
}
