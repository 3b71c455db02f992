// =============================================================================
// Reconnect backoff — capped exponential with random extension
// =============================================================================

use std::time::Duration;

use rand::Rng;

use crate::config::AppConfig;

/// Reconnect delay state for one feed task.
///
/// Each call to [`next_delay`](Backoff::next_delay) returns the current delay
/// extended by up to `jitter` of itself, then doubles the current delay up to
/// `cap`.  A successful connect calls [`reset`](Backoff::reset).
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
            current: base,
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            Duration::from_millis(cfg.backoff_base_ms),
            Duration::from_millis(cfg.backoff_cap_ms),
            cfg.backoff_jitter,
        )
    }

    /// Delay before the next attempt, without jitter.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);

        if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            delay + delay.mul_f64(extra)
        } else {
            delay
        }
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_up_to_cap_without_jitter() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        let delays: Vec<u64> = (0..7).map(|_| b.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn reset_returns_to_base() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0);
        b.next_delay();
        b.next_delay();
        assert_eq!(b.current(), Duration::from_secs(4));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_ratio() {
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(10), 0.2);
        for _ in 0..100 {
            let d = b.next_delay();
            assert!(d >= Duration::from_secs(10));
            assert!(d <= Duration::from_secs(12));
        }
    }
}
