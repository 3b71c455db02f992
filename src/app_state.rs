// =============================================================================
// Central Application State — candlestream
// =============================================================================
//
// Ties the long-lived services together for the read-only API and carries
// the pipeline's operational counters.
//
// Thread safety:
//   - Atomic counters for lock-free stats updates from the hot loops.
//   - parking_lot::RwLock for the recent-error ring.
//   - Arc wrappers for services that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::AppConfig;
use crate::storage::{CandleStore, LatestCache};

// =============================================================================
// Pipeline counters
// =============================================================================

/// Monotonic counters and recent loop errors, updated by the ingestors and
/// the aggregator.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub trades_published: AtomicU64,
    pub frames_skipped: AtomicU64,
    pub feed_reconnects: AtomicU64,
    pub trades_applied: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub candles_sealed: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub seal_failures: AtomicU64,
    pub loop_errors: AtomicU64,
    recent_errors: RwLock<Vec<ErrorRecord>>,
}

impl PipelineStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            trades_published: get(&self.trades_published),
            frames_skipped: get(&self.frames_skipped),
            feed_reconnects: get(&self.feed_reconnects),
            trades_applied: get(&self.trades_applied),
            duplicates_skipped: get(&self.duplicates_skipped),
            candles_sealed: get(&self.candles_sealed),
            dead_lettered: get(&self.dead_lettered),
            seal_failures: get(&self.seal_failures),
            loop_errors: get(&self.loop_errors),
        }
    }

    /// Count a loop-level error and keep it in the recent-error ring, which is
    /// capped at [`MAX_RECENT_ERRORS`] with oldest entries evicted first.
    pub fn record_error(&self, component: &str, message: String) {
        Self::bump(&self.loop_errors);
        let record = ErrorRecord {
            component: component.to_string(),
            message,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
    }

    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub trades_published: u64,
    pub frames_skipped: u64,
    pub feed_reconnects: u64,
    pub trades_applied: u64,
    pub duplicates_skipped: u64,
    pub candles_sealed: u64,
    pub dead_lettered: u64,
    pub seal_failures: u64,
    pub loop_errors: u64,
}

// =============================================================================
// Error Record
// =============================================================================

/// A recorded loop-level error for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Component that raised it, e.g. `ingest:btcusdt` or `aggregator`.
    pub component: String,
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

// =============================================================================
// AppState
// =============================================================================

/// State shared by the API handlers via `Arc<AppState>`.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn CandleStore>,
    pub cache: Arc<dyn LatestCache>,
    pub stats: Arc<PipelineStats>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        config: Arc<AppConfig>,
        store: Arc<dyn CandleStore>,
        cache: Arc<dyn LatestCache>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            config,
            store,
            cache,
            stats,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn build_health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            role: self.config.role.to_string(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            symbols: self.config.symbols.clone(),
            candle_sec: self.config.candle_sec,
            stats: self.stats.snapshot(),
            recent_errors: self.stats.recent_errors(),
        }
    }
}

/// Payload of `GET /api/v1/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub role: String,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub symbols: Vec<String>,
    pub candle_sec: u64,
    pub stats: StatsSnapshot,
    pub recent_errors: Vec<ErrorRecord>,
}
