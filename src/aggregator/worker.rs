// =============================================================================
// Aggregator Worker — consumer-group loop over the trade streams
// =============================================================================
//
// Single sequential loop, sole owner of the open candles:
//
//   1. Ensure the consumer group exists on every trade stream.
//   2. Drain this consumer's pending entries (startup, and after any
//      loop-level error).
//   3. Block-read new entries; apply each one, sealing candles on rollover,
//      then acknowledge it.
//
// Per-entry failures are dead-lettered and acknowledged.  A failure to write
// the dead letter or the ack is a loop-level error: the loop pauses, then
// re-drains pending entries before reading new ones.
//
// A sealed candle stays queued until it is either stored or dead-lettered.
// The queue is drained before any entry is acknowledged, so a redelivered
// entry cannot be acked past a candle that was lost.
// =============================================================================

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};

use super::candle_state::{Applied, CandleAggregator};
use super::history::CloseHistory;
use super::message::parse_logged_trade;
use crate::app_state::PipelineStats;
use crate::config::AppConfig;
use crate::indicators::{IndicatorEngine, IndicatorParams};
use crate::storage::latest_cache::latest_key;
use crate::storage::{CandleStore, LatestCache};
use crate::stream::{ensure_group, LogEntry, ReadCursor, StreamLog};
use crate::types::{Candle, DeadLetterRecord};

/// Run `op` up to `attempts` times, doubling `delay` between tries.
async fn with_retries<T, E, F, Fut>(attempts: u32, delay: Duration, what: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    let mut pause = delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts => {
                warn!(what = %what, attempt = attempt, error = %e, "storage write failed; retrying");
                tokio::time::sleep(pause).await;
                pause *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub struct AggregatorWorker {
    cfg: Arc<AppConfig>,
    log: Arc<dyn StreamLog>,
    store: Arc<dyn CandleStore>,
    cache: Arc<dyn LatestCache>,
    stats: Arc<PipelineStats>,
    engine: IndicatorEngine,
    candles: CandleAggregator,
    history: CloseHistory,
    /// Sealed candles not yet stored or dead-lettered, oldest first.
    unsealed: VecDeque<Candle>,
    streams: Vec<String>,
    needs_recovery: bool,
}

impl AggregatorWorker {
    pub fn new(
        cfg: Arc<AppConfig>,
        log: Arc<dyn StreamLog>,
        store: Arc<dyn CandleStore>,
        cache: Arc<dyn LatestCache>,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            engine: IndicatorEngine::new(IndicatorParams::default(), cfg.history_window, cfg.min_history),
            candles: CandleAggregator::new(cfg.bucket_ms()),
            history: CloseHistory::new(cfg.history_window),
            unsealed: VecDeque::new(),
            streams: cfg.stream_keys(),
            needs_recovery: true,
            cfg,
            log,
            store,
            cache,
            stats,
        }
    }

    /// Create the consumer group on every trade stream.  Existing groups are
    /// left untouched.
    pub async fn init(&self) -> Result<()> {
        for stream in &self.streams {
            ensure_group(self.log.as_ref(), stream, &self.cfg.consumer_group)
                .await
                .with_context(|| format!("failed to create consumer group on {stream}"))?;
        }
        info!(
            group = %self.cfg.consumer_group,
            consumer = %self.cfg.consumer_name,
            streams = ?self.streams,
            "aggregator consumer group ready"
        );
        Ok(())
    }

    /// Process entries delivered to this consumer but never acknowledged.
    pub async fn recover_pending(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.poll_once(ReadCursor::Pending).await?;
            if n == 0 {
                break;
            }
            total += n;
        }
        if total > 0 {
            info!(entries = total, "recovered pending trade entries");
        }
        Ok(total)
    }

    /// One group read followed by processing of every returned entry.
    /// Returns the number of entries handled.
    pub async fn poll_once(&mut self, cursor: ReadCursor) -> Result<usize> {
        let batches = self
            .log
            .read_group(
                &self.cfg.consumer_group,
                &self.cfg.consumer_name,
                &self.streams,
                cursor,
                self.cfg.read_count,
                self.cfg.read_block(),
            )
            .await
            .context("failed to read from trade log")?;

        let mut handled = 0;
        for batch in &batches {
            for entry in &batch.entries {
                self.handle_entry(&batch.stream, entry).await?;
                handled += 1;
            }
        }
        Ok(handled)
    }

    async fn handle_entry(&mut self, stream: &str, entry: &LogEntry) -> Result<()> {
        self.flush_seals().await?;

        let symbol = self.cfg.symbol_for_stream(stream);
        let outcome = parse_logged_trade(&entry.fields, symbol).and_then(|trade| self.candles.apply(entry.id, &trade));

        match outcome {
            Ok(Applied::Duplicate) => {
                PipelineStats::bump(&self.stats.duplicates_skipped);
                debug!(stream = %stream, id = %entry.id, "skipping redelivered entry");
            }
            Ok(Applied::Rolled(sealed)) => {
                PipelineStats::bump(&self.stats.trades_applied);
                self.unsealed.push_back(sealed);
                self.flush_seals().await?;
            }
            Ok(Applied::Started | Applied::Updated) => {
                PipelineStats::bump(&self.stats.trades_applied);
            }
            Err(e) => {
                warn!(stream = %stream, id = %entry.id, error = %e, "dead-lettering trade entry");
                self.dead_letter(DeadLetterRecord::new(stream, entry.id, &e, &entry.fields))
                    .await?;
            }
        }

        self.log
            .ack(stream, &self.cfg.consumer_group, entry.id)
            .await
            .with_context(|| format!("failed to ack {stream} {}", entry.id))?;
        Ok(())
    }

    async fn dead_letter(&self, record: DeadLetterRecord) -> Result<()> {
        self.log
            .append(&self.cfg.dlq_stream, &record.to_fields(), None)
            .await
            .with_context(|| format!("failed to dead-letter {} {}", record.stream, record.id))?;
        PipelineStats::bump(&self.stats.dead_lettered);
        Ok(())
    }

    /// Seal every queued candle.  A candle leaves the queue only once it has
    /// been stored or dead-lettered.
    async fn flush_seals(&mut self) -> Result<()> {
        while let Some(candle) = self.unsealed.front().cloned() {
            self.seal(&candle).await?;
            self.unsealed.pop_front();
        }
        Ok(())
    }

    /// Persist a sealed candle, then refresh the symbol's indicator snapshot.
    /// Safe to repeat for the same candle.
    async fn seal(&mut self, candle: &Candle) -> Result<()> {
        let attempts = self.cfg.storage_retry_attempts;
        let delay = self.cfg.storage_retry_delay();
        let symbol = candle.symbol.clone();

        let store = self.store.as_ref();
        let written = with_retries(attempts, delay, "candle upsert", || store.upsert(candle)).await;
        if let Err(e) = written {
            PipelineStats::bump(&self.stats.seal_failures);
            error!(symbol = %symbol, t_start_ms = candle.t_start_ms, error = %e, "candle upsert failed; dead-lettering seal");
            let record = DeadLetterRecord {
                stream: format!("candles:{symbol}"),
                id: candle.t_start_ms.to_string(),
                err: format!("candle upsert failed: {e}"),
                fields: serde_json::to_string(candle).context("failed to encode candle")?,
            };
            return self.dead_letter(record).await;
        }
        PipelineStats::bump(&self.stats.candles_sealed);
        info!(
            symbol = %symbol,
            t_start_ms = candle.t_start_ms,
            open = candle.open,
            high = candle.high,
            low = candle.low,
            close = candle.close,
            volume = candle.volume,
            "candle sealed"
        );

        if !self.history.is_primed(&symbol) {
            match self.store.read_recent(&symbol, self.engine.window()).await {
                Ok(recent) => self.history.prime(&symbol, &recent),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "could not load candle history; snapshot skipped");
                    return Ok(());
                }
            }
        }
        self.history.push(&symbol, candle.t_start_ms, candle.close);

        let closes = self.history.closes(&symbol);
        let Some(snapshot) = self.engine.snapshot(&symbol, candle.t_start_ms, &closes) else {
            debug!(symbol = %symbol, candles = closes.len(), "not enough history for indicators");
            return Ok(());
        };

        let cache = self.cache.as_ref();
        if let Err(e) = with_retries(attempts, delay, "latest cache write", || cache.set(&symbol, &snapshot)).await {
            PipelineStats::bump(&self.stats.seal_failures);
            error!(symbol = %symbol, error = %format!("{e:#}"), "latest snapshot write failed; dead-lettering seal");
            let record = DeadLetterRecord {
                stream: latest_key(&symbol),
                id: candle.t_start_ms.to_string(),
                err: format!("latest cache write failed: {e:#}"),
                fields: serde_json::to_string(&snapshot).context("failed to encode snapshot")?,
            };
            return self.dead_letter(record).await;
        }
        Ok(())
    }

    /// Run forever.  Loop-level errors are logged and the loop resumes after
    /// a pause.
    pub async fn run(mut self) {
        let pause = self.cfg.loop_error_pause();

        while let Err(e) = self.init().await {
            self.stats.record_error("aggregator", format!("{e:#}"));
            error!(error = %format!("{e:#}"), "aggregator init failed");
            tokio::time::sleep(pause).await;
        }

        loop {
            let step = if self.needs_recovery {
                self.recover_pending().await.map(|_| self.needs_recovery = false)
            } else {
                self.poll_once(ReadCursor::New).await.map(|_| ())
            };

            if let Err(e) = step {
                self.stats.record_error("aggregator", format!("{e:#}"));
                error!(error = %format!("{e:#}"), "aggregator loop error");
                self.needs_recovery = true;
                tokio::time::sleep(pause).await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::storage::candle_store::StoreError;
    use crate::stream::{EntryId, LogError, StreamBatch};
    use crate::types::IndicatorSnapshot;
    use crate::storage::{MemoryLatestCache, SqliteCandleStore};
    use crate::stream::MemoryLog;
    use crate::types::Fields;

    struct Harness {
        _dir: tempfile::TempDir,
        cfg: Arc<AppConfig>,
        log: Arc<MemoryLog>,
        store: Arc<SqliteCandleStore>,
        cache: Arc<MemoryLatestCache>,
        stats: Arc<PipelineStats>,
    }

    fn test_config() -> AppConfig {
        AppConfig {
            read_block_ms: 0,
            min_history: 1,
            storage_retry_delay_ms: 1,
            ..AppConfig::default()
        }
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteCandleStore::open(&dir.path().join("crypto.db"), 2).unwrap();
        Harness {
            _dir: dir,
            cfg: Arc::new(test_config()),
            log: Arc::new(MemoryLog::new()),
            store: Arc::new(store),
            cache: Arc::new(MemoryLatestCache::new()),
            stats: Arc::new(PipelineStats::default()),
        }
    }

    impl Harness {
        fn worker(&self) -> AggregatorWorker {
            AggregatorWorker::new(
                self.cfg.clone(),
                self.log.clone(),
                self.store.clone(),
                self.cache.clone(),
                self.stats.clone(),
            )
        }

        async fn publish(&self, ts_ms: i64, price: &str, qty: &str) {
            publish_to(&*self.log, "trades:btcusdt", "btcusdt", ts_ms, price, qty).await;
        }
    }

    async fn publish_to(log: &dyn StreamLog, stream: &str, symbol: &str, ts_ms: i64, price: &str, qty: &str) {
        let mut f = Fields::new();
        f.insert("ts_ms".into(), ts_ms.to_string());
        f.insert("symbol".into(), symbol.into());
        f.insert("price".into(), price.into());
        f.insert("qty".into(), qty.into());
        f.insert("side".into(), "buy".into());
        f.insert("src".into(), "binance".into());
        log.append(stream, &f, Some(1000)).await.unwrap();
    }

    #[tokio::test]
    async fn rollover_seals_and_publishes_snapshot() {
        let h = harness();
        let mut worker = h.worker();
        worker.init().await.unwrap();

        h.publish(0, "100.0000000000", "1.0000000000").await;
        h.publish(2000, "101.0000000000", "2.0000000000").await;
        h.publish(6000, "102.0000000000", "1.0000000000").await;

        assert_eq!(worker.poll_once(ReadCursor::New).await.unwrap(), 3);

        let sealed = h.store.read_recent("btcusdt", 10).await.unwrap();
        assert_eq!(sealed.len(), 1);
        let c = &sealed[0];
        assert_eq!((c.t_start_ms, c.t_end_ms), (0, 5000));
        assert_eq!((c.open, c.high, c.low, c.close, c.volume), (100.0, 101.0, 100.0, 101.0, 3.0));

        let snap = h.cache.get("btcusdt").await.unwrap().unwrap();
        assert_eq!(snap.close, Some(101.0));
        assert_eq!(snap.t_start_ms, Some(0));
        assert_eq!(snap.ema, Some(101.0));
        assert_eq!(snap.sma, None);

        assert_eq!(h.log.pending_count("trades:btcusdt", "cg_analytics").await.unwrap(), 0);
        let stats = h.stats.snapshot();
        assert_eq!(stats.trades_applied, 3);
        assert_eq!(stats.candles_sealed, 1);
    }

    #[tokio::test]
    async fn malformed_entry_is_dead_lettered_once_and_acked() {
        let h = harness();
        let mut worker = h.worker();
        worker.init().await.unwrap();

        h.publish(0, "abc", "1").await;
        h.publish(1000, "100", "1").await;
        worker.poll_once(ReadCursor::New).await.unwrap();

        let dlq = h.log.range("trades:DLQ").await.unwrap();
        assert_eq!(dlq.len(), 1);
        let rec = &dlq[0].fields;
        assert_eq!(rec["stream"], "trades:btcusdt");
        assert!(rec["err"].contains("price"), "{}", rec["err"]);
        let payload: Fields = serde_json::from_str(&rec["fields"]).unwrap();
        assert_eq!(payload["price"], "abc");

        assert_eq!(h.log.pending_count("trades:btcusdt", "cg_analytics").await.unwrap(), 0);
        assert_eq!(h.stats.snapshot().dead_lettered, 1);
        // The good trade still opened a candle.
        assert_eq!(worker.candles.open_candle("btcusdt").unwrap().volume, 1.0);
    }

    #[tokio::test]
    async fn late_trade_is_dead_lettered() {
        let h = harness();
        let mut worker = h.worker();
        worker.init().await.unwrap();

        h.publish(12_000, "100", "1").await;
        h.publish(1_000, "90", "1").await;
        worker.poll_once(ReadCursor::New).await.unwrap();

        let dlq = h.log.range("trades:DLQ").await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert!(dlq[0].fields["err"].starts_with("late trade"));
        assert_eq!(worker.candles.open_candle("btcusdt").unwrap().low, 100.0);
    }

    #[tokio::test]
    async fn redelivered_entry_is_skipped() {
        let h = harness();
        let mut worker = h.worker();
        worker.init().await.unwrap();
        h.publish(0, "100", "1").await;

        let entry = h.log.range("trades:btcusdt").await.unwrap().remove(0);
        worker.handle_entry("trades:btcusdt", &entry).await.unwrap();
        worker.handle_entry("trades:btcusdt", &entry).await.unwrap();

        assert_eq!(worker.candles.open_candle("btcusdt").unwrap().volume, 1.0);
        let stats = h.stats.snapshot();
        assert_eq!(stats.trades_applied, 1);
        assert_eq!(stats.duplicates_skipped, 1);
    }

    #[tokio::test]
    async fn pending_entries_are_recovered() {
        let h = harness();
        let mut worker = h.worker();
        worker.init().await.unwrap();
        h.publish(0, "100", "1").await;
        h.publish(1000, "101", "1").await;

        // Delivered to this consumer by a previous run that never acked.
        h.log
            .read_group(
                "cg_analytics",
                "worker-1",
                &["trades:btcusdt".to_string()],
                ReadCursor::New,
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(h.log.pending_count("trades:btcusdt", "cg_analytics").await.unwrap(), 2);

        assert_eq!(worker.recover_pending().await.unwrap(), 2);
        assert_eq!(h.log.pending_count("trades:btcusdt", "cg_analytics").await.unwrap(), 0);
        assert_eq!(worker.candles.open_candle("btcusdt").unwrap().close, 101.0);
    }

    #[tokio::test]
    async fn history_is_primed_from_store() {
        let h = harness();
        for i in 0..5 {
            let c = Candle::open_at("btcusdt", -(i + 1) * 5000, 5000, 50.0, 1.0);
            h.store.upsert(&c).await.unwrap();
        }
        let mut worker = h.worker();
        worker.init().await.unwrap();
        h.publish(0, "100", "1").await;
        h.publish(5000, "100", "1").await;
        worker.poll_once(ReadCursor::New).await.unwrap();

        assert_eq!(worker.history.closes("btcusdt"), vec![50.0, 50.0, 50.0, 50.0, 50.0, 100.0]);
    }

    struct FailingStore;

    #[async_trait]
    impl CandleStore for FailingStore {
        async fn upsert(&self, _candle: &Candle) -> Result<(), StoreError> {
            Err(StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk gone")))
        }

        async fn read_recent(&self, _symbol: &str, _limit: usize) -> Result<Vec<Candle>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn exhausted_upsert_dead_letters_the_seal() {
        let h = harness();
        let mut worker = AggregatorWorker::new(
            h.cfg.clone(),
            h.log.clone(),
            Arc::new(FailingStore),
            h.cache.clone(),
            h.stats.clone(),
        );
        worker.init().await.unwrap();
        h.publish(0, "100", "1").await;
        h.publish(5000, "101", "1").await;
        worker.poll_once(ReadCursor::New).await.unwrap();

        let dlq = h.log.range("trades:DLQ").await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].fields["stream"], "candles:btcusdt");
        assert_eq!(dlq[0].fields["id"], "0");
        let candle: Candle = serde_json::from_str(&dlq[0].fields["fields"]).unwrap();
        assert_eq!(candle.close, 100.0);

        assert!(h.cache.get("btcusdt").await.unwrap().is_none());
        assert_eq!(h.log.pending_count("trades:btcusdt", "cg_analytics").await.unwrap(), 0);
        assert_eq!(h.stats.snapshot().seal_failures, 1);
    }

    #[tokio::test]
    async fn entry_symbol_is_taken_from_its_stream() {
        let h = harness();
        let cfg = Arc::new(AppConfig {
            symbols: vec!["btcusdt".into(), "ethusdt".into()],
            ..test_config()
        });
        let mut worker = AggregatorWorker::new(cfg, h.log.clone(), h.store.clone(), h.cache.clone(), h.stats.clone());
        worker.init().await.unwrap();

        publish_to(&*h.log, "trades:ethusdt", "ethusdt", 0, "2000", "1").await;
        // Mislabelled entry with a higher id on another stream.
        publish_to(&*h.log, "trades:btcusdt", "ethusdt", 0, "100", "1").await;
        worker.poll_once(ReadCursor::New).await.unwrap();

        let eth = worker.candles.open_candle("ethusdt").unwrap();
        assert_eq!((eth.open, eth.close, eth.volume), (2000.0, 2000.0, 1.0));
        assert!(worker.candles.open_candle("btcusdt").is_none());

        let dlq = h.log.range("trades:DLQ").await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].fields["stream"], "trades:btcusdt");
        assert!(dlq[0].fields["err"].contains("does not match"), "{}", dlq[0].fields["err"]);

        let stats = h.stats.snapshot();
        assert_eq!(stats.trades_applied, 1);
        assert_eq!(stats.duplicates_skipped, 0);
        for stream in ["trades:btcusdt", "trades:ethusdt"] {
            assert_eq!(h.log.pending_count(stream, "cg_analytics").await.unwrap(), 0);
        }
    }

    /// Log whose next dead-letter append fails once.
    struct FlakyDlqLog {
        inner: MemoryLog,
        fail_next_dlq: AtomicBool,
    }

    #[async_trait]
    impl StreamLog for FlakyDlqLog {
        async fn append(&self, stream: &str, fields: &Fields, maxlen: Option<usize>) -> Result<EntryId, LogError> {
            if stream == "trades:DLQ" && self.fail_next_dlq.swap(false, Ordering::SeqCst) {
                return Err(LogError::Storage("dead-letter stream unavailable".into()));
            }
            self.inner.append(stream, fields, maxlen).await
        }

        async fn create_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
            self.inner.create_group(stream, group).await
        }

        async fn read_group(
            &self,
            group: &str,
            consumer: &str,
            streams: &[String],
            cursor: ReadCursor,
            count: usize,
            block: Duration,
        ) -> Result<Vec<StreamBatch>, LogError> {
            self.inner.read_group(group, consumer, streams, cursor, count, block).await
        }

        async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, LogError> {
            self.inner.ack(stream, group, id).await
        }

        async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, LogError> {
            self.inner.pending_count(stream, group).await
        }

        async fn len(&self, stream: &str) -> Result<usize, LogError> {
            self.inner.len(stream).await
        }

        async fn range(&self, stream: &str) -> Result<Vec<LogEntry>, LogError> {
            self.inner.range(stream).await
        }
    }

    #[tokio::test]
    async fn failed_seal_is_retried_before_redelivered_entry_is_acked() {
        let h = harness();
        let log = Arc::new(FlakyDlqLog {
            inner: MemoryLog::new(),
            fail_next_dlq: AtomicBool::new(true),
        });
        let mut worker = AggregatorWorker::new(
            h.cfg.clone(),
            log.clone(),
            Arc::new(FailingStore),
            h.cache.clone(),
            h.stats.clone(),
        );
        worker.init().await.unwrap();
        publish_to(&*log, "trades:btcusdt", "btcusdt", 0, "100", "1").await;
        publish_to(&*log, "trades:btcusdt", "btcusdt", 5000, "101", "1").await;

        // Neither stored nor dead-lettered: the rolling entry stays pending.
        assert!(worker.poll_once(ReadCursor::New).await.is_err());
        assert_eq!(log.pending_count("trades:btcusdt", "cg_analytics").await.unwrap(), 1);
        assert!(log.range("trades:DLQ").await.unwrap().is_empty());

        assert_eq!(worker.recover_pending().await.unwrap(), 1);

        let dlq = log.range("trades:DLQ").await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].fields["stream"], "candles:btcusdt");
        assert_eq!(dlq[0].fields["id"], "0");
        assert_eq!(log.pending_count("trades:btcusdt", "cg_analytics").await.unwrap(), 0);
        assert_eq!(h.stats.snapshot().duplicates_skipped, 1);
        assert!(worker.unsealed.is_empty());

        // The redelivered trade was not merged a second time.
        let open = worker.candles.open_candle("btcusdt").unwrap();
        assert_eq!((open.t_start_ms, open.volume), (5000, 1.0));
    }

    struct FailingCache;

    #[async_trait]
    impl LatestCache for FailingCache {
        async fn set(&self, _symbol: &str, _snapshot: &IndicatorSnapshot) -> anyhow::Result<()> {
            anyhow::bail!("cache unreachable")
        }

        async fn get(&self, _symbol: &str) -> anyhow::Result<Option<IndicatorSnapshot>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn exhausted_cache_write_dead_letters_the_seal() {
        let h = harness();
        let mut worker = AggregatorWorker::new(
            h.cfg.clone(),
            h.log.clone(),
            h.store.clone(),
            Arc::new(FailingCache),
            h.stats.clone(),
        );
        worker.init().await.unwrap();
        h.publish(0, "100", "1").await;
        h.publish(5000, "101", "1").await;
        worker.poll_once(ReadCursor::New).await.unwrap();

        assert_eq!(h.store.read_recent("btcusdt", 10).await.unwrap().len(), 1);

        let dlq = h.log.range("trades:DLQ").await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].fields["stream"], "latest:btcusdt");
        assert_eq!(dlq[0].fields["id"], "0");
        assert!(dlq[0].fields["err"].contains("cache unreachable"));
        let snap: IndicatorSnapshot = serde_json::from_str(&dlq[0].fields["fields"]).unwrap();
        assert_eq!(snap.close, Some(100.0));

        assert_eq!(h.log.pending_count("trades:btcusdt", "cg_analytics").await.unwrap(), 0);
        let stats = h.stats.snapshot();
        assert_eq!(stats.seal_failures, 1);
        assert_eq!(stats.dead_lettered, 1);
    }

    #[tokio::test]
    async fn retries_stop_after_success() {
        let mut calls = 0;
        let out: Result<u32, String> = with_retries(3, Duration::from_millis(1), "test", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 2 {
                    Err("nope".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls, 2);
    }
}
