// =============================================================================
// Application Configuration — loaded once at startup, immutable afterwards
// =============================================================================
//
// Every tunable lives here.  The value is built once in `main`, validated,
// wrapped in `Arc` and handed to each component's constructor.
//
// Sources, in order of precedence (last wins):
//   1. Built-in defaults.
//   2. Optional JSON file (`candlestream.json`).
//   3. Environment variables (after `.env` is loaded).
//
// All fields carry `#[serde(default)]` so that partial files still load.
// =============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["btcusdt".to_string()]
}

fn default_candle_sec() -> u64 {
    5
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./data/crypto.db")
}

fn default_log_db_path() -> PathBuf {
    PathBuf::from("./data/streams.db")
}

fn default_stream_prefix() -> String {
    "trades:".to_string()
}

fn default_consumer_group() -> String {
    "cg_analytics".to_string()
}

fn default_consumer_name() -> String {
    "worker-1".to_string()
}

fn default_stream_maxlen() -> usize {
    20_000
}

fn default_dlq_stream() -> String {
    "trades:DLQ".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_feed_url() -> String {
    "wss://stream.binance.com:9443/ws/{symbol}@aggTrade".to_string()
}

fn default_feed_source() -> String {
    "binance".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

fn default_feed_ping_interval_ms() -> u64 {
    20_000
}

fn default_feed_ping_timeout_ms() -> u64 {
    20_000
}

fn default_read_count() -> usize {
    100
}

fn default_read_block_ms() -> u64 {
    2_000
}

fn default_history_window() -> usize {
    300
}

fn default_min_history() -> usize {
    30
}

fn default_storage_retry_attempts() -> u32 {
    3
}

fn default_storage_retry_delay_ms() -> u64 {
    100
}

fn default_loop_error_pause_ms() -> u64 {
    1_000
}

// =============================================================================
// Role
// =============================================================================

/// Which subsystems this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Ingestors, aggregator and read API in one process.
    #[default]
    All,
    /// Feed ingestors only.
    Ingest,
    /// Aggregator and read API only.
    Aggregate,
}

impl Role {
    pub fn runs_ingest(&self) -> bool {
        matches!(self, Self::All | Self::Ingest)
    }

    pub fn runs_aggregate(&self) -> bool {
        matches!(self, Self::All | Self::Aggregate)
    }
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "all" => Ok(Self::All),
            "ingest" | "producer" => Ok(Self::Ingest),
            "aggregate" | "consumer" => Ok(Self::Aggregate),
            other => bail!("unknown role {other:?} (expected all|ingest|aggregate)"),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Ingest => write!(f, "ingest"),
            Self::Aggregate => write!(f, "aggregate"),
        }
    }
}

// =============================================================================
// LogBackend
// =============================================================================

/// Where the durable trade log lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogBackend {
    /// SQLite file at `log_db_path`, shareable between processes.
    #[default]
    Sqlite,
    /// In-process only; requires `role = all`.
    Memory,
}

impl std::str::FromStr for LogBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => bail!("unknown log backend {other:?} (expected sqlite|memory)"),
        }
    }
}

// =============================================================================
// AppConfig
// =============================================================================

/// Process-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // --- Process ------------------------------------------------------------

    #[serde(default)]
    pub role: Role,

    /// Fallback log filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Listen address of the read-only HTTP API.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    // --- Symbols & candles --------------------------------------------------

    /// Lowercase exchange symbols, one ingestor task each.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Candle bucket duration in seconds.
    #[serde(default = "default_candle_sec")]
    pub candle_sec: u64,

    // --- Storage ------------------------------------------------------------

    /// SQLite file holding sealed candles.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,

    /// SQLite file backing the durable trade log.
    #[serde(default = "default_log_db_path")]
    pub log_db_path: PathBuf,

    // --- Durable log --------------------------------------------------------

    #[serde(default)]
    pub log_backend: LogBackend,

    #[serde(default = "default_stream_prefix")]
    pub stream_prefix: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,

    /// Approximate maximum length of each trade stream.
    #[serde(default = "default_stream_maxlen")]
    pub stream_maxlen: usize,

    #[serde(default = "default_dlq_stream")]
    pub dlq_stream: String,

    // --- Feed ---------------------------------------------------------------

    /// WebSocket URL template; `{symbol}` is substituted per task.
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Source tag written on every trade.
    #[serde(default = "default_feed_source")]
    pub feed_source: String,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Max random extension of each reconnect delay, as a fraction of it.
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    /// Interval between client pings on the feed connection.
    #[serde(default = "default_feed_ping_interval_ms")]
    pub feed_ping_interval_ms: u64,

    /// How long past a ping interval the feed may stay silent before the
    /// connection is treated as dead.
    #[serde(default = "default_feed_ping_timeout_ms")]
    pub feed_ping_timeout_ms: u64,

    // --- Aggregator ---------------------------------------------------------

    /// Max entries fetched per stream per poll.
    #[serde(default = "default_read_count")]
    pub read_count: usize,

    /// Max time a poll blocks waiting for new entries.
    #[serde(default = "default_read_block_ms")]
    pub read_block_ms: u64,

    /// Number of recent candles fed to the indicator engine.
    #[serde(default = "default_history_window")]
    pub history_window: usize,

    /// Below this many candles no snapshot is produced.
    #[serde(default = "default_min_history")]
    pub min_history: usize,

    #[serde(default = "default_storage_retry_attempts")]
    pub storage_retry_attempts: u32,

    #[serde(default = "default_storage_retry_delay_ms")]
    pub storage_retry_delay_ms: u64,

    #[serde(default = "default_loop_error_pause_ms")]
    pub loop_error_pause_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            role: Role::default(),
            log_level: default_log_level(),
            bind_addr: default_bind_addr(),
            symbols: default_symbols(),
            candle_sec: default_candle_sec(),
            sqlite_path: default_sqlite_path(),
            log_db_path: default_log_db_path(),
            log_backend: LogBackend::default(),
            stream_prefix: default_stream_prefix(),
            consumer_group: default_consumer_group(),
            consumer_name: default_consumer_name(),
            stream_maxlen: default_stream_maxlen(),
            dlq_stream: default_dlq_stream(),
            feed_url: default_feed_url(),
            feed_source: default_feed_source(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            backoff_jitter: default_backoff_jitter(),
            feed_ping_interval_ms: default_feed_ping_interval_ms(),
            feed_ping_timeout_ms: default_feed_ping_timeout_ms(),
            read_count: default_read_count(),
            read_block_ms: default_read_block_ms(),
            history_window: default_history_window(),
            min_history: default_min_history(),
            storage_retry_attempts: default_storage_retry_attempts(),
            storage_retry_delay_ms: default_storage_retry_delay_ms(),
            loop_error_pause_ms: default_loop_error_pause_ms(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, "config file loaded");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup. Empty values are
    /// ignored; unparseable numeric values are an error.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("SYMBOLS") {
            self.symbols = v
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(v) = get("CANDLE_SEC") {
            self.candle_sec = v.parse().with_context(|| format!("invalid CANDLE_SEC {v:?}"))?;
        }
        if let Some(v) = get("SQLITE_PATH") {
            self.sqlite_path = PathBuf::from(v);
        }
        if let Some(v) = get("LOG_DB_PATH") {
            self.log_db_path = PathBuf::from(v);
        }
        if let Some(v) = get("STREAM_PREFIX") {
            self.stream_prefix = v;
        }
        if let Some(v) = get("CONSUMER_GROUP") {
            self.consumer_group = v;
        }
        if let Some(v) = get("CONSUMER_NAME") {
            self.consumer_name = v;
        }
        if let Some(v) = get("STREAM_MAXLEN") {
            self.stream_maxlen = v
                .parse()
                .with_context(|| format!("invalid STREAM_MAXLEN {v:?}"))?;
        }
        if let Some(v) = get("DLQ_STREAM") {
            self.dlq_stream = v;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v.to_lowercase();
        }
        if let Some(v) = get("FEED_URL") {
            self.feed_url = v;
        }
        if let Some(v) = get("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = get("ROLE") {
            self.role = v.parse()?;
        }
        if let Some(v) = get("LOG_BACKEND") {
            self.log_backend = v.parse()?;
        }
        Ok(())
    }

    /// Normalise and sanity-check the configuration.
    pub fn validate(mut self) -> Result<Self> {
        self.symbols = self
            .symbols
            .iter()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect();
        let mut seen = std::collections::HashSet::new();
        self.symbols.retain(|s| seen.insert(s.clone()));

        if self.symbols.is_empty() {
            bail!("no symbols configured");
        }
        if self.candle_sec == 0 {
            bail!("candle_sec must be positive");
        }
        if self.stream_maxlen == 0 {
            bail!("stream_maxlen must be positive");
        }
        if self.read_count == 0 {
            bail!("read_count must be positive");
        }
        if self.min_history == 0 || self.min_history > self.history_window {
            bail!(
                "min_history ({}) must be in 1..=history_window ({})",
                self.min_history,
                self.history_window
            );
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            bail!("backoff must satisfy 0 < base <= cap");
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            bail!("backoff_jitter must be within [0, 1]");
        }
        if self.feed_ping_interval_ms == 0 || self.feed_ping_timeout_ms == 0 {
            bail!("feed ping interval and timeout must be positive");
        }
        if self.log_backend == LogBackend::Memory && self.role != Role::All {
            bail!("the memory log backend cannot be shared between processes; use role \"all\"");
        }
        if !self.feed_url.contains("{symbol}") {
            bail!("feed_url must contain a {{symbol}} placeholder");
        }
        Ok(self)
    }

    // --- Derived values -----------------------------------------------------

    pub fn bucket_ms(&self) -> i64 {
        (self.candle_sec * 1000) as i64
    }

    /// Name of the durable log stream carrying `symbol`'s trades.
    pub fn stream_key(&self, symbol: &str) -> String {
        format!("{}{}", self.stream_prefix, symbol)
    }

    /// Inverse of [`stream_key`](Self::stream_key).
    pub fn symbol_for_stream<'a>(&self, stream: &'a str) -> &'a str {
        stream
            .strip_prefix(self.stream_prefix.as_str())
            .or_else(|| stream.rsplit(':').next())
            .unwrap_or(stream)
    }

    pub fn stream_keys(&self) -> Vec<String> {
        self.symbols.iter().map(|s| self.stream_key(s)).collect()
    }

    pub fn feed_url_for(&self, symbol: &str) -> String {
        self.feed_url.replace("{symbol}", symbol)
    }

    pub fn feed_ping_interval(&self) -> Duration {
        Duration::from_millis(self.feed_ping_interval_ms)
    }

    /// Longest silence tolerated on the feed before reconnecting.
    pub fn feed_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_ping_interval_ms + self.feed_ping_timeout_ms)
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    pub fn loop_error_pause(&self) -> Duration {
        Duration::from_millis(self.loop_error_pause_ms)
    }

    pub fn storage_retry_delay(&self) -> Duration {
        Duration::from_millis(self.storage_retry_delay_ms)
    }
}
