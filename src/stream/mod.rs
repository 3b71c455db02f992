// =============================================================================
// Durable Ordered Log — per-symbol trade streams with consumer groups
// =============================================================================
//
// Each stream is an append-only sequence of flat field maps, addressed by
// strictly increasing `<ms>-<seq>` ids.  Readers join a named consumer
// group: every entry is delivered to one consumer of the group and stays in
// that group's pending set until it is explicitly acknowledged.
//
// Producers append with an approximate length bound: once a stream grows
// past `maxlen` plus a slack margin, its oldest entries are dropped back to
// `maxlen`.  Trimming never waits for consumers.
//
// Two backends implement `StreamLog`:
//   - `MemoryLog` — in-process, wakes blocked readers immediately.
//   - `SqliteLog` — file-backed, shared between processes.
// =============================================================================

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::Fields;

pub use memory::MemoryLog;
pub use sqlite::SqliteLog;

// =============================================================================
// Entry ids
// =============================================================================

/// Position of an entry within its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EntryId {
    pub ms: i64,
    pub seq: u64,
}

impl EntryId {
    pub const ZERO: EntryId = EntryId { ms: 0, seq: 0 };

    pub fn new(ms: i64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The id assigned to an entry appended at wall-clock `now_ms` after
    /// `last`.  Ids never go backwards, even when the clock does.
    pub fn next_after(last: EntryId, now_ms: i64) -> Self {
        if now_ms > last.ms {
            Self::new(now_ms, 0)
        } else {
            Self::new(last.ms, last.seq + 1)
        }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || LogError::InvalidId(s.to_string());
        let (ms, seq) = s.split_once('-').ok_or_else(bad)?;
        Ok(Self::new(
            ms.parse().map_err(|_| bad())?,
            seq.parse().map_err(|_| bad())?,
        ))
    }
}

// =============================================================================
// Read types
// =============================================================================

/// A single delivered entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub id: EntryId,
    pub fields: Fields,
}

/// Entries delivered from one stream in a single read.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub stream: String,
    pub entries: Vec<LogEntry>,
}

/// Which entries a group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to any consumer of the group.
    New,
    /// Entries already delivered to this consumer but not yet acknowledged.
    Pending,
}

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum LogError {
    #[error("consumer group {group:?} already exists on stream {stream:?}")]
    GroupExists { stream: String, group: String },

    #[error("no consumer group {group:?} on stream {stream:?}")]
    NoGroup { stream: String, group: String },

    #[error("invalid entry id {0:?}")]
    InvalidId(String),

    #[error("log storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for LogError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for LogError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<tokio::task::JoinError> for LogError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for LogError {
    fn from(e: serde_json::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

// =============================================================================
// StreamLog
// =============================================================================

#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Append `fields` to `stream`, creating the stream if needed.  With
    /// `maxlen` set the stream is approximately trimmed to that length.
    async fn append(&self, stream: &str, fields: &Fields, maxlen: Option<usize>) -> Result<EntryId, LogError>;

    /// Create `group` on `stream` starting from the beginning, creating the
    /// stream if needed.  Fails with [`LogError::GroupExists`] if present.
    async fn create_group(&self, stream: &str, group: &str) -> Result<(), LogError>;

    /// Read up to `count` entries per stream for `consumer` in `group`.
    ///
    /// With [`ReadCursor::New`] the read waits up to `block` for at least
    /// one entry and marks returned entries pending.  With
    /// [`ReadCursor::Pending`] it returns immediately.  Streams without
    /// entries are omitted from the result.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, LogError>;

    /// Remove `id` from the group's pending set.  Returns whether it was
    /// pending.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, LogError>;

    /// Number of delivered but unacknowledged entries in the group.
    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, LogError>;

    /// Number of entries currently retained in `stream`.
    async fn len(&self, stream: &str) -> Result<usize, LogError>;

    /// All retained entries of `stream`, oldest first.
    async fn range(&self, stream: &str) -> Result<Vec<LogEntry>, LogError>;
}

/// Create the group if it does not exist yet; an existing group is success.
pub async fn ensure_group(log: &dyn StreamLog, stream: &str, group: &str) -> Result<(), LogError> {
    match log.create_group(stream, group).await {
        Ok(()) | Err(LogError::GroupExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Number of entries to drop from a stream of `len` entries bounded by
/// `maxlen`.  Nothing is dropped until the slack margin is exceeded.
pub(crate) fn trim_excess(len: usize, maxlen: usize) -> usize {
    let maxlen = maxlen.max(1);
    let slack = (maxlen / 10).max(1);
    if len > maxlen + slack {
        len - maxlen
    } else {
        0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_roundtrip_and_order() {
        let id: EntryId = "1700000000000-3".parse().unwrap();
        assert_eq!(id, EntryId::new(1_700_000_000_000, 3));
        assert_eq!(id.to_string(), "1700000000000-3");
        assert!(EntryId::new(5, 9) < EntryId::new(6, 0));
        assert!(EntryId::new(5, 1) < EntryId::new(5, 2));
        assert!("abc".parse::<EntryId>().is_err());
        assert!("1-x".parse::<EntryId>().is_err());
    }

    #[test]
    fn next_after_is_monotonic() {
        let a = EntryId::next_after(EntryId::ZERO, 1000);
        assert_eq!(a, EntryId::new(1000, 0));
        let b = EntryId::next_after(a, 1000);
        assert_eq!(b, EntryId::new(1000, 1));
        // Clock went backwards.
        let c = EntryId::next_after(b, 900);
        assert_eq!(c, EntryId::new(1000, 2));
        assert!(a < b && b < c);
    }

    #[test]
    fn trim_is_approximate() {
        assert_eq!(trim_excess(100, 100), 0);
        assert_eq!(trim_excess(110, 100), 0);
        assert_eq!(trim_excess(111, 100), 11);
        assert_eq!(trim_excess(3, 1), 2);
        assert_eq!(trim_excess(2, 1), 0);
    }
}
