// =============================================================================
// SqliteLog — file-backed StreamLog backend
// =============================================================================
//
// Entries, consumer-group cursors and pending sets live in three tables of
// one SQLite file, so a producer process and a consumer process can share
// the log.  Every mutation runs inside an IMMEDIATE transaction; WAL mode
// and a busy timeout let the two processes interleave.
//
// Blocked reads poll the tables until the deadline because appends from
// another process cannot signal this one.  Every statement runs on the
// blocking pool; a busy wait on the other process's write lock never pins
// a runtime worker.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{trim_excess, EntryId, LogEntry, LogError, ReadCursor, StreamBatch, StreamLog};
use crate::types::{now_ms, Fields};

/// Interval between checks while a read is blocked.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS stream_entries (
    stream TEXT NOT NULL,
    ms     INTEGER NOT NULL,
    seq    INTEGER NOT NULL,
    fields TEXT NOT NULL,
    PRIMARY KEY (stream, ms, seq)
);
CREATE TABLE IF NOT EXISTS stream_groups (
    stream   TEXT NOT NULL,
    grp      TEXT NOT NULL,
    last_ms  INTEGER NOT NULL,
    last_seq INTEGER NOT NULL,
    PRIMARY KEY (stream, grp)
);
CREATE TABLE IF NOT EXISTS stream_pending (
    stream     TEXT NOT NULL,
    grp        TEXT NOT NULL,
    ms         INTEGER NOT NULL,
    seq        INTEGER NOT NULL,
    consumer   TEXT NOT NULL,
    deliveries INTEGER NOT NULL,
    PRIMARY KEY (stream, grp, ms, seq)
);
";

type Conn = PooledConnection<SqliteConnectionManager>;

/// File-backed [`StreamLog`].
pub struct SqliteLog {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteLog {
    /// Open (creating if needed) the log database at `path`.
    pub fn open(path: &Path) -> Result<Self, LogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LogError::Storage(e.to_string()))?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder().max_size(4).build(manager)?;
        pool.get()?.execute_batch(SCHEMA)?;

        info!(path = %path.display(), "stream log opened");
        Ok(Self { pool })
    }

    /// Run `f` against a pooled connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, LogError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Conn) -> Result<T, LogError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await?
    }
}

/// One non-blocking group read, in a single IMMEDIATE transaction.
fn collect(
    conn: &mut Conn,
    group: &str,
    consumer: &str,
    streams: &[String],
    cursor: ReadCursor,
    count: usize,
) -> Result<Vec<StreamBatch>, LogError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut batches = Vec::new();

    for stream in streams {
        let cursor_row: Option<(i64, i64)> = tx
            .query_row(
                "SELECT last_ms, last_seq FROM stream_groups WHERE stream = ?1 AND grp = ?2",
                params![stream, group],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?;
        let Some((last_ms, last_seq)) = cursor_row else {
            return Err(LogError::NoGroup {
                stream: stream.clone(),
                group: group.to_string(),
            });
        };

        let entries = match cursor {
            ReadCursor::New => {
                let fresh = {
                    let mut stmt = tx.prepare_cached(
                        "SELECT ms, seq, fields FROM stream_entries
                         WHERE stream = ?1 AND (ms > ?2 OR (ms = ?2 AND seq > ?3))
                         ORDER BY ms, seq
                         LIMIT ?4",
                    )?;
                    let rows = stmt.query_map(
                        params![stream, last_ms, last_seq, count as i64],
                        |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?)),
                    )?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };

                let mut out = Vec::with_capacity(fresh.len());
                for (ms, seq, raw) in fresh {
                    tx.execute(
                        "INSERT OR REPLACE INTO stream_pending (stream, grp, ms, seq, consumer, deliveries)
                         VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                        params![stream, group, ms, seq, consumer],
                    )?;
                    out.push(LogEntry {
                        id: EntryId::new(ms, seq as u64),
                        fields: serde_json::from_str(&raw)?,
                    });
                }
                if let Some(tail) = out.last() {
                    tx.execute(
                        "UPDATE stream_groups SET last_ms = ?3, last_seq = ?4 WHERE stream = ?1 AND grp = ?2",
                        params![stream, group, tail.id.ms, tail.id.seq as i64],
                    )?;
                }
                out
            }
            ReadCursor::Pending => {
                let mine = {
                    let mut stmt = tx.prepare_cached(
                        "SELECT p.ms, p.seq, e.fields FROM stream_pending p
                         LEFT JOIN stream_entries e
                           ON e.stream = p.stream AND e.ms = p.ms AND e.seq = p.seq
                         WHERE p.stream = ?1 AND p.grp = ?2 AND p.consumer = ?3
                         ORDER BY p.ms, p.seq
                         LIMIT ?4",
                    )?;
                    let rows = stmt.query_map(params![stream, group, consumer, count as i64], |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, i64>(1)?,
                            r.get::<_, Option<String>>(2)?,
                        ))
                    })?;
                    rows.collect::<Result<Vec<_>, _>>()?
                };

                let mut out = Vec::with_capacity(mine.len());
                for (ms, seq, raw) in mine {
                    match raw {
                        Some(raw) => {
                            tx.execute(
                                "UPDATE stream_pending SET deliveries = deliveries + 1
                                 WHERE stream = ?1 AND grp = ?2 AND ms = ?3 AND seq = ?4",
                                params![stream, group, ms, seq],
                            )?;
                            out.push(LogEntry {
                                id: EntryId::new(ms, seq as u64),
                                fields: serde_json::from_str(&raw)?,
                            });
                        }
                        None => {
                            debug!(stream = %stream, id = %EntryId::new(ms, seq as u64), "pending entry was trimmed; dropping it");
                            tx.execute(
                                "DELETE FROM stream_pending
                                 WHERE stream = ?1 AND grp = ?2 AND ms = ?3 AND seq = ?4",
                                params![stream, group, ms, seq],
                            )?;
                        }
                    }
                }
                out
            }
        };

        if !entries.is_empty() {
            batches.push(StreamBatch {
                stream: stream.clone(),
                entries,
            });
        }
    }

    tx.commit()?;
    Ok(batches)
}

#[async_trait]
impl StreamLog for SqliteLog {
    async fn append(&self, stream: &str, fields: &Fields, maxlen: Option<usize>) -> Result<EntryId, LogError> {
        let raw = serde_json::to_string(fields)?;
        let stream = stream.to_string();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let last: Option<(i64, i64)> = tx
                .query_row(
                    "SELECT ms, seq FROM stream_entries WHERE stream = ?1 ORDER BY ms DESC, seq DESC LIMIT 1",
                    params![stream],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;
            let last = last.map_or(EntryId::ZERO, |(ms, seq)| EntryId::new(ms, seq as u64));
            let id = EntryId::next_after(last, now_ms());

            tx.execute(
                "INSERT INTO stream_entries (stream, ms, seq, fields) VALUES (?1, ?2, ?3, ?4)",
                params![stream, id.ms, id.seq as i64, raw],
            )?;

            if let Some(maxlen) = maxlen {
                let len: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
                    params![stream],
                    |r| r.get(0),
                )?;
                let excess = trim_excess(len as usize, maxlen);
                if excess > 0 {
                    tx.execute(
                        "DELETE FROM stream_entries WHERE rowid IN (
                             SELECT rowid FROM stream_entries WHERE stream = ?1 ORDER BY ms, seq LIMIT ?2
                         )",
                        params![stream, excess as i64],
                    )?;
                    debug!(stream = %stream, dropped = excess, "stream trimmed");
                }
            }

            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        let (stream, group) = (stream.to_string(), group.to_string());
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO stream_groups (stream, grp, last_ms, last_seq) VALUES (?1, ?2, 0, 0)",
                params![stream, group],
            )?;
            if inserted == 0 {
                return Err(LogError::GroupExists { stream, group });
            }
            Ok(())
        })
        .await
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
        let deadline = Instant::now() + block;
        loop {
            let (group, consumer, streams) = (group.to_string(), consumer.to_string(), streams.to_vec());
            let batches = self
                .with_conn(move |conn| collect(conn, &group, &consumer, &streams, cursor, count))
                .await?;
            if !batches.is_empty() || cursor == ReadCursor::Pending {
                return Ok(batches);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, LogError> {
        let (stream, group) = (stream.to_string(), group.to_string());
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM stream_pending WHERE stream = ?1 AND grp = ?2 AND ms = ?3 AND seq = ?4",
                params![stream, group, id.ms, id.seq as i64],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, LogError> {
        let (stream, group) = (stream.to_string(), group.to_string());
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM stream_groups WHERE stream = ?1 AND grp = ?2",
                    params![stream, group],
                    |r| r.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(LogError::NoGroup { stream, group });
            }
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM stream_pending WHERE stream = ?1 AND grp = ?2",
                params![stream, group],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    async fn len(&self, stream: &str) -> Result<usize, LogError> {
        let stream = stream.to_string();
        self.with_conn(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
                params![stream],
                |r| r.get(0),
            )?;
            Ok(n as usize)
        })
        .await
    }

    async fn range(&self, stream: &str) -> Result<Vec<LogEntry>, LogError> {
        let stream = stream.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT ms, seq, fields FROM stream_entries WHERE stream = ?1 ORDER BY ms, seq",
            )?;
            let rows = stmt
                .query_map(params![stream], |r| {
                    Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, String>(2)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(ms, seq, raw)| -> Result<LogEntry, LogError> {
                    Ok(LogEntry {
                        id: EntryId::new(ms, seq as u64),
                        fields: serde_json::from_str(&raw)?,
                    })
                })
                .collect()
        })
        .await
    }
}
