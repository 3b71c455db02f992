// =============================================================================
// MemoryLog — in-process StreamLog backend
// =============================================================================
//
// All streams live behind one `parking_lot::Mutex`; blocked readers park on
// a `tokio::sync::Notify` that every append wakes.  Nothing survives the
// process, so this backend serves single-process deployments and tests.
// =============================================================================

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{trim_excess, EntryId, LogEntry, LogError, ReadCursor, StreamBatch, StreamLog};
use crate::types::{now_ms, Fields};

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    /// Pending entry id -> consumer it was delivered to.
    pending: BTreeMap<EntryId, String>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: VecDeque<LogEntry>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

/// In-process [`StreamLog`].
#[derive(Default)]
pub struct MemoryLog {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking group read shared by both cursors.
    fn collect(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<StreamBatch>, LogError> {
        let mut map = self.streams.lock();
        let mut batches = Vec::new();

        for name in streams {
            let no_group = || LogError::NoGroup {
                stream: name.clone(),
                group: group.to_string(),
            };
            let StreamState { entries, groups, .. } = map.get_mut(name).ok_or_else(no_group)?;
            let g = groups.get_mut(group).ok_or_else(no_group)?;

            let delivered: Vec<LogEntry> = match cursor {
                ReadCursor::New => {
                    let fresh: Vec<LogEntry> = entries
                        .iter()
                        .filter(|e| e.id > g.last_delivered)
                        .take(count)
                        .cloned()
                        .collect();
                    if let Some(tail) = fresh.last() {
                        g.last_delivered = tail.id;
                    }
                    for e in &fresh {
                        g.pending.insert(e.id, consumer.to_string());
                    }
                    fresh
                }
                ReadCursor::Pending => {
                    let mine: Vec<EntryId> = g
                        .pending
                        .iter()
                        .filter(|(_, c)| c.as_str() == consumer)
                        .map(|(id, _)| *id)
                        .take(count)
                        .collect();
                    let mut out = Vec::with_capacity(mine.len());
                    for id in mine {
                        match entries.binary_search_by(|e| e.id.cmp(&id)) {
                            Ok(i) => out.push(entries[i].clone()),
                            Err(_) => {
                                debug!(stream = %name, id = %id, "pending entry was trimmed; dropping it");
                                g.pending.remove(&id);
                            }
                        }
                    }
                    out
                }
            };

            if !delivered.is_empty() {
                batches.push(StreamBatch {
                    stream: name.clone(),
                    entries: delivered,
                });
            }
        }
        Ok(batches)
    }
}

#[async_trait]
impl StreamLog for MemoryLog {
    async fn append(&self, stream: &str, fields: &Fields, maxlen: Option<usize>) -> Result<EntryId, LogError> {
        let id = {
            let mut map = self.streams.lock();
            let state = map.entry(stream.to_string()).or_default();
            let id = EntryId::next_after(state.last_id, now_ms());
            state.last_id = id;
            state.entries.push_back(LogEntry {
                id,
                fields: fields.clone(),
            });
            if let Some(maxlen) = maxlen {
                let excess = trim_excess(state.entries.len(), maxlen);
                state.entries.drain(..excess);
            }
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), LogError> {
        let mut map = self.streams.lock();
        let state = map.entry(stream.to_string()).or_default();
        if state.groups.contains_key(group) {
            return Err(LogError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        state.groups.insert(group.to_string(), GroupState::default());
        Ok(())
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
            // Register interest before checking so an append between the
            // check and the wait is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batches = self.collect(group, consumer, streams, cursor, count)?;
            if !batches.is_empty() || cursor == ReadCursor::Pending {
                return Ok(batches);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<bool, LogError> {
        let mut map = self.streams.lock();
        let g = map
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| LogError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;
        Ok(g.pending.remove(&id).is_some())
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<usize, LogError> {
        let map = self.streams.lock();
        map.get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .ok_or_else(|| LogError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })
    }

    async fn len(&self, stream: &str) -> Result<usize, LogError> {
        Ok(self.streams.lock().get(stream).map_or(0, |s| s.entries.len()))
    }

    async fn range(&self, stream: &str) -> Result<Vec<LogEntry>, LogError> {
        Ok(self
            .streams
            .lock()
            .get(stream)
            .map(|s| s.entries.iter().cloned().collect())
            .unwrap_or_default())
    }
}
