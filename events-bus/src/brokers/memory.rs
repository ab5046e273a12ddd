use super::{BrokerError, BrokerResult, EntryFields, StreamBroker, StreamEntry};
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Delivery bookkeeping for one pending entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub consumer: String,
    pub delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the first entry never delivered to this group.
    next_index: usize,
    pending: HashMap<String, PendingEntry>,
    acked: u64,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: Vec<StreamEntry>,
    groups: HashMap<String, GroupState>,
}

/// In-process broker with Redis Streams consumer-group semantics.
///
/// Every group keeps a cursor over the stream and a pending-entries set;
/// `read_group` hands out each entry to exactly one consumer of the group and
/// blocks until something is appended or the block duration runs out. A zero
/// block duration makes the read non-blocking.
pub struct InMemoryStreamBroker {
    streams: DashMap<String, StreamLog>,
    sequence: AtomicU64,
    appended: Notify,
    closed: AtomicBool,
}

impl InMemoryStreamBroker {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            sequence: AtomicU64::new(0),
            appended: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Closed);
        }
        Ok(())
    }

    fn next_entry(&self, fields: EntryFields) -> StreamEntry {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        StreamEntry::new(format!("{}-0", seq), fields.into_iter().collect())
    }

    /// Number of entries ever appended to `stream`.
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams.get(stream).map(|log| log.entries.len()).unwrap_or(0)
    }

    /// Snapshot of every entry in `stream`, oldest first.
    pub fn entries(&self, stream: &str) -> Vec<StreamEntry> {
        self.streams
            .get(stream)
            .map(|log| log.entries.clone())
            .unwrap_or_default()
    }

    pub fn group_exists(&self, stream: &str, group: &str) -> bool {
        self.streams
            .get(stream)
            .map(|log| log.groups.contains_key(group))
            .unwrap_or(false)
    }

    pub fn pending_count(&self, stream: &str, group: &str) -> usize {
        self.with_group(stream, group, |state| state.pending.len())
            .unwrap_or(0)
    }

    /// Pending entry ids for `group`, oldest first.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        let mut ids = self
            .with_group(stream, group, |state| state.pending.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort_by_key(|id| sequence_of(id));
        ids
    }

    pub fn pending_entry(&self, stream: &str, group: &str, id: &str) -> Option<PendingEntry> {
        self.with_group(stream, group, |state| state.pending.get(id).cloned())
            .flatten()
    }

    /// Total acknowledgments that removed an entry from `group`'s pending set.
    pub fn acked_count(&self, stream: &str, group: &str) -> u64 {
        self.with_group(stream, group, |state| state.acked).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn with_group<T>(&self, stream: &str, group: &str, f: impl FnOnce(&GroupState) -> T) -> Option<T> {
        let log = self.streams.get(stream)?;
        log.groups.get(group).map(f)
    }

    /// Deliver up to `count` never-delivered entries, or `None` when the
    /// group has caught up with the stream.
    fn take_undelivered(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> BrokerResult<Option<Vec<StreamEntry>>> {
        let no_group = || BrokerError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };

        let mut log = self.streams.get_mut(stream).ok_or_else(no_group)?;
        let StreamLog { entries, groups } = &mut *log;
        let state = groups.get_mut(group).ok_or_else(no_group)?;

        if state.next_index >= entries.len() {
            return Ok(None);
        }

        let batch: Vec<StreamEntry> = entries
            .iter()
            .skip(state.next_index)
            .take(count.max(1))
            .cloned()
            .collect();

        state.next_index += batch.len();
        for entry in &batch {
            let pending = state
                .pending
                .entry(entry.id.clone())
                .or_insert_with(|| PendingEntry {
                    consumer: consumer.to_string(),
                    delivery_count: 0,
                });
            pending.consumer = consumer.to_string();
            pending.delivery_count += 1;
        }

        Ok(Some(batch))
    }
}

impl Default for InMemoryStreamBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric ordering key of an `<seq>-<n>` id; `0` for the stream start.
fn sequence_of(id: &str) -> u64 {
    id.split('-')
        .next()
        .and_then(|seq| seq.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl StreamBroker for InMemoryStreamBroker {
    async fn append(&self, stream: &str, fields: EntryFields) -> BrokerResult<String> {
        self.ensure_open()?;

        let entry = self.next_entry(fields);
        let id = entry.id.clone();
        self.streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push(entry);

        self.appended.notify_waiters();
        Ok(id)
    }

    async fn append_batch(&self, stream: &str, entries: Vec<EntryFields>) -> BrokerResult<Vec<String>> {
        self.ensure_open()?;
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::with_capacity(entries.len());
        {
            let mut log = self.streams.entry(stream.to_string()).or_default();
            for fields in entries {
                let entry = self.next_entry(fields);
                ids.push(entry.id.clone());
                log.entries.push(entry);
            }
        }

        self.appended.notify_waiters();
        Ok(ids)
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> BrokerResult<()> {
        self.ensure_open()?;

        let mut log = self.streams.entry(stream.to_string()).or_default();
        if log.groups.contains_key(group) {
            return Err(BrokerError::GroupExists);
        }

        let next_index = if start_id == "$" {
            log.entries.len()
        } else {
            let start = sequence_of(start_id);
            log.entries
                .iter()
                .position(|entry| sequence_of(&entry.id) > start)
                .unwrap_or(log.entries.len())
        };

        log.groups.insert(
            group.to_string(),
            GroupState {
                next_index,
                ..GroupState::default()
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;

        loop {
            self.ensure_open()?;

            // Registered before looking so an append racing with us still wakes us.
            let appended = self.appended.notified();

            if let Some(batch) = self.take_undelivered(stream, group, consumer, count)? {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, appended).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<()> {
        self.ensure_open()?;

        if let Some(mut log) = self.streams.get_mut(stream) {
            if let Some(state) = log.groups.get_mut(group) {
                if state.pending.remove(id).is_some() {
                    state.acked += 1;
                }
            }
        }
        Ok(())
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.ensure_open()
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::Release);
        self.appended.notify_waiters();
        Ok(())
    }
}
