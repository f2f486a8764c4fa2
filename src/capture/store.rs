//! Bounded in-memory store of captured records
//!
//! Records are indexed by id. When the store is full the oldest completed
//! record is evicted; in-flight records are only evicted when nothing else
//! is left, so a response can almost always find its request.

use super::record::{CompletedRequest, RequestRecord};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
enum Entry {
    Pending(RequestRecord),
    Completed(CompletedRequest),
}

impl Entry {
    fn record(&self) -> &RequestRecord {
        match self {
            Entry::Pending(record) => record,
            Entry::Completed(completed) => completed.record(),
        }
    }
}

/// Id-indexed capture buffer with a fixed capacity
pub struct CaptureStore {
    entries: Mutex<BTreeMap<u64, Entry>>,
    capacity: usize,
}

impl CaptureStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Store a record whose response is still outstanding
    pub async fn insert_pending(&self, record: RequestRecord) {
        let mut entries = self.entries.lock().await;
        entries.insert(record.id, Entry::Pending(record));
        self.evict(&mut entries);
    }

    /// Replace the stored record with its completed form
    ///
    /// Completions for records that were evicted or cleared while in flight
    /// are dropped, so the store never grows past its capacity.
    pub async fn complete(&self, completed: CompletedRequest) {
        let mut entries = self.entries.lock().await;
        match entries.get_mut(&completed.id()) {
            Some(entry) => *entry = Entry::Completed(completed),
            None => debug!(id = completed.id(), "Dropping completion for evicted record"),
        }
    }

    fn evict(&self, entries: &mut BTreeMap<u64, Entry>) {
        while entries.len() > self.capacity {
            let victim = entries
                .iter()
                .find(|(_, entry)| matches!(entry, Entry::Completed(_)))
                .or_else(|| entries.iter().next())
                .map(|(id, _)| *id);

            match victim {
                Some(id) => {
                    entries.remove(&id);
                    debug!(id, "Evicted captured request");
                }
                None => break,
            }
        }
    }

    /// All records, newest first
    pub async fn list(&self) -> Vec<RequestRecord> {
        let entries = self.entries.lock().await;
        entries.values().rev().map(|e| e.record().clone()).collect()
    }

    pub async fn get(&self, id: u64) -> Option<RequestRecord> {
        let entries = self.entries.lock().await;
        entries.get(&id).map(|e| e.record().clone())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
