//! Persistence adapter for queued messages.
//!
//! Without a store the queue is memory-only and anything still queued when
//! the process exits is lost.

use std::collections::HashMap;

use async_trait::async_trait;
use cartwire_core::MessageId;
use parking_lot::Mutex;

use super::entry::QueueEntry;
use crate::errors::Result;

/// Durable backing for undelivered entries.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert or replace an entry.
    async fn save(&self, entry: &QueueEntry) -> Result<()>;
    /// Every entry currently stored.
    async fn load(&self) -> Result<Vec<QueueEntry>>;
    /// Remove an entry. Removing an unknown ID succeeds.
    async fn delete(&self, id: &MessageId) -> Result<()>;
}

/// Store kept in process memory. Survives queue restarts, not process
/// restarts.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    entries: Mutex<HashMap<MessageId, String>>,
}

impl MemoryQueueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn save(&self, entry: &QueueEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let _ = self.entries.lock().insert(entry.id().clone(), json);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<QueueEntry>> {
        let raw: Vec<String> = self.entries.lock().values().cloned().collect();
        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    async fn delete(&self, id: &MessageId) -> Result<()> {
        let _ = self.entries.lock().remove(id);
        Ok(())
    }
}
