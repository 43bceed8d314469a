use crate::records::error::Result;
use crate::records::{ActivityEntry, ArchiveRecord, RecordHandle, RecordKey, RecordStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Records kept in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<RecordKey, ArchiveRecord>>,
    activity: RwLock<Vec<ActivityEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle() -> RecordHandle {
        Arc::new(Self::new())
    }

    /// Activity logged so far, oldest first.
    pub async fn activity(&self) -> Vec<ActivityEntry> {
        self.activity.read().await.clone()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<ArchiveRecord>> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn all(&self) -> Result<Vec<ArchiveRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn upsert(&self, record: ArchiveRecord) -> Result<()> {
        self.records.write().await.insert(record.key(), record);
        Ok(())
    }

    async fn touch(&self, key: &RecordKey, at: OffsetDateTime) -> Result<bool> {
        Ok(match self.records.write().await.get_mut(key) {
            Some(record) => {
                record.last_seen_at = at;
                true
            },
            None => false,
        })
    }

    async fn log_activity(&self, entry: ActivityEntry) -> Result<()> {
        self.activity.write().await.push(entry);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
