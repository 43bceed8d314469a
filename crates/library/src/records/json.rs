use crate::records::error::{ErrorKind, Result};
use crate::records::{ActivityEntry, ArchiveRecord, RecordKey, RecordStore};
use async_trait::async_trait;
use exn::ResultExt;
use gloom_storage::Staging;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<RecordKey, ArchiveRecord>,
    dirty: bool,
}

/// Records stored as a JSON array in a single file, activity appended to a
/// JSON lines journal.
///
/// Record changes are buffered and written on [`flush`](RecordStore::flush)
/// through a staged file, so the document on disk is always complete.
/// Activity entries are appended immediately.
pub struct JsonStore {
    path: PathBuf,
    journal: PathBuf,
    staging: Staging,
    state: Mutex<State>,
}

impl JsonStore {
    /// Open (or start) a store. Temporary files left behind by an interrupted
    /// flush are removed.
    #[tracing::instrument(level = "debug", skip(staging))]
    pub async fn open(path: &Path, journal: &Path, staging: Staging) -> Result<Self> {
        if let Some(parent) = path.parent() {
            gloom_storage::sweep(&[parent]).await.or_raise(|| ErrorKind::Storage(parent.to_path_buf()))?;
        }
        let records = match fs::read(path).await {
            Ok(bytes) => {
                let list: Vec<ArchiveRecord> =
                    serde_json::from_slice(&bytes).or_raise(|| ErrorKind::InvalidData(path.to_path_buf()))?;
                list.into_iter().map(|r| (r.key(), r)).collect()
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e).or_raise(|| ErrorKind::Storage(path.to_path_buf())),
        };
        tracing::debug!(records = records.len(), "record store opened");
        Ok(Self {
            path: path.to_path_buf(),
            journal: journal.to_path_buf(),
            staging,
            state: Mutex::new(State { records, dirty: false }),
        })
    }
}

#[async_trait]
impl RecordStore for JsonStore {
    async fn get(&self, key: &RecordKey) -> Result<Option<ArchiveRecord>> {
        Ok(self.state.lock().await.records.get(key).cloned())
    }

    async fn all(&self) -> Result<Vec<ArchiveRecord>> {
        Ok(self.state.lock().await.records.values().cloned().collect())
    }

    async fn upsert(&self, record: ArchiveRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.records.insert(record.key(), record);
        state.dirty = true;
        Ok(())
    }

    async fn touch(&self, key: &RecordKey, at: OffsetDateTime) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(record) = state.records.get_mut(key) else {
            return Ok(false);
        };
        record.last_seen_at = at;
        state.dirty = true;
        Ok(true)
    }

    async fn log_activity(&self, entry: ActivityEntry) -> Result<()> {
        let mut line = serde_json::to_vec(&entry).or_raise(|| ErrorKind::Encode)?;
        line.push(b'\n');
        if let Some(parent) = self.journal.parent() {
            fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Storage(parent.to_path_buf()))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)
            .await
            .or_raise(|| ErrorKind::Storage(self.journal.clone()))?;
        file.write_all(&line).await.or_raise(|| ErrorKind::Storage(self.journal.clone()))?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    async fn flush(&self) -> Result<()> {
        // Held across the write so concurrent upserts land in the next flush.
        let mut state = self.state.lock().await;
        if !state.dirty {
            return Ok(());
        }
        let list: Vec<&ArchiveRecord> = state.records.values().collect();
        let bytes = serde_json::to_vec_pretty(&list).or_raise(|| ErrorKind::Encode)?;
        self.staging.write_atomic(&self.path, &bytes).await.or_raise(|| ErrorKind::Storage(self.path.clone()))?;
        tracing::debug!(records = state.records.len(), "records flushed");
        state.dirty = false;
        Ok(())
    }
}
