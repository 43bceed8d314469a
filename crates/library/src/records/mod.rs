//! Durable record of what previous runs produced.
//!
//! Every materialized output gets an [`ArchiveRecord`], keyed by its virtual
//! path and the source that produced it, so a duplicate routed away from a
//! contested destination never replaces the record of the output placed
//! there. The planner reads them back as prior state on the next run. Stores
//! also receive an append-only activity journal.
//!
//! Two stores are provided: [`MemoryStore`] for tests and dry setups, and
//! [`JsonStore`] which keeps records in a single JSON document rewritten
//! atomically on [`flush`](RecordStore::flush).

pub mod error;
mod json;
mod memory;

pub use self::json::JsonStore;
pub use self::memory::MemoryStore;
use crate::candidate::OutputKind;
use crate::plan::Action;
use crate::records::error::Result;
use async_trait::async_trait;
use derive_more::Display;
use gloom_storage::Signature;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;

pub type RecordHandle = Arc<dyn RecordStore>;

/// The last known state of one output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Where the output belongs in the mirrored tree, relative to the output root.
    pub virtual_path: PathBuf,
    /// Where the output actually is (after flattening, collision suffixes or
    /// duplicate routing).
    pub output_path: PathBuf,
    pub source_path: PathBuf,
    pub output_kind: OutputKind,
    /// Signature of the source when the output was produced.
    pub source_signature: Signature,
    /// Signature of the output right after it was placed.
    pub output_signature: Signature,
    pub last_action: Action,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen_at: OffsetDateTime,
}

impl ArchiveRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey::new(&self.virtual_path, &self.source_path)
    }
}

/// One source's output at one virtual path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey {
    pub virtual_path: PathBuf,
    pub source_path: PathBuf,
}

impl RecordKey {
    pub fn new(virtual_path: impl Into<PathBuf>, source_path: impl Into<PathBuf>) -> Self {
        Self { virtual_path: virtual_path.into(), source_path: source_path.into() }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    #[display("info")]
    Info,
    #[display("warning")]
    Warning,
    #[display("error")]
    Error,
}

/// One line of the activity journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub level: ActivityLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

impl ActivityEntry {
    pub fn new(level: ActivityLevel, message: impl Into<String>) -> Self {
        Self { at: OffsetDateTime::now_utc(), level, message: message.into(), payload: serde_json::Value::Null }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Storage for records and activity.
///
/// Writes may be buffered until [`flush()`](Self::flush); reads always see
/// buffered writes.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &RecordKey) -> Result<Option<ArchiveRecord>>;

    /// Every record, ordered by virtual path then source path.
    async fn all(&self) -> Result<Vec<ArchiveRecord>>;

    /// Insert or replace the record for [`record.key()`](ArchiveRecord::key).
    async fn upsert(&self, record: ArchiveRecord) -> Result<()>;

    /// Refresh the last-seen timestamp of an existing record. Returns `false`
    /// when there is no record for `key`.
    async fn touch(&self, key: &RecordKey, at: OffsetDateTime) -> Result<bool>;

    async fn log_activity(&self, entry: ActivityEntry) -> Result<()>;

    /// Persist buffered writes.
    async fn flush(&self) -> Result<()>;
}
