//! Compare the current state of the sources with the stored records.

use crate::Context;
use crate::candidate::OutputKind;
use crate::error::{ErrorKind as LibraryErrorKind, Result as LibraryResult};
use crate::plan::error::{ErrorKind, Result};
use crate::plan::{enabled_sources, outputs, threshold, virtual_path};
use crate::records::RecordKey;
use crate::scan::{Classifier, ScanEvent};
use derive_more::Display;
use exn::ResultExt;
use futures::StreamExt;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tokio::fs;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    /// Never materialized.
    #[display("new")]
    New,
    /// Materialized from a source that has changed since.
    #[display("changed")]
    Changed,
    #[display("unchanged")]
    Unchanged,
    /// Recorded, but the source is gone.
    #[display("missing")]
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    pub virtual_path: PathBuf,
    pub source: PathBuf,
    pub output: OutputKind,
    pub change: Change,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Diff {
    pub entries: Vec<DiffEntry>,
}

impl Diff {
    pub fn count(&self, change: Change) -> usize {
        self.entries.iter().filter(|e| e.change == change).count()
    }

    /// Entries per change, for every change that has any.
    pub fn counts(&self) -> BTreeMap<Change, usize> {
        self.entries.iter().fold(BTreeMap::new(), |mut counts, entry| {
            *counts.entry(entry.change).or_default() += 1;
            counts
        })
    }

    pub fn is_clean(&self) -> bool {
        self.entries.iter().all(|e| e.change == Change::Unchanged)
    }
}

/// Classify every enabled source and compare each output it would produce
/// with the record stored under the same virtual path.
///
/// Candidates below the image threshold produce nothing and are left out.
/// Unreadable candidates are logged and left out.
pub async fn diff(ctx: &Context) -> LibraryResult<Diff> {
    match diff_inner(ctx).await {
        Ok(diff) => Ok(diff),
        Err(e) if e.is_config() => Err(e).or_raise(|| LibraryErrorKind::Config),
        Err(e) => Err(e).or_raise(|| LibraryErrorKind::Scan),
    }
}

#[tracing::instrument(level = "info", skip_all)]
async fn diff_inner(ctx: &Context) -> Result<Diff> {
    let config = ctx.config.as_ref();
    let settings = &config.settings;
    let sources = enabled_sources(config).await?;
    let records: BTreeMap<RecordKey, _> = ctx
        .records
        .all()
        .await
        .or_raise(|| ErrorKind::Records)?
        .into_iter()
        .map(|r| (r.key(), r))
        .collect();

    let mut diff = Diff::default();
    let mut seen = HashSet::new();
    for source in sources {
        let stream = Classifier::new(config, source).candidates();
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            let candidate = match event {
                Ok(ScanEvent::Discovered(candidate)) => candidate,
                Ok(_) => continue,
                Err(e) => {
                    tracing::debug!(source = source.id, error = ?e, "candidate left out of diff");
                    continue;
                },
            };
            if threshold(&candidate, settings.min_images).is_some() {
                continue;
            }
            for output in outputs(settings, candidate.kind) {
                let virtual_path = virtual_path(&candidate.relative, output, settings);
                let key = RecordKey::new(&virtual_path, &candidate.path);
                let change = match records.get(&key) {
                    None => Change::New,
                    Some(record) if record.source_signature == candidate.signature => Change::Unchanged,
                    Some(_) => Change::Changed,
                };
                seen.insert(key);
                diff.entries.push(DiffEntry { virtual_path, source: candidate.path.clone(), output, change });
            }
        }
    }

    for (key, record) in &records {
        if seen.contains(key) || fs::try_exists(&record.source_path).await.unwrap_or(false) {
            continue;
        }
        diff.entries.push(DiffEntry {
            virtual_path: key.virtual_path.clone(),
            source: record.source_path.clone(),
            output: record.output_kind,
            change: Change::Missing,
        });
    }
    tracing::info!(entries = diff.entries.len(), clean = diff.is_clean(), "diff ready");
    Ok(diff)
}
