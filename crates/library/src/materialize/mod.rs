//! Plan execution.
//!
//! [`execute`] walks a [`Plan`] in order and carries out every mutating item:
//! archives are linked or copied, galleries are zipped or copied as folders.
//! Content is always staged first and moved into place by
//! [`Staging`](gloom_storage::Staging), so an interrupted item never leaves a
//! partial output at its final path.
//!
//! Items fail individually. A failure is recorded in the [`RunReport`] and the
//! run carries on with the next item. Cancellation is checked between items.

pub mod error;

use crate::Context;
use crate::candidate::OutputKind;
use crate::error::{ErrorKind as LibraryErrorKind, Result as LibraryResult};
use crate::materialize::error::{ErrorKind, Result};
use crate::plan::{Action, Plan, PlanItem, SkipReason, Summary};
use crate::records::{ActivityEntry, ActivityLevel, ArchiveRecord, RecordKey};
use exn::ResultExt;
use gloom_storage::{Placement, Signature, copy_preserving, fingerprint, sweep};
use serde::Serialize;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Completed { output_signature: Signature },
    Skipped,
    Failed { error: String },
}

/// What happened to one plan item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub virtual_path: PathBuf,
    pub source: PathBuf,
    pub output: OutputKind,
    pub action: Action,
    pub target: PathBuf,
    #[serde(flatten)]
    pub status: ItemStatus,
}

impl Outcome {
    fn new(item: &PlanItem, status: ItemStatus) -> Self {
        Self {
            virtual_path: item.destination.virtual_path.clone(),
            source: item.candidate.path.clone(),
            output: item.output,
            action: item.action,
            target: item.target.clone(),
            status,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, ItemStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub completed: usize,
    pub total: usize,
}

/// The result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// The executed plan's summary.
    pub summary: Summary,
    pub outcomes: Vec<Outcome>,
    pub completed: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Execution stopped early; items after the last outcome were not visited.
    pub cancelled: bool,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| o.is_failed())
    }
}

/// Execute `plan`, reporting progress after every item.
///
/// # Errors
/// Only failures that concern the run as a whole are returned: sweeping
/// leftovers of a previous crash before starting, and persisting records at
/// the end. Item failures are part of the [`RunReport`].
pub async fn execute<F>(ctx: &Context, plan: &Plan, cancel: &CancellationToken, progress: F) -> LibraryResult<RunReport>
where
    F: FnMut(Progress) + Send,
{
    execute_inner(ctx, plan, cancel, progress).await.or_raise(|| LibraryErrorKind::Materialize)
}

#[tracing::instrument(level = "info", skip_all, fields(items = plan.items.len(), policy = %plan.policy))]
pub(crate) async fn execute_inner<F>(
    ctx: &Context,
    plan: &Plan,
    cancel: &CancellationToken,
    mut progress: F,
) -> Result<RunReport>
where
    F: FnMut(Progress) + Send,
{
    let started_at = OffsetDateTime::now_utc();
    let removed = sweep(&ctx.config.paths.managed_roots()).await.or_raise(|| ErrorKind::Sweep)?;
    if !removed.is_empty() {
        tracing::info!(removed = removed.len(), "cleaned up after an interrupted run");
    }
    for warning in &plan.warnings {
        log_activity(ctx, ActivityEntry::new(ActivityLevel::Warning, warning.clone())).await;
    }

    let total = plan.items.len();
    let mut report = RunReport {
        started_at,
        finished_at: started_at,
        summary: plan.summary.clone(),
        outcomes: Vec::with_capacity(total),
        completed: 0,
        skipped: 0,
        failed: 0,
        cancelled: false,
        warnings: plan.warnings.clone(),
    };
    for (index, item) in plan.items.iter().enumerate() {
        if cancel.is_cancelled() {
            tracing::warn!(completed = index, total, "execution cancelled");
            report.cancelled = true;
            break;
        }
        let status = match item.action {
            Action::Skip(reason) => {
                if matches!(reason, SkipReason::ExistingUnchanged | SkipReason::DuplicateSameSignature) {
                    touch(ctx, RecordKey::new(&item.destination.virtual_path, &item.candidate.path)).await;
                }
                report.skipped += 1;
                ItemStatus::Skipped
            },
            _ => match materialize_item(ctx, item).await {
                Ok(record) => {
                    report.completed += 1;
                    let entry = ActivityEntry::new(ActivityLevel::Info, format!("{} {}", item.action, record.virtual_path.display()))
                        .with_payload(serde_json::json!({
                            "source": item.candidate.path,
                            "target": item.target,
                            "output": item.output,
                        }));
                    log_activity(ctx, entry).await;
                    ItemStatus::Completed { output_signature: record.output_signature }
                },
                Err(e) => {
                    tracing::warn!(
                        source = %item.candidate.path.display(),
                        target = %item.target.display(),
                        action = %item.action,
                        error = ?e,
                        "item failed"
                    );
                    report.failed += 1;
                    let error = (*e).to_string();
                    let entry = ActivityEntry::new(ActivityLevel::Error, error.clone()).with_payload(serde_json::json!({
                        "source": item.candidate.path,
                        "target": item.target,
                        "action": item.action,
                    }));
                    log_activity(ctx, entry).await;
                    ItemStatus::Failed { error }
                },
            },
        };
        report.outcomes.push(Outcome::new(item, status));
        progress(Progress { completed: index + 1, total });
    }

    ctx.records.flush().await.or_raise(|| ErrorKind::Flush)?;
    report.finished_at = OffsetDateTime::now_utc();
    tracing::info!(
        completed = report.completed,
        skipped = report.skipped,
        failed = report.failed,
        cancelled = report.cancelled,
        "execution finished"
    );
    Ok(report)
}

async fn touch(ctx: &Context, key: RecordKey) {
    if let Err(e) = ctx.records.touch(&key, OffsetDateTime::now_utc()).await {
        tracing::warn!(path = %key.virtual_path.display(), source = %key.source_path.display(), error = ?e, "unable to refresh record");
    }
}

async fn log_activity(ctx: &Context, entry: ActivityEntry) {
    if let Err(e) = ctx.records.log_activity(entry).await {
        tracing::warn!(error = ?e, "unable to write activity");
    }
}

/// Produce one output at the item's target, then record it.
#[tracing::instrument(level = "debug", skip_all, fields(target = %item.target.display(), action = %item.action))]
async fn materialize_item(ctx: &Context, item: &PlanItem) -> Result<ArchiveRecord> {
    let candidate = &item.candidate;
    let target = &item.target;
    match item.output {
        OutputKind::Archive => {
            let placement = ctx
                .staging
                .link_or_copy(&candidate.path, target, ctx.config.settings.use_hardlinks)
                .await
                .or_raise(|| ErrorKind::Place(target.clone()))?;
            if placement == Placement::Linked {
                tracing::debug!("archive hard linked");
            }
        },
        OutputKind::GalleryZip => {
            let staged = ctx.staging.stage_file(target).await.or_raise(|| ErrorKind::Stage(target.clone()))?;
            let entries = gloom_archive::write_zip_file(staged.path(), &candidate.path, &candidate.files)
                .await
                .or_raise(|| ErrorKind::Zip(candidate.path.clone()))?;
            tracing::debug!(entries, "gallery zipped");
            ctx.staging.commit_file(staged, target).await.or_raise(|| ErrorKind::Place(target.clone()))?;
        },
        OutputKind::FolderCopy => {
            let staged = ctx.staging.stage_dir(target).await.or_raise(|| ErrorKind::Stage(target.clone()))?;
            for file in candidate.files.iter().chain(&candidate.sidecars) {
                let relative = match file.strip_prefix(&candidate.path) {
                    Ok(relative) => relative,
                    Err(_) => Path::new(file.file_name().unwrap_or(file.as_os_str())),
                };
                let destination = staged.path().join(relative);
                if let Some(parent) = destination.parent() {
                    fs::create_dir_all(parent).await.or_raise(|| ErrorKind::Copy(file.clone()))?;
                }
                copy_preserving(file, &destination).await.or_raise(|| ErrorKind::Copy(file.clone()))?;
            }
            ctx.staging.commit_dir(staged, target).await.or_raise(|| ErrorKind::Place(target.clone()))?;
        },
    }

    let output_signature = fingerprint(target).await.or_raise(|| ErrorKind::Fingerprint(target.clone()))?;
    let now = OffsetDateTime::now_utc();
    let record = ArchiveRecord {
        virtual_path: item.destination.virtual_path.clone(),
        output_path: target.clone(),
        source_path: candidate.path.clone(),
        output_kind: item.output,
        source_signature: candidate.signature,
        output_signature,
        last_action: item.action,
        created_at: item.prior.as_ref().map_or(now, |prior| prior.created_at),
        updated_at: now,
        last_seen_at: now,
    };
    ctx.records.upsert(record.clone()).await.or_raise(|| ErrorKind::Record(target.clone()))?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{UpdatePolicy, plan};
    use crate::records::{MemoryStore, RecordStore};
    use gloom_config::{Config, OutputMode, Paths, Source};
    use std::io::Read;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: Context,
        store: Arc<MemoryStore>,
    }
    impl Fixture {
        fn new(files: &[&str], configure: impl FnOnce(&mut Config)) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config { paths: Paths::under(dir.path()), ..Config::default() };
            config.sources.push(Source::new(1, "Library", "Library"));
            configure(&mut config);
            std::fs::create_dir_all(config.paths.data_root.join("Library")).unwrap();
            std::fs::create_dir_all(&config.paths.duplicates_root).unwrap();
            for file in files {
                let path = config.paths.data_root.join(file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, format!("contents of {file}")).unwrap();
            }
            let store = Arc::new(MemoryStore::new());
            let ctx = Context::new(config, store.clone());
            Self { _dir: dir, ctx, store }
        }

        fn output(&self, rel: &str) -> PathBuf {
            self.ctx.config.paths.output_root.join(rel)
        }

        fn key(&self, virtual_path: &str, source: &str) -> RecordKey {
            RecordKey::new(virtual_path, self.ctx.config.paths.data_root.join(source))
        }

        async fn run(&self, policy: UpdatePolicy) -> RunReport {
            let plan = plan(&self.ctx, policy).await.unwrap();
            execute(&self.ctx, &plan, &CancellationToken::new(), |_| {}).await.unwrap()
        }
    }

    #[tokio::test]
    async fn test_gallery_zip_is_placed_and_recorded() {
        let fixture = Fixture::new(&["Library/Chapter1/001.jpg", "Library/Chapter1/002.jpg", "Library/Chapter1/003.jpg"], |_| {});
        let report = fixture.run(UpdatePolicy::Keep).await;
        assert_eq!((report.completed, report.failed), (1, 0));

        let zip_path = fixture.output("Library/Chapter1.zip");
        let mut archive = zip::ZipArchive::new(std::fs::File::open(&zip_path).unwrap()).unwrap();
        assert_eq!(archive.len(), 3);
        let mut contents = String::new();
        archive.by_name("002.jpg").unwrap().read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "contents of Library/Chapter1/002.jpg");

        let record = fixture.store.get(&fixture.key("Library/Chapter1.zip", "Library/Chapter1")).await.unwrap().unwrap();
        assert_eq!(record.output_path, zip_path);
        assert_eq!(record.last_action, Action::Zip);
        assert_eq!(record.output_signature.total_bytes, std::fs::metadata(&zip_path).unwrap().len());
        assert_eq!(fixture.store.activity().await.len(), 1);
    }

    #[tokio::test]
    async fn test_folder_copy_keeps_mtime_and_sidecars() {
        let fixture = Fixture::new(
            &["Library/Chapter1/001.jpg", "Library/Chapter1/002.jpg", "Library/Chapter1/003.jpg", "Library/Chapter1/info.txt"],
            |config| {
                config.settings.output_mode = OutputMode::FolderCopy;
                config.settings.copy_sidecars = true;
            },
        );
        let source = fixture.ctx.config.paths.data_root.join("Library/Chapter1/001.jpg");
        let old = std::time::SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        std::fs::File::options().write(true).open(&source).unwrap().set_modified(old).unwrap();

        let report = fixture.run(UpdatePolicy::Keep).await;
        assert_eq!(report.completed, 1);
        let copy = fixture.output("Library/Chapter1");
        assert!(copy.join("info.txt").is_file());
        assert_eq!(std::fs::metadata(copy.join("001.jpg")).unwrap().modified().unwrap(), old);
        assert_eq!(std::fs::read_dir(&copy).unwrap().count(), 4);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let fixture = Fixture::new(
            &["Library/Chapter1/001.jpg", "Library/Chapter1/002.jpg", "Library/Chapter1/003.jpg", "Library/part1.cbz"],
            |config| config.settings.output_mode = OutputMode::ZipAndFolderCopy,
        );
        let first = fixture.run(UpdatePolicy::Keep).await;
        assert_eq!(first.completed, 3);

        let second = plan(&fixture.ctx, UpdatePolicy::Keep).await.unwrap();
        assert!(second.items.iter().all(|i| i.action == Action::Skip(SkipReason::ExistingUnchanged)));
        assert_eq!(second.summary.skipped_existing, 3);
    }

    #[tokio::test]
    async fn test_refresh_overwrites_changed_gallery() {
        let fixture = Fixture::new(&["Library/Chapter1/001.jpg", "Library/Chapter1/002.jpg", "Library/Chapter1/003.jpg"], |_| {});
        fixture.run(UpdatePolicy::Keep).await;
        std::fs::write(fixture.ctx.config.paths.data_root.join("Library/Chapter1/004.jpg"), b"new page").unwrap();

        let report = fixture.run(UpdatePolicy::Refresh).await;
        assert_eq!(report.outcomes[0].action, Action::Overwrite);
        let archive = zip::ZipArchive::new(std::fs::File::open(fixture.output("Library/Chapter1.zip")).unwrap()).unwrap();
        assert_eq!(archive.len(), 4);
        let record = fixture.store.get(&fixture.key("Library/Chapter1.zip", "Library/Chapter1")).await.unwrap().unwrap();
        assert_eq!(record.last_action, Action::Overwrite);
        assert!(record.updated_at >= record.created_at);
    }

    #[tokio::test]
    async fn test_failed_item_does_not_block_the_rest() {
        let fixture = Fixture::new(
            &["Library/A/001.jpg", "Library/A/002.jpg", "Library/A/003.jpg", "Library/B/001.jpg", "Library/B/002.jpg", "Library/B/003.jpg"],
            |_| {},
        );
        let plan = plan(&fixture.ctx, UpdatePolicy::Keep).await.unwrap();
        // A page vanishes between planning and execution.
        std::fs::remove_file(fixture.ctx.config.paths.data_root.join("Library/A/002.jpg")).unwrap();

        let report = execute(&fixture.ctx, &plan, &CancellationToken::new(), |_| {}).await.unwrap();
        assert_eq!((report.completed, report.failed), (1, 1));
        let failure = report.failures().next().unwrap();
        assert_eq!(failure.virtual_path, Path::new("Library/A.zip"));
        assert!(!fixture.output("Library/A.zip").exists());
        assert!(fixture.output("Library/B.zip").is_file());
        // No staged leftovers beside the destination
        let leftovers: Vec<_> = std::fs::read_dir(fixture.output("Library"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(gloom_storage::ARTIFACT_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_between_items() {
        let fixture = Fixture::new(&["Library/a.cbz", "Library/b.cbz", "Library/c.cbz"], |_| {});
        let plan = plan(&fixture.ctx, UpdatePolicy::Keep).await.unwrap();
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let report = execute(&fixture.ctx, &plan, &cancel, |p| {
            seen.push(p);
            if p.completed == 1 {
                cancel.cancel();
            }
        })
        .await
        .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(seen, vec![Progress { completed: 1, total: 3 }]);
        assert!(fixture.output("Library/a.cbz").is_file());
        assert!(!fixture.output("Library/b.cbz").exists());
    }

    #[tokio::test]
    async fn test_hard_links_when_enabled() {
        let fixture = Fixture::new(&["Library/part1.cbz"], |config| config.settings.use_hardlinks = true);
        fixture.run(UpdatePolicy::Keep).await;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let source = std::fs::metadata(fixture.ctx.config.paths.data_root.join("Library/part1.cbz")).unwrap();
            let output = std::fs::metadata(fixture.output("Library/part1.cbz")).unwrap();
            assert_eq!(source.ino(), output.ino());
        }
    }
}
