//! Side-effect free planning.
//!
//! [`plan`] classifies every enabled source (in ascending id order), decides
//! what to do with each candidate output and returns the resulting [`Plan`].
//! Nothing is written; the same plan is either displayed (dry run) or handed
//! to [`execute`](crate::materialize::execute).
//!
//! Only configuration problems (an enabled source root that does not exist)
//! fail the whole plan, before anything is classified. Candidates that cannot
//! be read become `SKIP_UNREADABLE` items and a warning.

mod decide;
pub mod error;
mod summary;

pub use self::decide::{Action, DestinationState, Facts, SkipReason, UpdatePolicy, decide, threshold};
pub use self::summary::Summary;
use crate::Context;
use crate::candidate::{Candidate, CandidateKind, OutputKind};
use crate::error::{ErrorKind as LibraryErrorKind, Result as LibraryResult};
use crate::plan::error::{ErrorKind, Result};
use crate::records::{ArchiveRecord, RecordKey};
use crate::resolve::{PathIndex, Resolution, suffixed};
use crate::scan::error::{Error as ScanError, ErrorKind as ScanErrorKind};
use crate::scan::{Classifier, ScanEvent};
use exn::ResultExt;
use futures::StreamExt;
use gloom_config::{Config, DuplicatePolicy, Settings, Source};
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::fs;

/// Where an output belongs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    /// Actual location on disk.
    pub physical: PathBuf,
    /// Location in the mirrored tree, relative to the output root. Records
    /// are keyed by it.
    pub virtual_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PlanItem {
    pub candidate: Arc<Candidate>,
    pub output: OutputKind,
    pub action: Action,
    pub destination: Destination,
    /// Where execution writes: the destination, or the duplicate route for
    /// [`Action::Duplicate`].
    pub target: PathBuf,
    pub prior: Option<ArchiveRecord>,
    /// Why a candidate could not be read.
    pub error: Option<String>,
}

impl PlanItem {
    pub fn is_mutating(&self) -> bool {
        !self.action.is_skip()
    }
}

/// An ordered list of decisions. Never modified once built.
#[derive(Debug, Clone)]
pub struct Plan {
    pub created_at: OffsetDateTime,
    pub policy: UpdatePolicy,
    pub items: Vec<PlanItem>,
    pub summary: Summary,
    pub warnings: Vec<String>,
}

impl Plan {
    pub fn mutating(&self) -> impl Iterator<Item = &PlanItem> {
        self.items.iter().filter(|item| item.is_mutating())
    }
}

/// Build a plan for every enabled source.
///
/// # Errors
/// [`Config`](LibraryErrorKind::Config) when an enabled source root is
/// missing, [`Plan`](LibraryErrorKind::Plan) when prior records cannot be
/// loaded.
pub async fn plan(ctx: &Context, policy: UpdatePolicy) -> LibraryResult<Plan> {
    match plan_inner(ctx, policy).await {
        Ok(plan) => Ok(plan),
        Err(e) if e.is_config() => Err(e).or_raise(|| LibraryErrorKind::Config),
        Err(e) => Err(e).or_raise(|| LibraryErrorKind::Plan),
    }
}

#[tracing::instrument(level = "info", skip(ctx))]
pub(crate) async fn plan_inner(ctx: &Context, policy: UpdatePolicy) -> Result<Plan> {
    let config = ctx.config.as_ref();
    let sources = enabled_sources(config).await?;
    let records = ctx.records.all().await.or_raise(|| ErrorKind::Records)?;
    let mut planner = Planner::new(config, policy, records).await;

    for source in sources {
        let stream = Classifier::new(config, source).candidates();
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            match event {
                Ok(ScanEvent::Discovered(candidate)) => planner.add(Arc::from(candidate)).await,
                Ok(ScanEvent::Started) => tracing::debug!(source = source.id, name = %source.name, "scanning source"),
                Ok(ScanEvent::Complete(found)) => tracing::debug!(source = source.id, found, "source scanned"),
                Err(e) => planner.add_unreadable(source, &e),
            }
        }
    }

    let plan = planner.finish();
    tracing::info!(items = plan.items.len(), summary = %plan.summary, "plan ready");
    Ok(plan)
}

/// Enabled sources in id order, once every one of their roots is known to be
/// a directory.
pub(crate) async fn enabled_sources(config: &Config) -> Result<Vec<&Source>> {
    let sources = config.enabled_sources();
    for source in &sources {
        let root = config.source_root(source);
        match fs::metadata(&root).await {
            Ok(metadata) if metadata.is_dir() => {},
            _ => exn::bail!(ErrorKind::SourceMissing(root)),
        }
    }
    Ok(sources)
}

/// The outputs the current settings produce for a kind of candidate.
pub(crate) fn outputs(settings: &Settings, kind: CandidateKind) -> Vec<OutputKind> {
    let mode = settings.output_mode;
    match kind {
        CandidateKind::Archive => vec![OutputKind::Archive],
        CandidateKind::Gallery => [(mode.zip(), OutputKind::GalleryZip), (mode.folder_copy(), OutputKind::FolderCopy)]
            .into_iter()
            .filter_map(|(enabled, output)| enabled.then_some(output))
            .collect(),
    }
}

struct Planner<'a> {
    settings: &'a Settings,
    config: &'a Config,
    policy: UpdatePolicy,
    created_at: OffsetDateTime,
    duplicates: DuplicatePolicy,
    records: HashMap<RecordKey, ArchiveRecord>,
    index: PathIndex,
    items: Vec<PlanItem>,
    warnings: Vec<String>,
}

impl<'a> Planner<'a> {
    async fn new(config: &'a Config, policy: UpdatePolicy, records: Vec<ArchiveRecord>) -> Self {
        let mut warnings = Vec::new();
        let duplicates = duplicate_policy(config, &mut warnings).await;
        let mut index = PathIndex::new(&config.paths.output_root);
        for record in &records {
            if fs::try_exists(&record.output_path).await.unwrap_or(false) {
                // Duplicate routes are owned by their source, as in `duplicate_route`.
                let owner = match record.last_action {
                    Action::Duplicate => &record.source_path,
                    _ => &record.virtual_path,
                };
                index.seed(owner, &record.output_path);
            }
        }
        Self {
            settings: &config.settings,
            config,
            policy,
            created_at: OffsetDateTime::now_utc(),
            duplicates,
            records: records.into_iter().map(|r| (r.key(), r)).collect(),
            index,
            items: Vec::new(),
            warnings,
        }
    }

    async fn add(&mut self, candidate: Arc<Candidate>) {
        for output in outputs(self.settings, candidate.kind) {
            let item = self.decide(&candidate, output).await;
            tracing::debug!(
                source = %candidate.relative.display(),
                %output,
                action = %item.action,
                target = %item.target.display(),
                "planned"
            );
            self.items.push(item);
        }
    }

    async fn decide(&mut self, candidate: &Arc<Candidate>, output: OutputKind) -> PlanItem {
        let flatten = self.settings.lanraragi_flatten;
        let virtual_path = virtual_path(&candidate.relative, output, self.settings);
        let prior = self.records.get(&RecordKey::new(&virtual_path, &candidate.path)).cloned();

        // Nothing below the image threshold claims a destination.
        if let Some(reason) = threshold(candidate, self.settings.min_images) {
            let physical = self.index.preview(&virtual_path, output, flatten);
            return PlanItem {
                candidate: candidate.clone(),
                output,
                action: Action::Skip(reason),
                target: physical.clone(),
                destination: Destination { physical, virtual_path },
                prior,
                error: None,
            };
        }

        let Resolution { physical, contested } = self.index.resolve(&virtual_path, &candidate.path, output, flatten);
        let state = DestinationState::inspect(&physical).await;
        let prior_output_exists = match &prior {
            Some(record) => fs::try_exists(&record.output_path).await.unwrap_or(false),
            None => false,
        };
        let action = decide(&Facts {
            candidate,
            output,
            destination: &physical,
            state,
            prior: prior.as_ref(),
            prior_output_exists,
            contested,
            min_images: self.settings.min_images,
            policy: self.policy,
        });
        let target = match action {
            Action::Duplicate => self.duplicate_route(candidate, &virtual_path, &physical, output),
            Action::Skip(SkipReason::DuplicateSameSignature) => {
                prior.as_ref().map_or_else(|| physical.clone(), |record| record.output_path.clone())
            },
            _ => physical.clone(),
        };
        PlanItem {
            candidate: candidate.clone(),
            output,
            action,
            destination: Destination { physical, virtual_path },
            target,
            prior,
            error: None,
        }
    }

    /// Alternate location for an output whose destination is taken.
    fn duplicate_route(&mut self, candidate: &Candidate, virtual_path: &Path, physical: &Path, output: OutputKind) -> PathBuf {
        let desired = match self.duplicates {
            DuplicatePolicy::Sink => self.config.paths.duplicates_root.join(virtual_path),
            DuplicatePolicy::Rename => {
                suffixed(physical, &format!("_DUP_{}", self.created_at.unix_timestamp()), output.is_file())
            },
        };
        self.index.claim(desired, &candidate.path, output.is_file())
    }

    fn add_unreadable(&mut self, source: &Source, error: &ScanError) {
        let ScanErrorKind::Unreadable { kind, path } = &**error;
        let relative = path.strip_prefix(&self.config.paths.data_root).unwrap_or(path).to_path_buf();
        let candidate = Arc::new(Candidate::unreadable(*kind, source.id, path.clone(), relative));
        let output = outputs(self.settings, *kind).first().copied().unwrap_or(OutputKind::FolderCopy);
        let virtual_path = virtual_path(&candidate.relative, output, self.settings);
        let physical = self.index.preview(&virtual_path, output, self.settings.lanraragi_flatten);
        let message = (**error).to_string();
        self.warnings.push(message.clone());
        self.items.push(PlanItem {
            candidate: candidate.clone(),
            output,
            action: Action::Skip(SkipReason::Unreadable),
            target: physical.clone(),
            prior: self.records.get(&RecordKey::new(&virtual_path, &candidate.path)).cloned(),
            destination: Destination { physical, virtual_path },
            error: Some(message),
        });
    }

    fn finish(self) -> Plan {
        let summary = Summary::tally(&self.items);
        Plan { created_at: self.created_at, policy: self.policy, items: self.items, summary, warnings: self.warnings }
    }
}

/// Rename is used instead of the sink when the sink cannot take files.
async fn duplicate_policy(config: &Config, warnings: &mut Vec<String>) -> DuplicatePolicy {
    if config.settings.duplicate_policy != DuplicatePolicy::Sink {
        return config.settings.duplicate_policy;
    }
    let root = &config.paths.duplicates_root;
    match fs::metadata(root).await {
        Ok(metadata) if metadata.is_dir() && !metadata.permissions().readonly() => DuplicatePolicy::Sink,
        _ => {
            tracing::warn!(root = %root.display(), "duplicate sink unavailable, falling back to rename");
            warnings.push(format!("duplicate sink {} is unavailable, duplicates are renamed in place", root.display()));
            DuplicatePolicy::Rename
        },
    }
}

/// The virtual path of an output, relative to the output root.
///
/// Without nesting replication only the top-level folder and the name are
/// kept. Gallery zips get the configured archive extension appended.
pub fn virtual_path(relative: &Path, output: OutputKind, settings: &Settings) -> PathBuf {
    let mut path = match (settings.replicate_nesting, relative.components().next(), relative.file_name()) {
        (false, Some(top), Some(name)) if relative.components().count() > 1 => Path::new(&top).join(name),
        _ => relative.to_path_buf(),
    };
    if output == OutputKind::GalleryZip {
        let mut name = path.file_name().map(OsString::from).unwrap_or_default();
        name.push(".");
        name.push(settings.archive_extension_for_galleries.as_str());
        path.set_file_name(name);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{MemoryStore, RecordStore};
    use gloom_config::{GalleryExtension, OutputMode, Paths};
    use gloom_storage::Staging;
    use rstest::rstest;

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: Context,
    }
    impl Fixture {
        fn new(files: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config { paths: Paths::under(dir.path()), ..Config::default() };
            config.sources.push(Source::new(1, "Manga", "Manga"));
            config.sources.push(Source::new(2, "Comics", "Comics"));
            for root in [&config.paths.output_root, &config.paths.duplicates_root] {
                std::fs::create_dir_all(root).unwrap();
            }
            for source in ["Manga", "Comics"] {
                std::fs::create_dir_all(config.paths.data_root.join(source)).unwrap();
            }
            for file in files {
                let path = config.paths.data_root.join(file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, file.as_bytes()).unwrap();
            }
            let staging = Staging::local(&config.paths.tmp_root);
            Self { _dir: dir, ctx: Context::new(config, MemoryStore::handle()).with_staging(staging) }
        }

        fn settings(&mut self) -> &mut Settings {
            &mut Arc::make_mut(&mut self.ctx.config).settings
        }

        async fn plan(&self) -> Plan {
            plan(&self.ctx, UpdatePolicy::Keep).await.unwrap()
        }
    }

    fn find<'a>(plan: &'a Plan, virtual_path: &str) -> &'a PlanItem {
        plan.items.iter().find(|i| i.destination.virtual_path == Path::new(virtual_path)).unwrap()
    }

    #[tokio::test]
    async fn test_gallery_zip_and_min_images() {
        let fixture = Fixture::new(&[
            "Manga/SeriesA/Chapter1/001.jpg",
            "Manga/SeriesA/Chapter1/002.jpg",
            "Manga/SeriesA/Chapter1/003.jpg",
            "Manga/SeriesB/Extras/cover.jpg",
        ]);
        let plan = fixture.plan().await;
        let chapter = find(&plan, "Manga/SeriesA/Chapter1.zip");
        assert_eq!(chapter.action, Action::Zip);
        assert_eq!(chapter.target, fixture.ctx.config.paths.output_root.join("Manga/SeriesA/Chapter1.zip"));
        assert_eq!(find(&plan, "Manga/SeriesB/Extras.zip").action, Action::Skip(SkipReason::BelowMinImages));
        assert_eq!(plan.summary.galleries_to_zip, 1);
        assert_eq!(plan.summary.reason_counts[&SkipReason::BelowMinImages], 1);
    }

    #[tokio::test]
    async fn test_zip_and_folder_copy_yield_two_items() {
        let mut fixture = Fixture::new(&["Manga/A/001.jpg", "Manga/A/002.jpg", "Manga/A/003.jpg"]);
        fixture.settings().output_mode = OutputMode::ZipAndFolderCopy;
        fixture.settings().archive_extension_for_galleries = GalleryExtension::Cbz;
        let plan = fixture.plan().await;
        assert_eq!(plan.items.len(), 2);
        assert_eq!(find(&plan, "Manga/A.cbz").action, Action::Zip);
        assert_eq!(find(&plan, "Manga/A").action, Action::Copy);
        assert_eq!((plan.summary.galleries_to_zip, plan.summary.folders_to_copy), (1, 1));
    }

    #[tokio::test]
    async fn test_flattened_archives() {
        let mut fixture = Fixture::new(&["Comics/A/part1.cbz", "Comics/B/part1.cbz"]);
        fixture.settings().lanraragi_flatten = true;
        let plan = fixture.plan().await;
        let output = &fixture.ctx.config.paths.output_root;
        let a = find(&plan, "Comics/A/part1.cbz");
        let b = find(&plan, "Comics/B/part1.cbz");
        assert_eq!(a.target, output.join("part1.cbz"));
        let hash = crate::resolve::short_hash(Path::new("Comics/B/part1.cbz"));
        assert_eq!(b.target, output.join(format!("part1__{hash}.cbz")));
        assert_eq!((a.action, b.action), (Action::Copy, Action::Copy));
        assert_eq!(plan.summary.archives_to_copy, 2);
    }

    #[rstest]
    #[case(DuplicatePolicy::Sink, true)]
    #[case(DuplicatePolicy::Rename, false)]
    #[tokio::test]
    async fn test_duplicate_routes(#[case] policy: DuplicatePolicy, #[case] into_sink: bool) {
        let mut fixture = Fixture::new(&["Comics/part1.cbz"]);
        fixture.settings().duplicate_policy = policy;
        let paths = fixture.ctx.config.paths.clone();
        std::fs::create_dir_all(paths.output_root.join("Comics")).unwrap();
        std::fs::write(paths.output_root.join("Comics/part1.cbz"), b"something else entirely").unwrap();

        let plan = fixture.plan().await;
        let item = find(&plan, "Comics/part1.cbz");
        assert_eq!(item.action, Action::Duplicate);
        match into_sink {
            true => assert_eq!(item.target, paths.duplicates_root.join("Comics/part1.cbz")),
            false => {
                let name = item.target.file_name().unwrap().to_string_lossy().into_owned();
                assert!(name.starts_with("part1_DUP_") && name.ends_with(".cbz"), "{name}");
                assert_eq!(item.target.parent(), Some(paths.output_root.join("Comics").as_path()));
            },
        }
        assert!(plan.warnings.is_empty());
        assert_eq!(plan.summary.duplicates, 1);
    }

    #[tokio::test]
    async fn test_missing_sink_falls_back_to_rename_with_warning() {
        let fixture = Fixture::new(&["Comics/part1.cbz"]);
        std::fs::remove_dir(&fixture.ctx.config.paths.duplicates_root).unwrap();
        let plan = fixture.plan().await;
        assert_eq!(plan.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_source_root_is_a_config_error() {
        let fixture = Fixture::new(&[]);
        std::fs::remove_dir(fixture.ctx.config.paths.data_root.join("Comics")).unwrap();
        let err = plan(&fixture.ctx, UpdatePolicy::Keep).await.unwrap_err();
        assert_eq!(*err, LibraryErrorKind::Config);
    }

    #[tokio::test]
    async fn test_disabled_sources_are_not_checked_or_scanned() {
        let mut fixture = Fixture::new(&["Comics/part1.cbz"]);
        let config = Arc::make_mut(&mut fixture.ctx.config);
        config.sources[1] = config.sources[1].clone().disabled();
        config.sources.push(Source::new(3, "Gone", "Gone").disabled());
        let plan = fixture.plan().await;
        assert!(plan.items.is_empty());
    }

    #[tokio::test]
    async fn test_prior_record_makes_unchanged_output_skip() {
        let fixture = Fixture::new(&["Comics/part1.cbz"]);
        let first = fixture.plan().await;
        let item = find(&first, "Comics/part1.cbz");
        std::fs::create_dir_all(item.target.parent().unwrap()).unwrap();
        std::fs::copy(&item.candidate.path, &item.target).unwrap();
        let now = OffsetDateTime::now_utc();
        fixture
            .ctx
            .records
            .upsert(ArchiveRecord {
                virtual_path: item.destination.virtual_path.clone(),
                output_path: item.target.clone(),
                source_path: item.candidate.path.clone(),
                output_kind: item.output,
                source_signature: item.candidate.signature,
                output_signature: item.candidate.signature,
                last_action: Action::Copy,
                created_at: now,
                updated_at: now,
                last_seen_at: now,
            })
            .await
            .unwrap();

        let second = fixture.plan().await;
        assert_eq!(find(&second, "Comics/part1.cbz").action, Action::Skip(SkipReason::ExistingUnchanged));
        assert_eq!(second.summary.skipped_existing, 1);
    }

    #[rstest]
    #[case("Manga/SeriesA/Chapter1", OutputKind::GalleryZip, true, "Manga/SeriesA/Chapter1.zip")]
    #[case("Manga/SeriesA/Chapter1", OutputKind::GalleryZip, false, "Manga/Chapter1.zip")]
    #[case("Manga/SeriesA/Vol.1", OutputKind::FolderCopy, false, "Manga/Vol.1")]
    #[case("Manga/Vol.1", OutputKind::GalleryZip, true, "Manga/Vol.1.zip")]
    #[case("Comics/a/b/part1.cbz", OutputKind::Archive, false, "Comics/part1.cbz")]
    fn test_virtual_path(
        #[case] relative: &str,
        #[case] output: OutputKind,
        #[case] replicate_nesting: bool,
        #[case] expected: &str,
    ) {
        let settings = Settings { replicate_nesting, ..Settings::default() };
        assert_eq!(virtual_path(Path::new(relative), output, &settings), Path::new(expected));
    }
}
