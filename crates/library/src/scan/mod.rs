//! Source tree classification.
//!
//! A [`Classifier`] walks one source depth-first, visiting entries in sorted
//! order, and streams typed [`Candidate`]s: gallery directories and
//! standalone archive files. Directories are finished post-order so that
//! a parent is only considered once everything below it is known.
//!
//! Managed roots (output, duplicates, temp) and configured exclusions are
//! never entered, even when they are nested inside a source. Symbolic links
//! to files are followed only when their target stays inside the source root;
//! links to directories are never followed.

pub mod error;

use crate::candidate::{Candidate, CandidateKind};
use crate::scan::error::{ErrorKind, Result};
use async_stream::stream;
use futures::Stream;
use gloom_config::{Config, ExtensionSet, ScanMode, Source};
use gloom_storage::{Signature, fingerprint_files, resolve_within};
use std::path::{Path, PathBuf};
use std::vec::IntoIter;
use tokio::fs;

/// Extensions of text and metadata files that travel with folder copies.
pub const SIDECAR_EXTENSIONS: [&str; 4] = ["txt", "json", "xml", "nfo"];

/// Progress events emitted by [`Classifier::candidates`].
///
/// [`Started`](Self::Started) comes first and [`Complete`](Self::Complete)
/// last, with the number of candidates discovered. Errors in between are
/// per-candidate and do not end the stream.
#[derive(Debug)]
pub enum ScanEvent {
    Started,
    Discovered(Box<Candidate>),
    Complete(u64),
}

enum Entry {
    Directory,
    File { listed: bool },
    Skip,
}

struct Frame {
    path: PathBuf,
    entries: IntoIter<PathBuf>,
    /// Entries named like images, whether or not they survive filtering.
    qualifying: usize,
    images: Vec<PathBuf>,
    sidecars: Vec<PathBuf>,
    has_subdirs: bool,
    gallery_below: bool,
}
impl Frame {
    fn new(path: PathBuf, entries: Vec<PathBuf>) -> Self {
        Self {
            path,
            entries: entries.into_iter(),
            qualifying: 0,
            images: Vec::new(),
            sidecars: Vec::new(),
            has_subdirs: false,
            gallery_below: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Classifier {
    source_id: u32,
    root: PathBuf,
    data_root: PathBuf,
    mode: ScanMode,
    leaf_only: bool,
    recursive: bool,
    images: ExtensionSet,
    archives: ExtensionSet,
    sidecars: Option<ExtensionSet>,
    excluded: Vec<PathBuf>,
}

impl Classifier {
    pub fn new(config: &Config, source: &Source) -> Self {
        let settings = &config.settings;
        let excluded = config
            .paths
            .managed_roots()
            .into_iter()
            .map(Path::to_path_buf)
            .chain(settings.exclusions.iter().map(|rel| config.paths.data_root.join(rel)))
            .collect();
        Self {
            source_id: source.id,
            root: config.source_root(source),
            data_root: config.paths.data_root.clone(),
            mode: source.scan_mode,
            leaf_only: settings.leaf_only,
            recursive: settings.count_recursive,
            images: settings.image_extensions.clone(),
            archives: settings.archive_extensions.clone(),
            sidecars: settings.copy_sidecars.then(|| SIDECAR_EXTENSIONS.into_iter().collect()),
            excluded,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_excluded(&self, path: &Path) -> bool {
        self.excluded.iter().any(|excluded| path.starts_with(excluded))
    }

    fn relative(&self, path: &Path) -> PathBuf {
        path.strip_prefix(&self.data_root).unwrap_or(path).to_path_buf()
    }

    fn unreadable(&self, kind: CandidateKind, path: &Path, cause: impl std::fmt::Display) -> error::Error {
        tracing::warn!(source = self.source_id, path = %path.display(), %kind, error = %cause, "skipping unreadable candidate");
        exn::Exn::from(ErrorKind::Unreadable { kind, path: path.to_path_buf() })
    }

    /// Decide what a directory entry is without following directory links.
    async fn entry(&self, path: &Path) -> Entry {
        let metadata = match fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                // Most likely removed between listing and inspection.
                tracing::debug!(path = %path.display(), error = %e, "entry vanished during scan");
                return Entry::Skip;
            },
        };
        if metadata.is_dir() {
            return match self.is_excluded(path) {
                true => Entry::Skip,
                false => Entry::Directory,
            };
        }
        if metadata.is_file() {
            return Entry::File { listed: !self.is_excluded(path) };
        }
        if metadata.is_symlink() {
            let target = match resolve_within(path, &self.root).await {
                Ok(Some(target)) => target,
                Ok(None) => {
                    tracing::debug!(path = %path.display(), "link leaves the source root or dangles, not followed");
                    return Entry::File { listed: false };
                },
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = ?e, "unable to resolve link");
                    return Entry::File { listed: false };
                },
            };
            return match fs::metadata(&target).await {
                Ok(m) if m.is_file() => Entry::File { listed: !self.is_excluded(path) },
                _ => Entry::Skip,
            };
        }
        Entry::Skip
    }

    async fn archive(&self, path: PathBuf) -> Result<Candidate> {
        let signature = fingerprint_files(&[&path]).await.map_err(|e| self.unreadable(CandidateKind::Archive, &path, &*e))?;
        Ok(Candidate {
            kind: CandidateKind::Archive,
            source_id: self.source_id,
            relative: self.relative(&path),
            files: vec![path.clone()],
            path,
            signature,
            sidecars: Vec::new(),
            leaf: true,
        })
    }

    async fn gallery(&self, frame: &Frame) -> Result<Candidate> {
        let signature =
            fingerprint_files(&frame.images).await.map_err(|e| self.unreadable(CandidateKind::Gallery, &frame.path, &*e))?;
        Ok(Candidate {
            kind: CandidateKind::Gallery,
            source_id: self.source_id,
            path: frame.path.clone(),
            relative: self.relative(&frame.path),
            signature,
            files: frame.images.clone(),
            sidecars: frame.sidecars.clone(),
            leaf: !frame.has_subdirs,
        })
    }

    /// Stream every candidate below the source root.
    ///
    /// A directory becomes a gallery when it holds at least one file named
    /// like an image: directly, or anywhere below it when counting
    /// recursively. Its image list is either its own images or its whole
    /// subtree's, never a mix. Links that leave the root and excluded files
    /// count towards qualification but are left out of the list, which can
    /// leave a gallery with no images at all.
    pub fn candidates(self) -> impl Stream<Item = Result<ScanEvent>> + Send + 'static {
        stream! {
            yield Ok(ScanEvent::Started);
            let mut found = 0u64;
            let mut stack: Vec<Frame> = Vec::new();
            if self.is_excluded(&self.root) {
                tracing::debug!(root = %self.root.display(), "source root is excluded");
            } else {
                match list_dir(&self.root).await {
                    Ok(entries) => stack.push(Frame::new(self.root.clone(), entries)),
                    Err(e) => yield Err(self.unreadable(CandidateKind::Gallery, &self.root, e)),
                }
            }

            while let Some(frame) = stack.last_mut() {
                if let Some(path) = frame.entries.next() {
                    match self.entry(&path).await {
                        Entry::Directory => {
                            frame.has_subdirs = true;
                            match list_dir(&path).await {
                                Ok(entries) => stack.push(Frame::new(path, entries)),
                                Err(e) => yield Err(self.unreadable(CandidateKind::Gallery, &path, e)),
                            }
                        },
                        Entry::File { listed } if self.images.matches(&path) => {
                            frame.qualifying += 1;
                            if listed {
                                frame.images.push(path);
                            }
                        },
                        Entry::File { listed: true } if self.sidecars.as_ref().is_some_and(|s| s.matches(&path)) => {
                            frame.sidecars.push(path);
                        },
                        Entry::File { listed: true } if self.mode.archives() && self.archives.matches(&path) => {
                            match self.archive(path).await {
                                Ok(candidate) => {
                                    found += 1;
                                    yield Ok(ScanEvent::Discovered(Box::new(candidate)));
                                },
                                Err(e) => yield Err(e),
                            }
                        },
                        Entry::File { .. } | Entry::Skip => {},
                    }
                    continue;
                }

                // Every entry of the frame on top of the stack has been seen.
                let Some(frame) = stack.pop() else { break };
                let qualifies = frame.qualifying > 0 && !(self.leaf_only && frame.gallery_below);
                let emitted = qualifies && self.mode.folders();
                if emitted {
                    match self.gallery(&frame).await {
                        Ok(candidate) => {
                            found += 1;
                            yield Ok(ScanEvent::Discovered(Box::new(candidate)));
                        },
                        Err(e) => yield Err(e),
                    }
                }
                if let Some(parent) = stack.last_mut() {
                    parent.gallery_below |= frame.gallery_below || emitted;
                    if self.recursive {
                        parent.qualifying += frame.qualifying;
                        parent.images.extend(frame.images);
                        parent.sidecars.extend(frame.sidecars);
                    }
                }
            }

            tracing::debug!(source = self.source_id, candidates = found, "classification complete");
            yield Ok(ScanEvent::Complete(found));
        }
    }

    /// Cheap aggregate over every image and archive file below the root,
    /// honouring the same exclusions as [`candidates`](Self::candidates).
    /// Used to notice that a source changed between runs.
    pub async fn snapshot(&self) -> Result<Signature> {
        let mut signature = Signature::default();
        let mut stack = vec![self.root.clone()];
        while let Some(current) = stack.pop() {
            let entries = list_dir(&current).await.map_err(|e| self.unreadable(CandidateKind::Gallery, &current, e))?;
            for path in entries {
                let Ok(metadata) = fs::symlink_metadata(&path).await else { continue };
                if self.is_excluded(&path) {
                    continue;
                }
                if metadata.is_dir() {
                    stack.push(path);
                } else if metadata.is_file()
                    && (self.images.matches(&path) || self.archives.matches(&path))
                    && signature.record(&metadata).is_err()
                {
                    tracing::trace!(path = %path.display(), "no modification time, ignored in snapshot");
                }
            }
        }
        Ok(signature)
    }
}

async fn list_dir(path: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    let mut reader = fs::read_dir(path).await?;
    while let Some(entry) = reader.next_entry().await? {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use gloom_config::Paths;
    use rstest::rstest;

    struct Tree {
        _dir: tempfile::TempDir,
        config: Config,
    }
    impl Tree {
        fn new(files: &[&str]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut config = Config { paths: Paths::under(dir.path()), ..Config::default() };
            config.sources.push(Source::new(1, "Manga", "Manga"));
            for file in files {
                let path = config.paths.data_root.join(file);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(&path, file.as_bytes()).unwrap();
            }
            std::fs::create_dir_all(config.paths.data_root.join("Manga")).unwrap();
            Self { _dir: dir, config }
        }

        async fn classify(&self) -> (Vec<Candidate>, Vec<error::Error>) {
            let classifier = Classifier::new(&self.config, &self.config.sources[0]);
            let mut candidates = Vec::new();
            let mut errors = Vec::new();
            let stream = classifier.candidates();
            futures::pin_mut!(stream);
            while let Some(event) = stream.next().await {
                match event {
                    Ok(ScanEvent::Discovered(c)) => candidates.push(*c),
                    Ok(_) => {},
                    Err(e) => errors.push(e),
                }
            }
            (candidates, errors)
        }
    }

    fn relatives(candidates: &[Candidate]) -> Vec<String> {
        candidates.iter().map(|c| c.relative.display().to_string()).collect()
    }

    #[tokio::test]
    async fn test_galleries_and_archives() {
        let tree = Tree::new(&[
            "Manga/SeriesA/Chapter1/001.jpg",
            "Manga/SeriesA/Chapter1/002.jpg",
            "Manga/SeriesA/Chapter1/003.png",
            "Manga/SeriesB/Extras/cover.jpg",
            "Manga/SeriesB/notes.txt",
            "Manga/Comics/part1.cbz",
        ]);
        let (candidates, errors) = tree.classify().await;
        assert!(errors.is_empty());
        assert_eq!(relatives(&candidates), vec!["Manga/Comics/part1.cbz", "Manga/SeriesA/Chapter1", "Manga/SeriesB/Extras"]);

        let chapter = &candidates[1];
        assert_eq!(chapter.kind, CandidateKind::Gallery);
        assert_eq!(chapter.image_count(), 3);
        assert_eq!(chapter.signature.item_count, 3);
        assert!(chapter.leaf);
        assert_eq!(candidates[0].kind, CandidateKind::Archive);
        assert_eq!(candidates[2].image_count(), 1);
    }

    #[rstest]
    // Deepest qualifying directories win
    #[case(true, false, vec!["Manga/Series/Chapter1", "Manga/Series/Chapter2"])]
    #[case(true, true, vec!["Manga/Series/Chapter1", "Manga/Series/Chapter2"])]
    // Without leaf-only, a parent with its own images qualifies too
    #[case(false, false, vec!["Manga/Series/Chapter1", "Manga/Series/Chapter2", "Manga/Series"])]
    // ...and counting recursively, so does every ancestor
    #[case(false, true, vec!["Manga/Series/Chapter1", "Manga/Series/Chapter2", "Manga/Series", "Manga"])]
    #[tokio::test]
    async fn test_leaf_and_recursive_rules(
        #[case] leaf_only: bool,
        #[case] recursive: bool,
        #[case] expected: Vec<&str>,
    ) {
        let mut tree = Tree::new(&[
            "Manga/Series/cover.jpg",
            "Manga/Series/Chapter1/001.jpg",
            "Manga/Series/Chapter2/001.jpg",
            "Manga/Series/Chapter2/002.jpg",
        ]);
        tree.config.settings.leaf_only = leaf_only;
        tree.config.settings.count_recursive = recursive;
        let (candidates, _) = tree.classify().await;
        assert_eq!(relatives(&candidates), expected);
        if !leaf_only && recursive {
            // Whole subtree, never mixed
            assert_eq!(candidates[3].image_count(), 4);
            assert!(!candidates[3].leaf);
        }
        if !leaf_only && !recursive {
            assert_eq!(candidates[2].image_count(), 1);
        }
    }

    #[rstest]
    #[case(ScanMode::Both, 2)]
    #[case(ScanMode::ArchivesOnly, 1)]
    #[case(ScanMode::FoldersOnly, 1)]
    #[tokio::test]
    async fn test_scan_mode(#[case] mode: ScanMode, #[case] expected: usize) {
        let mut tree = Tree::new(&["Manga/A/001.jpg", "Manga/B/part1.zip"]);
        tree.config.sources[0].scan_mode = mode;
        let (candidates, _) = tree.classify().await;
        assert_eq!(candidates.len(), expected);
        assert!(candidates.iter().all(|c| match c.kind {
            CandidateKind::Archive => mode.archives(),
            CandidateKind::Gallery => mode.folders(),
        }));
    }

    #[tokio::test]
    async fn test_managed_roots_and_exclusions_are_not_walked() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        // Output root nested inside the source
        let mut config = Config {
            paths: Paths { output_root: data.join("Manga/_out"), ..Paths::under(dir.path()) },
            ..Config::default()
        };
        config.sources.push(Source::new(1, "Manga", "Manga"));
        config.settings.exclusions.push(PathBuf::from("Manga/Private"));
        for file in ["Manga/_out/Old/001.jpg", "Manga/Private/001.jpg", "Manga/Public/001.jpg"] {
            let path = data.join(file);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, b"x").unwrap();
        }
        let tree = Tree { _dir: dir, config };
        let (candidates, _) = tree.classify().await;
        assert_eq!(relatives(&candidates), vec!["Manga/Public"]);
    }

    #[tokio::test]
    async fn test_sidecars_follow_copy_setting() {
        let mut tree = Tree::new(&["Manga/A/001.jpg", "Manga/A/info.json", "Manga/A/readme.md"]);
        let (candidates, _) = tree.classify().await;
        assert!(candidates[0].sidecars.is_empty());

        tree.config.settings.copy_sidecars = true;
        let (candidates, _) = tree.classify().await;
        assert_eq!(candidates[0].sidecars.len(), 1);
        assert!(candidates[0].sidecars[0].ends_with("info.json"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_links_outside_root_are_not_listed() {
        let tree = Tree::new(&["Manga/A/001.jpg", "Elsewhere/secret.jpg", "Elsewhere/Dir/002.jpg"]);
        let data = &tree.config.paths.data_root;
        std::os::unix::fs::symlink(data.join("Elsewhere/secret.jpg"), data.join("Manga/A/002.jpg")).unwrap();
        std::os::unix::fs::symlink(data.join("Manga/A/001.jpg"), data.join("Manga/A/003.jpg")).unwrap();
        std::fs::create_dir_all(data.join("Manga/B")).unwrap();
        std::os::unix::fs::symlink(data.join("Elsewhere/secret.jpg"), data.join("Manga/B/only.jpg")).unwrap();
        std::os::unix::fs::symlink(data.join("Elsewhere/Dir"), data.join("Manga/LinkedDir")).unwrap();

        let (candidates, _) = tree.classify().await;
        assert_eq!(relatives(&candidates), vec!["Manga/A", "Manga/B"]);
        let names: Vec<_> = candidates[0].files.iter().map(|f| f.file_name().unwrap().to_owned()).collect();
        assert_eq!(names, vec!["001.jpg", "003.jpg"]);
        // Qualifies by name, but nothing is left to materialize
        assert_eq!(candidates[1].image_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_directory_does_not_stop_the_walk() {
        use std::os::unix::fs::PermissionsExt;
        let tree = Tree::new(&["Manga/A/001.jpg", "Manga/Locked/001.jpg", "Manga/Z/001.jpg"]);
        let locked = tree.config.paths.data_root.join("Manga/Locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // Privileged users can read it anyway; nothing to assert then.
        if std::fs::read_dir(&locked).is_ok() {
            std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
            return;
        }
        let (candidates, errors) = tree.classify().await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(relatives(&candidates), vec!["Manga/A", "Manga/Z"]);
        assert_eq!(errors.len(), 1);
        assert!(matches!(&*errors[0], ErrorKind::Unreadable { kind: CandidateKind::Gallery, .. }));
    }

    #[tokio::test]
    async fn test_snapshot_changes_with_sources() {
        let tree = Tree::new(&["Manga/A/001.jpg", "Manga/A/notes.txt"]);
        let classifier = Classifier::new(&tree.config, &tree.config.sources[0]);
        let before = classifier.snapshot().await.unwrap();
        assert_eq!(before.item_count, 1);
        std::fs::write(tree.config.paths.data_root.join("Manga/A/002.jpg"), b"new").unwrap();
        assert_ne!(classifier.snapshot().await.unwrap(), before);
    }
}
