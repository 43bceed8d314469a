//! Crash-safe placement of outputs.
//!
//! New content is never written at its final path. It is staged in a
//! temporary file (or directory) beside the destination, falling back to the
//! temp root when that is impossible, and then renamed into place. When the
//! rename crosses a device boundary the staged content is copied into a
//! `.partial` sibling of the destination, flushed to disk, and renamed from
//! there instead.
//!
//! Every temporary artifact is removed when its guard is dropped, so an
//! early return or a failed item cleans up after itself. Artifacts left
//! behind by a process crash all share the [`ARTIFACT_PREFIX`] and are
//! collected by [`sweep`](crate::sweep).

use crate::error::{ErrorKind, Result};
use crate::fs::{FilesystemHandle, LocalFilesystem};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::{Builder, TempDir, TempPath};
use tokio::fs;

/// File name prefix shared by every temporary artifact.
pub const ARTIFACT_PREFIX: &str = ".gloom-";

const STAGED_SUFFIX: &str = ".tmp";
const PARTIAL_SUFFIX: &str = ".partial";
const DISPLACED_SUFFIX: &str = ".old";

/// How [`Staging::link_or_copy`] placed a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Linked,
    Copied,
}

/// A temporary file waiting to be committed. Removed on drop.
pub struct StagedFile {
    path: TempPath,
    beside_destination: bool,
}
impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the temporary file lives next to its destination (and a plain
    /// rename is therefore expected to succeed).
    pub fn is_beside_destination(&self) -> bool {
        self.beside_destination
    }

    /// Stop the guard from deleting a path that has been moved away.
    fn disarm(self) {
        _ = self.path.keep();
    }
}

/// A temporary directory waiting to be committed. Removed on drop.
pub struct StagedDir {
    dir: TempDir,
}
impl StagedDir {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    fn disarm(self) {
        _ = self.dir.keep();
    }
}

#[derive(Clone)]
pub struct Staging {
    tmp_root: PathBuf,
    fs: FilesystemHandle,
}

impl Staging {
    pub fn new(tmp_root: impl Into<PathBuf>, fs: FilesystemHandle) -> Self {
        Self { tmp_root: tmp_root.into(), fs }
    }

    /// Staging on the real filesystem.
    pub fn local(tmp_root: impl Into<PathBuf>) -> Self {
        Self::new(tmp_root, LocalFilesystem::handle())
    }

    pub fn tmp_root(&self) -> &Path {
        &self.tmp_root
    }

    pub fn filesystem(&self) -> &FilesystemHandle {
        &self.fs
    }

    /// Create an empty temporary file for content that will end up at
    /// `destination`. Parent directories of the destination are created.
    pub async fn stage_file(&self, destination: &Path) -> Result<StagedFile> {
        let parent = parent_of(destination)?;
        fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, parent))?;
        if self.fs.can_stage_in(parent) {
            match artifact(STAGED_SUFFIX).tempfile_in(parent) {
                Ok(file) => return Ok(StagedFile { path: file.into_temp_path(), beside_destination: true }),
                Err(e) => tracing::debug!(
                    destination = %destination.display(),
                    error = %e,
                    "unable to stage beside destination, falling back to temp root"
                ),
            }
        }
        fs::create_dir_all(&self.tmp_root).await.map_err(|e| ErrorKind::from_io(e, &self.tmp_root))?;
        let file = artifact(STAGED_SUFFIX).tempfile_in(&self.tmp_root).map_err(|e| ErrorKind::from_io(e, &self.tmp_root))?;
        Ok(StagedFile { path: file.into_temp_path(), beside_destination: false })
    }

    /// Create an empty temporary directory for a tree that will end up at
    /// `destination`.
    pub async fn stage_dir(&self, destination: &Path) -> Result<StagedDir> {
        let parent = parent_of(destination)?;
        fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, parent))?;
        if self.fs.can_stage_in(parent) {
            match artifact(STAGED_SUFFIX).tempdir_in(parent) {
                Ok(dir) => return Ok(StagedDir { dir }),
                Err(e) => tracing::debug!(
                    destination = %destination.display(),
                    error = %e,
                    "unable to stage beside destination, falling back to temp root"
                ),
            }
        }
        fs::create_dir_all(&self.tmp_root).await.map_err(|e| ErrorKind::from_io(e, &self.tmp_root))?;
        let dir = artifact(STAGED_SUFFIX).tempdir_in(&self.tmp_root).map_err(|e| ErrorKind::from_io(e, &self.tmp_root))?;
        Ok(StagedDir { dir })
    }

    /// Move a staged file to `destination`, replacing an existing file.
    #[tracing::instrument(level = "debug", skip(self, staged), fields(staged = %staged.path().display()))]
    pub async fn commit_file(&self, staged: StagedFile, destination: &Path) -> Result<()> {
        if let Ok(metadata) = fs::symlink_metadata(destination).await
            && metadata.is_dir()
        {
            exn::bail!(ErrorKind::KindMismatch(destination.to_path_buf()));
        }
        sync_file(staged.path()).await?;
        match self.fs.rename(staged.path(), destination).await {
            Ok(()) => {
                staged.disarm();
                sync_dir(destination).await;
                Ok(())
            },
            Err(e) if matches!(&*e, ErrorKind::CrossesDevices(_)) => {
                tracing::debug!(destination = %destination.display(), "staged file is on another device, copying");
                // The staged file is dropped (and removed) whatever the outcome.
                self.replace_via_partial_file(staged.path(), destination).await
            },
            Err(e) => Err(e),
        }
    }

    async fn replace_via_partial_file(&self, source: &Path, destination: &Path) -> Result<()> {
        let parent = parent_of(destination)?;
        let partial = artifact(PARTIAL_SUFFIX)
            .tempfile_in(parent)
            .map_err(|e| ErrorKind::from_io(e, parent))?
            .into_temp_path();
        copy_preserving(source, &partial).await?;
        self.fs.rename(&partial, destination).await?;
        _ = partial.keep();
        sync_dir(destination).await;
        Ok(())
    }

    /// Move a staged directory to `destination`. An existing directory at the
    /// destination is replaced; it is only removed once the new tree is in
    /// place and is restored if placing the new tree fails.
    #[tracing::instrument(level = "debug", skip(self, staged), fields(staged = %staged.path().display()))]
    pub async fn commit_dir(&self, staged: StagedDir, destination: &Path) -> Result<()> {
        let parent = parent_of(destination)?;
        let displaced = match fs::symlink_metadata(destination).await {
            Ok(metadata) if metadata.is_dir() => Some(self.displace(destination, parent).await?),
            Ok(_) => exn::bail!(ErrorKind::KindMismatch(destination.to_path_buf())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => exn::bail!(ErrorKind::from_io(e, destination)),
        };
        let placed = self.place_dir(staged, destination, parent).await;
        if let (Err(_), Some(old)) = (&placed, displaced) {
            match self.fs.rename(old.path(), destination).await {
                Ok(()) => old.disarm(),
                Err(e) => tracing::error!(
                    destination = %destination.display(),
                    displaced = %old.path().display(),
                    error = ?e,
                    "unable to restore replaced directory"
                ),
            }
        }
        placed
    }

    /// Rename an existing directory out of the way. The returned guard
    /// deletes it when dropped.
    async fn displace(&self, destination: &Path, parent: &Path) -> Result<StagedDir> {
        // Renaming a directory over an empty one is atomic, so reserve a
        // unique empty directory name first.
        let aside = artifact(DISPLACED_SUFFIX).tempdir_in(parent).map_err(|e| ErrorKind::from_io(e, parent))?;
        self.fs.rename(destination, aside.path()).await?;
        Ok(StagedDir { dir: aside })
    }

    async fn place_dir(&self, staged: StagedDir, destination: &Path, parent: &Path) -> Result<()> {
        match self.fs.rename(staged.path(), destination).await {
            Ok(()) => {
                staged.disarm();
                Ok(())
            },
            Err(e) if matches!(&*e, ErrorKind::CrossesDevices(_)) => {
                tracing::debug!(destination = %destination.display(), "staged directory is on another device, copying");
                let partial = artifact(PARTIAL_SUFFIX).tempdir_in(parent).map_err(|e| ErrorKind::from_io(e, parent))?;
                copy_tree(staged.path(), partial.path()).await?;
                self.fs.rename(partial.path(), destination).await?;
                _ = partial.keep();
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Write `bytes` to `destination` through a staged file.
    pub async fn write_atomic(&self, destination: &Path, bytes: &[u8]) -> Result<()> {
        let staged = self.stage_file(destination).await?;
        fs::write(staged.path(), bytes).await.map_err(|e| ErrorKind::from_io(e, staged.path()))?;
        self.commit_file(staged, destination).await
    }

    /// Place a copy of `source` at `destination`, trying a hard link first
    /// when `try_link` is set. Links never replace an existing file; the copy
    /// fallback does.
    pub async fn link_or_copy(&self, source: &Path, destination: &Path, try_link: bool) -> Result<Placement> {
        if try_link {
            let parent = parent_of(destination)?;
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::from_io(e, parent))?;
            match self.fs.hard_link(source, destination).await {
                Ok(()) => return Ok(Placement::Linked),
                Err(e) => tracing::debug!(
                    source = %source.display(),
                    destination = %destination.display(),
                    error = ?e,
                    "hard link failed, falling back to copy"
                ),
            }
        }
        let staged = self.stage_file(destination).await?;
        copy_preserving(source, staged.path()).await?;
        self.commit_file(staged, destination).await?;
        Ok(Placement::Copied)
    }
}

fn artifact(suffix: &str) -> Builder<'static, '_> {
    let mut builder = Builder::new();
    builder.prefix(ARTIFACT_PREFIX).suffix(suffix);
    builder
}

fn parent_of(path: &Path) -> Result<&Path> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| exn::Exn::from(ErrorKind::InvalidPath(path.to_path_buf())))
}

/// Copy file contents and modification time, then flush to disk.
pub async fn copy_preserving(source: &Path, destination: &Path) -> Result<()> {
    let (source, destination) = (source.to_path_buf(), destination.to_path_buf());
    tokio::task::spawn_blocking(move || -> Result<()> {
        std::fs::copy(&source, &destination).map_err(|e| ErrorKind::from_io(e, &source))?;
        let modified: Option<SystemTime> = std::fs::metadata(&source).and_then(|m| m.modified()).ok();
        let file = std::fs::OpenOptions::new()
            .write(true)
            .open(&destination)
            .map_err(|e| ErrorKind::from_io(e, &destination))?;
        if let Some(modified) = modified {
            file.set_modified(modified).map_err(|e| ErrorKind::from_io(e, &destination))?;
        }
        file.sync_all().map_err(|e| ErrorKind::from_io(e, &destination))?;
        Ok(())
    })
    .await
    .map_err(|e| ErrorKind::Io(std::io::Error::other(e)))?
}

/// Recursively copy a directory tree. Symbolic links are skipped.
pub async fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let mut stack = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((source, target)) = stack.pop() {
        fs::create_dir_all(&target).await.map_err(|e| ErrorKind::from_io(e, &target))?;
        let mut entries = fs::read_dir(&source).await.map_err(|e| ErrorKind::from_io(e, &source))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, &source))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(|e| ErrorKind::from_io(e, &path))?;
            if file_type.is_dir() {
                stack.push((path, target.join(entry.file_name())));
            } else if file_type.is_file() {
                copy_preserving(&path, &target.join(entry.file_name())).await?;
            }
        }
    }
    Ok(())
}

async fn sync_file(path: &Path) -> Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
    file.sync_all().await.map_err(|e| ErrorKind::from_io(e, path))?;
    Ok(())
}

/// Flush the directory entry of a freshly renamed path. Best effort.
async fn sync_dir(path: &Path) {
    let Some(parent) = path.parent() else { return };
    if let Ok(dir) = fs::File::open(parent).await
        && let Err(e) = dir.sync_all().await
    {
        tracing::trace!(dir = %parent.display(), error = %e, "directory fsync skipped");
    }
}
