//! The filesystem seam used for placing outputs.
//!
//! Only the operations whose failure modes matter to crash-safety (renames
//! and hard links, which fail across devices) go through this trait, so tests
//! can simulate device boundaries without real mounts.

use crate::error::{ErrorKind, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::fs;

pub type FilesystemHandle = Arc<dyn Filesystem>;

#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Atomically rename `from` to `to`, replacing `to` if it is a file.
    ///
    /// Fails with [`CrossesDevices`](crate::error::ErrorKind::CrossesDevices)
    /// when both paths are not on the same filesystem.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Create a hard link at `to` pointing at `from`. Fails if `to` exists.
    async fn hard_link(&self, from: &Path, to: &Path) -> Result<()>;

    /// Whether temporary files may be created inside `dir`. When this returns
    /// `false` the staging layer falls back to its temp root.
    fn can_stage_in(&self, dir: &Path) -> bool {
        let _ = dir;
        true
    }
}

/// The real, local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    pub fn handle() -> FilesystemHandle {
        Arc::new(Self)
    }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::rename(from, to).await.map_err(|e| ErrorKind::from_io(e, to))?)
    }

    async fn hard_link(&self, from: &Path, to: &Path) -> Result<()> {
        Ok(fs::hard_link(from, to).await.map_err(|e| ErrorKind::from_io(e, to))?)
    }
}
