//! Filesystem doubles for testing.

use crate::error::{ErrorKind, Result};
use crate::fs::{Filesystem, LocalFilesystem};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Local filesystem split into pretend devices.
///
/// Every registered root is treated as the mount point of its own device;
/// paths outside all of them share one "default" device. Renames and hard
/// links between different devices fail with
/// [`CrossesDevices`](crate::error::ErrorKind::CrossesDevices) exactly like
/// `EXDEV` on a real system. Directories can also be marked as refusing
/// temporary files, which forces staging into the temp root.
#[derive(Default)]
pub struct DeviceSimulator {
    devices: Vec<PathBuf>,
    no_staging: HashSet<PathBuf>,
    renames: AtomicUsize,
    cross_device: AtomicUsize,
    fail_next_rename: Mutex<Option<PathBuf>>,
}

impl DeviceSimulator {
    pub fn with_device(mut self, root: impl Into<PathBuf>) -> Self {
        self.devices.push(root.into());
        self
    }

    pub fn refuse_staging_in(mut self, dir: impl Into<PathBuf>) -> Self {
        self.no_staging.insert(dir.into());
        self
    }

    /// Make the next rename whose destination is `to` fail with a generic
    /// I/O error, simulating a crash or a full disk at the worst moment.
    pub fn fail_next_rename_to(&self, to: impl Into<PathBuf>) {
        if let Ok(mut guard) = self.fail_next_rename.lock() {
            *guard = Some(to.into());
        }
    }

    /// Number of successful renames.
    pub fn renames(&self) -> usize {
        self.renames.load(Ordering::SeqCst)
    }

    /// Number of operations rejected because they crossed devices.
    pub fn cross_device_rejections(&self) -> usize {
        self.cross_device.load(Ordering::SeqCst)
    }

    fn device_of(&self, path: &Path) -> Option<&Path> {
        self.devices
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(PathBuf::as_path)
    }

    fn check_same_device(&self, from: &Path, to: &Path) -> Result<()> {
        if self.device_of(from) != self.device_of(to) {
            self.cross_device.fetch_add(1, Ordering::SeqCst);
            exn::bail!(ErrorKind::CrossesDevices(to.to_path_buf()));
        }
        Ok(())
    }

    fn take_injected_failure(&self, to: &Path) -> bool {
        match self.fail_next_rename.lock() {
            Ok(mut guard) if guard.as_deref() == Some(to) => guard.take().is_some(),
            _ => false,
        }
    }
}

#[async_trait]
impl Filesystem for DeviceSimulator {
    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if self.take_injected_failure(to) {
            exn::bail!(ErrorKind::Io(std::io::Error::other("injected rename failure")));
        }
        self.check_same_device(from, to)?;
        LocalFilesystem.rename(from, to).await?;
        self.renames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn hard_link(&self, from: &Path, to: &Path) -> Result<()> {
        self.check_same_device(from, to)?;
        LocalFilesystem.hard_link(from, to).await
    }

    fn can_stage_in(&self, dir: &Path) -> bool {
        !self.no_staging.iter().any(|refused| dir.starts_with(refused))
    }
}
