//! Cheap change-detection fingerprints.
//!
//! A [`Signature`] aggregates item count, total size and the newest
//! modification time of a file or a set of files. It is deterministic for
//! unchanged contents and is used purely as an equality proxy; no content is
//! ever hashed.

use crate::error::{ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tokio::fs;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub item_count: u64,
    pub total_bytes: u64,
    /// Unix timestamp in milliseconds; zero when there are no items.
    pub newest_mtime: i64,
}

impl Signature {
    /// Fold one file's metadata into the aggregate.
    pub fn record(&mut self, metadata: &Metadata) -> Result<()> {
        let modified = metadata.modified().map_err(ErrorKind::Io)?;
        let millis = OffsetDateTime::from(modified).unix_timestamp_nanos() / 1_000_000;
        self.item_count += 1;
        self.total_bytes += metadata.len();
        self.newest_mtime = self.newest_mtime.max(i64::try_from(millis).unwrap_or(i64::MAX));
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.item_count == 0
    }
}

/// Fingerprint a single file. Symbolic links are not followed.
pub async fn fingerprint_file(path: &Path) -> Result<Signature> {
    let metadata = fs::symlink_metadata(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
    if !metadata.is_file() {
        exn::bail!(ErrorKind::KindMismatch(path.to_path_buf()));
    }
    let mut signature = Signature::default();
    signature.record(&metadata)?;
    Ok(signature)
}

/// Fingerprint an already-classified list of files (a gallery's images).
///
/// The list is expected to contain regular files, or links the classifier
/// has already verified to resolve inside the source root. A file that has
/// vanished since classification fails with
/// [`NotFound`](crate::error::ErrorKind::NotFound).
pub async fn fingerprint_files<P: AsRef<Path>>(paths: &[P]) -> Result<Signature> {
    let mut signature = Signature::default();
    for path in paths {
        let path = path.as_ref();
        let metadata = fs::metadata(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
        signature.record(&metadata)?;
    }
    Ok(signature)
}

/// Fingerprint every regular file below `root` in a single traversal.
/// Symbolic links are skipped entirely.
pub async fn fingerprint_tree(root: &Path) -> Result<Signature> {
    let mut signature = Signature::default();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current).await.map_err(|e| ErrorKind::from_io(e, &current))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, &current))? {
            let path = entry.path();
            let metadata = fs::symlink_metadata(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?;
            if metadata.is_dir() {
                stack.push(path);
            } else if metadata.is_file() {
                signature.record(&metadata)?;
            }
        }
    }
    Ok(signature)
}

/// Fingerprint whatever lives at `path`: a tree for a directory, the file
/// itself otherwise.
pub async fn fingerprint(path: &Path) -> Result<Signature> {
    let metadata = fs::symlink_metadata(path).await.map_err(|e| ErrorKind::from_io(e, path))?;
    match metadata.is_dir() {
        true => fingerprint_tree(path).await,
        false => fingerprint_file(path).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Deref;

    fn write(root: &Path, rel: &str, data: &[u8]) -> PathBuf {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn test_file_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "part1.cbz", b"0123456789");
        let signature = fingerprint_file(&path).await.unwrap();
        assert_eq!(signature.item_count, 1);
        assert_eq!(signature.total_bytes, 10);
        assert!(signature.newest_mtime > 0);
        // Deterministic for unchanged contents
        assert_eq!(fingerprint_file(&path).await.unwrap(), signature);
    }

    #[tokio::test]
    async fn test_directory_is_not_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = fingerprint_file(dir.path()).await.unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::KindMismatch(_)));
    }

    #[tokio::test]
    async fn test_files_and_tree_agree() {
        let dir = tempfile::tempdir().unwrap();
        let files = vec![
            write(dir.path(), "001.jpg", b"aaa"),
            write(dir.path(), "002.jpg", b"bb"),
            write(dir.path(), "sub/003.png", b"c"),
        ];
        let listed = fingerprint_files(&files).await.unwrap();
        let walked = fingerprint_tree(dir.path()).await.unwrap();
        assert_eq!(listed, walked);
        assert_eq!(listed.item_count, 3);
        assert_eq!(listed.total_bytes, 6);
        assert_eq!(fingerprint(dir.path()).await.unwrap(), walked);
    }

    #[tokio::test]
    async fn test_change_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "001.jpg", b"aaa");
        let before = fingerprint_files(&[&path]).await.unwrap();
        std::fs::write(&path, b"aaaa").unwrap();
        assert_ne!(fingerprint_files(&[&path]).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_vanished_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "001.jpg", b"aaa");
        std::fs::remove_file(&path).unwrap();
        let err = fingerprint_files(&[&path]).await.unwrap_err();
        assert!(matches!(err.deref(), ErrorKind::NotFound(_)));
    }

    #[tokio::test]
    async fn test_empty() {
        let signature = fingerprint_files::<PathBuf>(&[]).await.unwrap();
        assert!(signature.is_empty());
        assert_eq!(signature.newest_mtime, 0);
    }
}
