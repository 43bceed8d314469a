//! Path validation and containment checks.
//!
//! Everything the pipeline reads lives below the data root and everything it
//! writes lives below one of the managed roots. These helpers keep relative
//! paths from escaping their root and tell whether a resolved location is
//! still inside it.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Validates a root-relative path and returns its normalized form.
/// Ensures that paths don't escape the root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use gloom_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("Manga/SeriesA/Chapter1").is_ok());
/// assert!(validate_path("Manga/../Comics/part1.cbz").is_ok()); // (never leaves the root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("Manga/../../b").is_err());
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/../Manga/./SeriesA//Chapter1/").unwrap(),
///     Path::new("Manga/SeriesA/Chapter1")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Whether `path` equals `root` or lies below it. Purely lexical.
pub fn is_within(path: impl AsRef<Path>, root: impl AsRef<Path>) -> bool {
    path.as_ref().starts_with(root.as_ref())
}

/// Resolve symbolic links in `path` and report whether the real location is
/// still inside (the real location of) `root`.
///
/// Returns `Ok(None)` for a dangling link.
pub async fn resolve_within(path: &Path, root: &Path) -> Result<Option<PathBuf>> {
    let real_root = tokio::fs::canonicalize(root).await.map_err(|e| ErrorKind::from_io(e, root))?;
    match tokio::fs::canonicalize(path).await {
        Ok(real) if real.starts_with(&real_root) => Ok(Some(real)),
        Ok(_) => Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => exn::bail!(ErrorKind::from_io(e, path)),
    }
}
