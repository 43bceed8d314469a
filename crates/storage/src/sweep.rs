use crate::error::{ErrorKind, Result};
use crate::staging::ARTIFACT_PREFIX;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Remove temporary artifacts orphaned by a crash.
///
/// Walks every root (missing roots are ignored) without following symbolic
/// links, and deletes each file or directory whose name carries the
/// [`ARTIFACT_PREFIX`]. Must only be called while no placement is in flight.
/// Returns the removed paths.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn sweep<P: AsRef<Path>>(roots: &[P]) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for root in roots {
        let mut stack = vec![root.as_ref().to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => exn::bail!(ErrorKind::from_io(e, &current)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::from_io(e, &current))? {
                let path = entry.path();
                let file_type = entry.file_type().await.map_err(|e| ErrorKind::from_io(e, &path))?;
                let orphaned = entry.file_name().to_string_lossy().starts_with(ARTIFACT_PREFIX);
                match (orphaned, file_type.is_dir()) {
                    (true, true) => fs::remove_dir_all(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?,
                    (true, false) => fs::remove_file(&path).await.map_err(|e| ErrorKind::from_io(e, &path))?,
                    (false, true) => {
                        stack.push(path);
                        continue;
                    },
                    (false, false) => continue,
                }
                tracing::info!(path = %path.display(), "removed orphaned temporary artifact");
                removed.push(path);
            }
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::Staging;

    #[tokio::test]
    async fn test_crash_before_rename_leaves_nothing_after_sweep() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("output");
        let tmp = root.path().join("tmp");
        let staging = Staging::local(&tmp);
        let destination = output.join("Manga/SeriesA/Chapter1.zip");

        let staged = staging.stage_file(&destination).await.unwrap();
        std::fs::write(staged.path(), b"half written").unwrap();
        let orphan = staged.path().to_path_buf();
        // Simulate the process dying between the write and the rename.
        std::mem::forget(staged);

        assert!(!destination.exists());
        assert!(orphan.exists());

        let removed = sweep(&[&output, &tmp]).await.unwrap();
        assert_eq!(removed, vec![orphan.clone()]);
        assert!(!orphan.exists());
        assert!(!destination.exists());
    }

    #[tokio::test]
    async fn test_sweep_removes_staged_directories_and_keeps_outputs() {
        let root = tempfile::tempdir().unwrap();
        let output = root.path().join("output");
        std::fs::create_dir_all(output.join(".gloom-abc.tmp/sub")).unwrap();
        std::fs::write(output.join(".gloom-abc.tmp/sub/001.jpg"), b"x").unwrap();
        std::fs::create_dir_all(output.join("Manga")).unwrap();
        std::fs::write(output.join("Manga/Chapter1.zip"), b"zip").unwrap();
        std::fs::write(output.join("Manga/.gloom-def.partial"), b"part").unwrap();
        std::fs::write(output.join("Manga/.hidden"), b"keep").unwrap();

        let mut removed = sweep(&[&output, &root.path().join("missing")]).await.unwrap();
        removed.sort();
        assert_eq!(removed, vec![output.join(".gloom-abc.tmp"), output.join("Manga/.gloom-def.partial")]);
        assert!(output.join("Manga/Chapter1.zip").exists());
        assert!(output.join("Manga/.hidden").exists());
    }
}
