//! Deterministic zip writing.
//!
//! Entries are written in sorted name order with their modification time
//! taken from the source file, and every entry uses the same compression
//! settings. Zipping unchanged input twice therefore produces byte-identical
//! archives, which keeps output signatures stable across runs.
//!
//! Writing is synchronous; [`write_zip_file`] moves it onto the blocking pool.

pub mod error;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::fs::File;
use std::io::{self, BufWriter, Seek, Write};
use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// A file to add to an archive and the name it gets inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub source: PathBuf,
    pub name: String,
}

/// Build archive entries for files belonging to the directory `base`.
///
/// Names are relative to `base` with `/` separators; a file outside `base`
/// keeps only its file name. The result is sorted by name. Of several files
/// sharing a name only the first is kept, each one left out is logged.
pub fn entries(base: &Path, files: &[PathBuf]) -> Result<Vec<Entry>> {
    let mut entries = files
        .iter()
        .map(|file| -> Result<Entry> {
            let relative = file.strip_prefix(base).ok().filter(|rel| !rel.as_os_str().is_empty());
            let relative = match relative {
                Some(rel) => rel,
                None => Path::new(file.file_name().ok_or_else(|| exn::Exn::from(ErrorKind::EntryName(file.clone())))?),
            };
            Ok(Entry { source: file.clone(), name: entry_name(relative)? })
        })
        .collect::<Result<Vec<Entry>>>()?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries.dedup_by(|dropped, kept| {
        let collides = dropped.name == kept.name;
        if collides {
            tracing::warn!(
                name = %kept.name,
                kept = %kept.source.display(),
                dropped = %dropped.source.display(),
                "entry name already taken, file left out of the archive"
            );
        }
        collides
    });
    Ok(entries)
}

fn entry_name(relative: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                parts.push(part.to_str().ok_or_else(|| exn::Exn::from(ErrorKind::EntryName(relative.to_path_buf())))?)
            },
            Component::CurDir => {},
            _ => exn::bail!(ErrorKind::EntryName(relative.to_path_buf())),
        }
    }
    if parts.is_empty() {
        exn::bail!(ErrorKind::EntryName(relative.to_path_buf()));
    }
    Ok(parts.join("/"))
}

/// Timestamp stored for an entry. Zip timestamps have two-second precision
/// and cannot represent dates before 1980; those fall back to the format's
/// default.
fn entry_time(path: &Path) -> DateTime {
    let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) else {
        return DateTime::default();
    };
    let at = OffsetDateTime::from(modified);
    u16::try_from(at.year())
        .ok()
        .and_then(|year| {
            DateTime::from_date_and_time(year, at.month().into(), at.day(), at.hour(), at.minute(), at.second()).ok()
        })
        .unwrap_or_default()
}

/// Write `entries` into a zip archive on `writer`, returning the writer.
pub fn write_zip<W: Write + Seek>(writer: W, entries: &[Entry]) -> Result<W> {
    let mut zip = ZipWriter::new(writer);
    for entry in entries {
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(entry_time(&entry.source))
            .unix_permissions(0o644);
        let mut source = File::open(&entry.source).or_raise(|| ErrorKind::Source(entry.source.clone()))?;
        zip.start_file(entry.name.as_str(), options).or_raise(|| ErrorKind::Write)?;
        io::copy(&mut source, &mut zip).or_raise(|| ErrorKind::Source(entry.source.clone()))?;
    }
    zip.finish().or_raise(|| ErrorKind::Write)
}

/// Zip `files` (all belonging to the gallery directory `base`) into the file
/// at `target`, which is created or truncated. Runs on the blocking pool and
/// returns the number of entries written.
#[tracing::instrument(level = "debug", skip(files), fields(files = files.len()))]
pub async fn write_zip_file(target: &Path, base: &Path, files: &[PathBuf]) -> Result<usize> {
    let entries = entries(base, files)?;
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<usize> {
        let file = File::create(&target).or_raise(|| ErrorKind::Write)?;
        let mut writer = write_zip(BufWriter::new(file), &entries)?;
        writer.flush().or_raise(|| ErrorKind::Write)?;
        Ok(entries.len())
    })
    .await
    .or_raise(|| ErrorKind::Write)?
}
