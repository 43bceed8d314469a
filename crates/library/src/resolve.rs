//! Destination path resolution.
//!
//! Every output has a *virtual* path (where it belongs in the mirrored tree)
//! and a *physical* path (where it actually lives on disk). They only differ
//! when flattening or when two virtual paths compete for the same physical
//! path, in which case the later one gets a `__{hash}` suffix derived from its
//! virtual path. The suffix is stable, so the same set of claims always yields
//! the same physical paths.

use crate::candidate::OutputKind;
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Hex characters of the virtual path hash used in collision suffixes.
const SHORT_HASH_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub physical: PathBuf,
    /// The virtual path was already claimed in this run by a different source.
    pub contested: bool,
}

/// Physical paths owned in the current run, seeded with the outputs of prior
/// runs that still exist on disk. Exclusive to a single run.
#[derive(Debug, Clone, Default)]
pub struct PathIndex {
    output_root: PathBuf,
    /// physical -> virtual (or, for duplicate routes, the owning key)
    owners: HashMap<PathBuf, PathBuf>,
    /// virtual -> (physical, source) for claims made during this run
    claims: HashMap<PathBuf, (PathBuf, PathBuf)>,
}

impl PathIndex {
    pub fn new(output_root: impl Into<PathBuf>) -> Self {
        Self { output_root: output_root.into(), ..Self::default() }
    }

    /// Register an output placed by a previous run.
    pub fn seed(&mut self, virtual_path: impl Into<PathBuf>, physical: impl Into<PathBuf>) {
        self.owners.insert(physical.into(), virtual_path.into());
    }

    /// The virtual path owning a physical path, if any.
    pub fn owner(&self, physical: &Path) -> Option<&Path> {
        self.owners.get(physical).map(PathBuf::as_path)
    }

    /// Where `virtual_path` would be placed, ignoring collisions. Claims
    /// nothing.
    pub fn preview(&self, virtual_path: &Path, output: OutputKind, flatten: bool) -> PathBuf {
        match (flatten && output.is_file(), virtual_path.file_name()) {
            (true, Some(name)) => self.output_root.join(name),
            _ => self.output_root.join(virtual_path),
        }
    }

    /// Resolve (and claim) the physical path for `virtual_path`.
    ///
    /// `flatten` places file outputs directly under the output root; it has no
    /// effect on folder copies. Resolving the same virtual path again returns
    /// the same physical path, flagged as contested when the second request
    /// comes from a different source.
    pub fn resolve(&mut self, virtual_path: &Path, source: &Path, output: OutputKind, flatten: bool) -> Resolution {
        if let Some((physical, claimant)) = self.claims.get(virtual_path) {
            return Resolution { physical: physical.clone(), contested: claimant != source };
        }
        let desired = self.preview(virtual_path, output, flatten);
        let physical = self.claim(desired, virtual_path, output.is_file());
        self.claims.insert(virtual_path.to_path_buf(), (physical.clone(), source.to_path_buf()));
        Resolution { physical, contested: false }
    }

    /// Claim `desired` for `key`, or the first free suffixed variant of it.
    pub fn claim(&mut self, desired: PathBuf, key: &Path, is_file: bool) -> PathBuf {
        if self.is_free_for(&desired, key) {
            self.owners.insert(desired.clone(), key.to_path_buf());
            return desired;
        }
        let hash = short_hash(key);
        let mut tag = format!("__{hash}");
        let mut attempt = 1;
        loop {
            let candidate = suffixed(&desired, &tag, is_file);
            if self.is_free_for(&candidate, key) {
                tracing::debug!(desired = %desired.display(), resolved = %candidate.display(), "destination collision resolved");
                self.owners.insert(candidate.clone(), key.to_path_buf());
                return candidate;
            }
            attempt += 1;
            tag = format!("__{hash}-{attempt}");
        }
    }

    fn is_free_for(&self, physical: &Path, key: &Path) -> bool {
        self.owners.get(physical).is_none_or(|owner| owner == key)
    }
}

/// Stable short hash of a virtual path.
pub fn short_hash(virtual_path: &Path) -> String {
    let hash = blake3::hash(virtual_path.as_os_str().as_encoded_bytes());
    hash.to_hex()[..SHORT_HASH_LEN].to_string()
}

/// Insert `tag` before the extension of a file name, or append it to a
/// directory name.
pub(crate) fn suffixed(path: &Path, tag: &str, is_file: bool) -> PathBuf {
    let (stem, extension) = match (is_file, path.file_stem(), path.extension()) {
        (true, Some(stem), Some(ext)) => (stem.to_os_string(), Some(ext)),
        _ => (path.file_name().map(|n| n.to_os_string()).unwrap_or_default(), None),
    };
    let mut name = OsString::from(stem);
    name.push(tag);
    if let Some(ext) = extension {
        name.push(".");
        name.push(ext);
    }
    path.with_file_name(name)
}
