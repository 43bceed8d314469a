use derive_more::Display;
use gloom_storage::Signature;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    #[display("gallery")]
    Gallery,
    #[display("archive")]
    Archive,
}

/// Something found in a source tree that may be materialized.
///
/// Owned by the run that discovered it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub source_id: u32,
    /// Absolute location on disk.
    pub path: PathBuf,
    /// Location relative to the data root.
    pub relative: PathBuf,
    pub signature: Signature,
    /// Qualifying images for a gallery, the file itself for an archive.
    pub files: Vec<PathBuf>,
    pub sidecars: Vec<PathBuf>,
    /// The directory has no subdirectories. Always `true` for archives.
    pub leaf: bool,
}

impl Candidate {
    pub fn image_count(&self) -> usize {
        match self.kind {
            CandidateKind::Gallery => self.files.len(),
            CandidateKind::Archive => 0,
        }
    }

    /// Stand-in for something that could not be read; carries no contents.
    pub(crate) fn unreadable(kind: CandidateKind, source_id: u32, path: PathBuf, relative: PathBuf) -> Self {
        Self {
            kind,
            source_id,
            path,
            relative,
            signature: Signature::default(),
            files: Vec::new(),
            sidecars: Vec::new(),
            leaf: true,
        }
    }
}

/// What gets produced from a candidate.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// A standalone archive copied as-is.
    #[display("archive")]
    Archive,
    /// A gallery zipped into a single file.
    #[display("gallery_zip")]
    GalleryZip,
    /// A gallery copied as a plain folder.
    #[display("folder_copy")]
    FolderCopy,
}

impl OutputKind {
    /// Whether the output is a single file (as opposed to a directory).
    pub fn is_file(&self) -> bool {
        !matches!(self, Self::FolderCopy)
    }

    pub fn is_gallery(&self) -> bool {
        !matches!(self, Self::Archive)
    }
}
