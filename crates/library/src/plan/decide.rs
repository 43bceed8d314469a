//! The per-output decision policy.
//!
//! [`decide`] is a pure function of the facts gathered by the planner, so the
//! same candidate, prior record and destination state always produce the same
//! [`Action`]. Rules are checked in a fixed order and the first match wins.

use crate::candidate::{Candidate, CandidateKind, OutputKind};
use crate::records::ArchiveRecord;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SkipReason {
    /// Gallery with no images left after filtering.
    #[display("SKIP_NO_IMAGES")]
    #[serde(rename = "SKIP_NO_IMAGES")]
    NoImages,
    #[display("SKIP_BELOW_MIN_IMAGES")]
    #[serde(rename = "SKIP_BELOW_MIN_IMAGES")]
    BelowMinImages,
    /// Destination was placed by a previous run from an identical source.
    #[display("SKIP_EXISTING_UNCHANGED")]
    #[serde(rename = "SKIP_EXISTING_UNCHANGED")]
    ExistingUnchanged,
    /// A previous run already routed this exact source to a duplicate location.
    #[display("SKIP_DUPLICATE_SAME_SIGNATURE")]
    #[serde(rename = "SKIP_DUPLICATE_SAME_SIGNATURE")]
    DuplicateSameSignature,
    /// Unknown destination file with the exact size of the source archive.
    #[display("SKIP_DUPLICATE_SAME_SIZE")]
    #[serde(rename = "SKIP_DUPLICATE_SAME_SIZE")]
    DuplicateSameSize,
    #[display("SKIP_OUTPUT_CONFLICT")]
    #[serde(rename = "SKIP_OUTPUT_CONFLICT")]
    OutputConflict,
    /// The candidate could not be read while scanning.
    #[display("SKIP_UNREADABLE")]
    #[serde(rename = "SKIP_UNREADABLE")]
    Unreadable,
}

impl SkipReason {
    /// Skips that mean the output is already in place.
    pub fn is_existing(&self) -> bool {
        matches!(self, Self::ExistingUnchanged | Self::DuplicateSameSignature | Self::DuplicateSameSize)
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[display("COPY")]
    Copy,
    #[display("ZIP")]
    Zip,
    #[display("{_0}")]
    Skip(SkipReason),
    /// Place the output at an alternate location instead of the destination.
    #[display("DUPLICATE")]
    Duplicate,
    #[display("OVERWRITE")]
    Overwrite,
}

impl Action {
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Self::Skip(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// How existing gallery outputs are treated. Standalone archives are never
/// overwritten, whatever the policy.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Existing outputs are left alone.
    #[default]
    #[display("keep")]
    Keep,
    /// Outputs whose source changed are rewritten.
    #[display("refresh")]
    Refresh,
    /// Outputs are rewritten even when their source is unchanged.
    #[display("force")]
    Force,
}

impl UpdatePolicy {
    pub fn new(update_gallery_zips: bool, force: bool) -> Self {
        match (force, update_gallery_zips) {
            (true, _) => Self::Force,
            (false, true) => Self::Refresh,
            (false, false) => Self::Keep,
        }
    }

    fn allows_overwrite(&self) -> bool {
        !matches!(self, Self::Keep)
    }
}

/// What currently occupies a destination path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Missing,
    File { size: u64 },
    Directory,
}

impl DestinationState {
    /// Inspect `path` without following symbolic links. Anything that cannot
    /// be inspected counts as occupied by a file, so it is never written over
    /// blindly.
    pub async fn inspect(path: &Path) -> Self {
        match fs::symlink_metadata(path).await {
            Ok(metadata) if metadata.is_dir() => Self::Directory,
            Ok(metadata) => Self::File { size: metadata.len() },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::Missing,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unable to inspect destination");
                Self::File { size: 0 }
            },
        }
    }

    pub fn exists(&self) -> bool {
        !matches!(self, Self::Missing)
    }

    /// Whether the existing entry has the shape `output` would produce.
    fn fits(&self, output: OutputKind) -> bool {
        match self {
            Self::Missing => true,
            Self::File { .. } => output.is_file(),
            Self::Directory => !output.is_file(),
        }
    }
}

/// Everything [`decide`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct Facts<'a> {
    pub candidate: &'a Candidate,
    pub output: OutputKind,
    pub destination: &'a Path,
    pub state: DestinationState,
    pub prior: Option<&'a ArchiveRecord>,
    /// The prior record's output still exists on disk.
    pub prior_output_exists: bool,
    /// Another source already claimed the same destination in this run.
    pub contested: bool,
    pub min_images: u32,
    pub policy: UpdatePolicy,
}

/// The image-count rules, which do not depend on any destination.
pub fn threshold(candidate: &Candidate, min_images: u32) -> Option<SkipReason> {
    if candidate.kind != CandidateKind::Gallery {
        return None;
    }
    if candidate.files.is_empty() {
        return Some(SkipReason::NoImages);
    }
    (candidate.image_count() < min_images as usize).then_some(SkipReason::BelowMinImages)
}

pub fn decide(facts: &Facts<'_>) -> Action {
    let Facts { candidate, output, destination, state, prior, .. } = *facts;
    // A record left by another source says nothing about this candidate.
    let prior = prior.filter(|p| p.source_path == candidate.path);

    if let Some(reason) = threshold(candidate, facts.min_images) {
        return Action::Skip(reason);
    }

    let same_source = prior.is_some_and(|p| p.source_signature == candidate.signature);
    let placed_here = prior.is_some_and(|p| p.output_path == destination && p.last_action != Action::Duplicate);
    if state.exists() && state.fits(output) && placed_here && !facts.contested {
        let forced = facts.policy == UpdatePolicy::Force && output.is_gallery();
        if same_source && !forced {
            return Action::Skip(SkipReason::ExistingUnchanged);
        }
    }
    if prior.is_some_and(|p| p.last_action == Action::Duplicate) && facts.prior_output_exists && same_source {
        return Action::Skip(SkipReason::DuplicateSameSignature);
    }
    if let DestinationState::File { size } = state
        && output == OutputKind::Archive
        && prior.is_none()
        && !facts.contested
        && size == candidate.signature.total_bytes
    {
        return Action::Skip(SkipReason::DuplicateSameSize);
    }

    if state.exists() || facts.contested {
        if !state.fits(output) {
            return Action::Skip(SkipReason::OutputConflict);
        }
        if output.is_gallery() && facts.policy.allows_overwrite() && placed_here && !facts.contested {
            return Action::Overwrite;
        }
        if output == OutputKind::FolderCopy {
            return Action::Skip(SkipReason::OutputConflict);
        }
        return Action::Duplicate;
    }

    match output {
        OutputKind::GalleryZip => Action::Zip,
        OutputKind::Archive | OutputKind::FolderCopy => Action::Copy,
    }
}
