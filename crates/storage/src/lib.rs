pub mod error;
mod fs;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
mod path;
mod signature;
mod staging;
mod sweep;

pub use crate::fs::{Filesystem, FilesystemHandle, LocalFilesystem};
pub use crate::path::{is_within, resolve_within, validate as validate_path};
pub use crate::signature::{Signature, fingerprint, fingerprint_file, fingerprint_files, fingerprint_tree};
pub use crate::staging::{ARTIFACT_PREFIX, Placement, StagedDir, StagedFile, Staging, copy_preserving, copy_tree};
pub use crate::sweep::sweep;
