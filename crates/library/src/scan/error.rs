//! Error types for the [`scan`](super) module.

use crate::candidate::CandidateKind;
use derive_more::{Display, Error};
use std::path::PathBuf;

/// A scan error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for scan operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Scan errors never abort a walk; each one stands for a single candidate (or
/// directory) that had to be dropped.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A directory could not be listed, or a file vanished or could not be
    /// inspected while it was being fingerprinted.
    #[display("unable to read {kind} at {}", path.display())]
    Unreadable { kind: CandidateKind, path: PathBuf },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        true
    }
}
