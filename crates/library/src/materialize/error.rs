//! Error types for the [`materialize`](super) module.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A materialization error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for materialization operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Apart from [`Sweep`](Self::Sweep) and [`Flush`](Self::Flush), every kind
/// describes the failure of a single item and never stops a run.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Leftovers of an earlier crash could not be removed.
    #[display("unable to sweep temporary artifacts")]
    Sweep,
    /// No temporary file or directory could be created for the output.
    #[display("unable to stage output for {}", _0.display())]
    Stage(#[error(not(source))] PathBuf),
    #[display("unable to zip {}", _0.display())]
    Zip(#[error(not(source))] PathBuf),
    /// A source file could not be copied into the staged output.
    #[display("unable to copy {}", _0.display())]
    Copy(#[error(not(source))] PathBuf),
    /// The staged output could not be moved into place.
    #[display("unable to place output at {}", _0.display())]
    Place(#[error(not(source))] PathBuf),
    #[display("unable to fingerprint output at {}", _0.display())]
    Fingerprint(#[error(not(source))] PathBuf),
    #[display("unable to record output at {}", _0.display())]
    Record(#[error(not(source))] PathBuf),
    /// Records could not be persisted at the end of a run.
    #[display("unable to persist records")]
    Flush,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        true
    }
}
