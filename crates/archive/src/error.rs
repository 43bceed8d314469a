//! Archive Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// An archive error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for archive operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// A source file could not be read (it may have vanished since it was listed).
    #[display("unable to read source file: {}", _0.display())]
    Source(#[error(not(source))] PathBuf),
    /// A file name cannot be represented inside a zip archive.
    #[display("unsupported entry name: {}", _0.display())]
    EntryName(#[error(not(source))] PathBuf),
    /// Writing the archive itself failed.
    #[display("unable to write archive")]
    Write,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Source(_) | Self::Write)
    }
}
