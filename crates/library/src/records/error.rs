//! Error types for the [`records`](super) module.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A record store error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for record store operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Reading or writing the backing file failed.
    #[display("record storage failure: {}", _0.display())]
    Storage(#[error(not(source))] PathBuf),
    /// The backing file exists but does not contain valid records.
    #[display("invalid record data in {}", _0.display())]
    InvalidData(#[error(not(source))] PathBuf),
    #[display("unable to encode records")]
    Encode,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}
