//! Error types for the [`plan`](super) module.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A planning error with automatic location tracking via [`exn::Exn`].
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for planning operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Planning only fails as a whole for problems that make every decision
/// meaningless. Per-candidate problems end up as skipped plan items instead.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// An enabled source root is missing or is not a directory.
    #[display("source root is missing or unreadable: {}", _0.display())]
    SourceMissing(#[error(not(source))] PathBuf),
    /// Prior records could not be loaded.
    #[display("unable to load prior records")]
    Records,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Records)
    }

    /// Whether the error comes from the configuration rather than from the
    /// environment.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::SourceMissing(_))
    }
}
