//! Library Error Types
//!
//! Top-level errors for the public entry points of this crate. Each module
//! raises its own, more detailed error kinds; the entry points wrap them into
//! one of these so callers can tell which stage of a run failed.

use derive_more::{Display, Error};

/// A library error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for library operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The run was aborted before any mutation.
    #[display("configuration error")]
    Config,
    #[display("scan failed")]
    Scan,
    #[display("planning failed")]
    Plan,
    #[display("materialization failed")]
    Materialize,
    #[display("record store failure")]
    Records,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Config)
    }
}
