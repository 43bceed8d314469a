//! The scan → plan → materialize pipeline.
//!
//! - [`scan`] classifies source trees into [`Candidate`]s.
//! - [`plan`] decides what happens to each of them, without side effects.
//! - [`materialize`] carries out a plan with crash-safe placement.
//! - [`orchestrator`] runs the whole thing, one run at a time.

pub mod candidate;
pub mod diff;
pub mod error;
pub mod materialize;
pub mod orchestrator;
pub mod plan;
pub mod records;
pub mod resolve;
pub mod scan;

pub use crate::candidate::{Candidate, CandidateKind, OutputKind};
use crate::records::RecordHandle;
use gloom_config::Config;
use gloom_storage::Staging;
use std::sync::Arc;

/// Everything a run needs: a validated configuration, where to stage
/// outputs and where to keep records.
#[derive(Clone)]
pub struct Context {
    pub config: Arc<Config>,
    pub staging: Staging,
    pub records: RecordHandle,
}

impl Context {
    /// Context staging on the local filesystem below the configured temp root.
    pub fn new(config: Config, records: RecordHandle) -> Self {
        let staging = Staging::local(&config.paths.tmp_root);
        Self { config: Arc::new(config), staging, records }
    }

    pub fn with_staging(mut self, staging: Staging) -> Self {
        self.staging = staging;
        self
    }
}
