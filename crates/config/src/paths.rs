use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Filesystem roots the pipeline reads from and writes to.
///
/// Sources are resolved below `data_root`, which is never written. Every
/// mutation lands below `output_root`, `duplicates_root` or `tmp_root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Paths {
    pub data_root: PathBuf,
    pub output_root: PathBuf,
    pub config_root: PathBuf,
    pub duplicates_root: PathBuf,
    pub tmp_root: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/data"),
            output_root: PathBuf::from("/output"),
            config_root: PathBuf::from("/config"),
            duplicates_root: PathBuf::from("/duplicates"),
            tmp_root: PathBuf::from("/config/tmp"),
        }
    }
}

impl Paths {
    /// Build a set of roots nested below a single base directory. Mostly
    /// useful for tests and scratch setups.
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            data_root: base.join("data"),
            output_root: base.join("output"),
            config_root: base.join("config"),
            duplicates_root: base.join("duplicates"),
            tmp_root: base.join("config").join("tmp"),
        }
    }

    /// Roots written by the pipeline. The classifier never descends into them.
    pub fn managed_roots(&self) -> [&Path; 3] {
        [&self.output_root, &self.duplicates_root, &self.tmp_root]
    }

    /// Location of the JSON record store.
    pub fn records_file(&self) -> PathBuf {
        self.config_root.join("records.json")
    }

    /// Location of the activity journal.
    pub fn activity_file(&self) -> PathBuf {
        self.config_root.join("activity.jsonl")
    }

    pub(crate) fn all(&self) -> [(&'static str, &Path); 5] {
        [
            ("data_root", &self.data_root),
            ("output_root", &self.output_root),
            ("config_root", &self.config_root),
            ("duplicates_root", &self.duplicates_root),
            ("tmp_root", &self.tmp_root),
        ]
    }
}
