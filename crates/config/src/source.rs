use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which candidate kinds a source contributes.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    #[default]
    #[display("both")]
    Both,
    #[display("archives_only")]
    ArchivesOnly,
    #[display("folders_only")]
    FoldersOnly,
}
impl ScanMode {
    pub fn archives(&self) -> bool {
        !matches!(self, Self::FoldersOnly)
    }

    pub fn folders(&self) -> bool {
        !matches!(self, Self::ArchivesOnly)
    }
}

/// A configured input tree, relative to the data root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub id: u32,
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default)]
    pub scan_mode: ScanMode,
}

fn enabled_by_default() -> bool {
    true
}

impl Source {
    pub fn new(id: u32, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            path: path.into(),
            enabled: true,
            scan_mode: ScanMode::Both,
        }
    }

    pub fn with_scan_mode(mut self, scan_mode: ScanMode) -> Self {
        self.scan_mode = scan_mode;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
