use crate::ExtensionSet;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Which outputs are produced for every gallery.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputMode {
    /// One archive per gallery.
    #[default]
    #[serde(rename = "zip")]
    #[display("zip")]
    Zip,
    /// A plain folder copy per gallery.
    #[serde(rename = "foldercopy")]
    #[display("foldercopy")]
    FolderCopy,
    /// Both an archive and a folder copy; two plan items per gallery.
    #[serde(rename = "zip+foldercopy")]
    #[display("zip+foldercopy")]
    ZipAndFolderCopy,
}
impl OutputMode {
    pub fn zip(&self) -> bool {
        matches!(self, Self::Zip | Self::ZipAndFolderCopy)
    }

    pub fn folder_copy(&self) -> bool {
        matches!(self, Self::FolderCopy | Self::ZipAndFolderCopy)
    }
}

/// Where a conflicting output goes when it cannot be placed directly.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Mirror the item under the duplicates root.
    #[default]
    #[display("sink")]
    Sink,
    /// Place the item beside the occupied destination with a timestamp suffix.
    #[display("rename")]
    Rename,
}

/// Archive extension used when zipping galleries.
#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GalleryExtension {
    #[default]
    #[display("zip")]
    Zip,
    #[display("cbz")]
    Cbz,
}
impl GalleryExtension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::Cbz => "cbz",
        }
    }
}

/// Planner and materializer behaviour.
///
/// Every field has a default, so a configuration file only needs to mention
/// the options it changes. Aliases accept the option names used by earlier
/// releases of the settings screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Refresh existing gallery outputs whose source signature changed.
    pub update_gallery_zips: bool,
    /// Only the deepest qualifying directories become galleries.
    pub leaf_only: bool,
    /// Count (and collect) images in the whole subtree of a directory.
    #[serde(alias = "consider_images_in_subfolders")]
    pub count_recursive: bool,
    /// Minimum number of images for a directory to be materialized.
    #[serde(alias = "min_images_to_be_gallery")]
    pub min_images: u32,
    pub output_mode: OutputMode,
    /// Put every archive directly under the output root.
    pub lanraragi_flatten: bool,
    pub archive_extension_for_galleries: GalleryExtension,
    pub image_extensions: ExtensionSet,
    pub archive_extensions: ExtensionSet,
    pub duplicate_policy: DuplicatePolicy,
    /// Mirror the complete source nesting. When disabled only the top-level
    /// folder and the item name are kept.
    pub replicate_nesting: bool,
    /// Folder copies also carry text/metadata sidecar files.
    pub copy_sidecars: bool,
    /// Try a hard link before copying archive bytes.
    pub use_hardlinks: bool,
    /// Data-root relative paths that are never planned.
    pub exclusions: Vec<PathBuf>,
    pub auto_scan_enabled: bool,
    pub auto_scan_interval_minutes: u32,
    pub debug_logging: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            update_gallery_zips: false,
            leaf_only: true,
            count_recursive: false,
            min_images: 3,
            output_mode: OutputMode::Zip,
            lanraragi_flatten: false,
            archive_extension_for_galleries: GalleryExtension::Zip,
            image_extensions: ExtensionSet::new(["jpg", "jpeg", "png", "webp", "gif", "bmp", "jfif"]),
            archive_extensions: ExtensionSet::new(["zip", "cbz"]),
            duplicate_policy: DuplicatePolicy::Sink,
            replicate_nesting: true,
            copy_sidecars: false,
            use_hardlinks: false,
            exclusions: Vec::new(),
            auto_scan_enabled: true,
            auto_scan_interval_minutes: 30,
            debug_logging: false,
        }
    }
}
