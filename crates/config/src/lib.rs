//! Configuration loading and validation.
//!
//! Values are layered with [`figment`]: built-in defaults, then an optional
//! configuration file (TOML, YAML or JSON, picked by extension), then
//! environment variables prefixed with `GLOOM_`. Nested keys are separated by
//! a double underscore, so `GLOOM_SETTINGS__MIN_IMAGES=5` sets
//! `settings.min_images`.
//!
//! ```
//! use figment::{Figment, providers::{Format, Serialized, Toml}};
//! use gloom_config::{Config, OutputMode};
//!
//! let figment = Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(
//!     r#"
//!     [settings]
//!     output_mode = "zip+foldercopy"
//!     "#,
//! ));
//! let config = Config::from_figment(figment).unwrap();
//! assert_eq!(config.settings.output_mode, OutputMode::ZipAndFolderCopy);
//! ```

pub mod error;
mod extensions;
mod paths;
mod settings;
mod source;

pub use crate::extensions::ExtensionSet;
pub use crate::paths::Paths;
pub use crate::settings::{DuplicatePolicy, GalleryExtension, OutputMode, Settings};
pub use crate::source::{ScanMode, Source};
use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Environment variable prefix for every configuration key.
pub const ENV_PREFIX: &str = "GLOOM_";

/// A fully loaded configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: Paths,
    pub settings: Settings,
    pub sources: Vec<Source>,
}

impl Config {
    /// Load, validate and normalize the layered configuration.
    ///
    /// When `path` is `None` the file at [`default_path()`](Self::default_path)
    /// is used if it exists. An explicitly provided file must exist.
    #[tracing::instrument(level = "debug")]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) if !p.is_file() => {
                exn::bail!(ErrorKind::Invalid(format!("configuration file {} does not exist", p.display())))
            },
            Some(p) => Some(p.to_path_buf()),
            None => Self::default_path().filter(|p| p.is_file()),
        };
        match &path {
            Some(p) => tracing::debug!(path = %p.display(), "loading configuration file"),
            None => tracing::debug!("no configuration file found, using defaults and environment"),
        }
        Self::from_figment(Self::figment(path.as_deref()))
    }

    /// The provider stack used by [`load()`](Self::load).
    pub fn figment(path: Option<&Path>) -> Figment {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = path {
            figment = match path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase).as_deref() {
                Some("yaml" | "yml") => figment.merge(Yaml::file(path)),
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }
        figment.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Extract a configuration from an arbitrary provider stack, then validate
    /// and normalize it.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Self = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validated()
    }

    /// Default configuration file location for the current user.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "gloom").map(|dirs| dirs.config_dir().join("gloom.toml"))
    }

    /// Enabled sources in ascending id order.
    pub fn enabled_sources(&self) -> Vec<&Source> {
        let mut sources: Vec<&Source> = self.sources.iter().filter(|s| s.enabled).collect();
        sources.sort_by_key(|s| s.id);
        sources
    }

    /// Absolute location of a source on disk.
    pub fn source_root(&self, source: &Source) -> PathBuf {
        self.paths.data_root.join(&source.path)
    }

    fn validated(mut self) -> Result<Self> {
        for (name, root) in self.paths.all() {
            if !root.is_absolute() {
                exn::bail!(ErrorKind::Invalid(format!("{name} must be an absolute path, got {}", root.display())));
            }
        }
        if self.settings.min_images < 1 {
            exn::bail!(ErrorKind::Invalid("min_images must be at least 1".into()));
        }
        if self.settings.auto_scan_interval_minutes < 1 {
            exn::bail!(ErrorKind::Invalid("auto_scan_interval_minutes must be at least 1".into()));
        }
        if self.settings.image_extensions.is_empty() {
            exn::bail!(ErrorKind::Invalid("image_extensions must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for source in &mut self.sources {
            if !seen.insert(source.id) {
                exn::bail!(ErrorKind::Invalid(format!("duplicate source id {}", source.id)));
            }
            source.path = data_relative(&self.paths.data_root, &source.path)
                .or_raise(|| ErrorKind::Invalid(format!("source {} has an invalid path", source.id)))?;
        }
        self.settings.exclusions = self
            .settings
            .exclusions
            .iter()
            .map(|p| data_relative(&self.paths.data_root, p))
            .collect::<Result<_>>()?;
        Ok(self)
    }
}

/// Normalize a path so it is relative to the data root and never escapes it.
/// Absolute paths are accepted only when they already live below the data root.
fn data_relative(data_root: &Path, path: &Path) -> Result<PathBuf> {
    let relative = match path.is_absolute() {
        true => path.strip_prefix(data_root).or_raise(|| {
            ErrorKind::Invalid(format!("{} is outside of {}", path.display(), data_root.display()))
        })?,
        false => path,
    };
    gloom_storage::validate_path(relative)
        .or_raise(|| ErrorKind::Invalid(format!("{} is not a valid data path", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn from_toml(toml: &str) -> Result<Config> {
        Config::from_figment(Figment::from(Serialized::defaults(Config::default())).merge(Toml::string(toml)))
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("").unwrap();
        assert_eq!(config.paths.data_root, Path::new("/data"));
        assert_eq!(config.paths.tmp_root, Path::new("/config/tmp"));
        assert_eq!(config.settings.min_images, 3);
        assert!(config.settings.leaf_only);
        assert!(!config.settings.count_recursive);
        assert_eq!(config.settings.output_mode, OutputMode::Zip);
        assert_eq!(config.settings.duplicate_policy, DuplicatePolicy::Sink);
        assert!(config.settings.image_extensions.contains("jfif"));
        assert!(config.settings.archive_extensions.contains("cbz"));
        assert_eq!(config.settings.auto_scan_interval_minutes, 30);
    }

    #[test]
    fn test_settings_and_sources() {
        let config = from_toml(
            r#"
            [settings]
            min_images_to_be_gallery = 5
            consider_images_in_subfolders = true
            output_mode = "foldercopy"
            duplicate_policy = "rename"
            archive_extension_for_galleries = "cbz"
            image_extensions = [".PNG", "jpg", "jpg"]

            [[sources]]
            id = 2
            name = "Comics"
            path = "Comics/"
            scan_mode = "archives_only"

            [[sources]]
            id = 1
            name = "Manga"
            path = "/data/Manga"

            [[sources]]
            id = 3
            name = "Old"
            path = "Old"
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.settings.min_images, 5);
        assert!(config.settings.count_recursive);
        assert_eq!(config.settings.output_mode, OutputMode::FolderCopy);
        assert_eq!(config.settings.duplicate_policy, DuplicatePolicy::Rename);
        assert_eq!(config.settings.archive_extension_for_galleries, GalleryExtension::Cbz);
        assert_eq!(config.settings.image_extensions.len(), 2);

        let enabled = config.enabled_sources();
        assert_eq!(enabled.iter().map(|s| s.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(enabled[0].path, Path::new("Manga"));
        assert_eq!(enabled[1].path, Path::new("Comics"));
        assert_eq!(enabled[1].scan_mode, ScanMode::ArchivesOnly);
        assert_eq!(config.source_root(enabled[0]), Path::new("/data/Manga"));
    }

    #[rstest]
    #[case("[settings]\nmin_images = 0")]
    #[case("[settings]\nauto_scan_interval_minutes = 0")]
    #[case("[settings]\nimage_extensions = []")]
    #[case("[paths]\noutput_root = \"relative/output\"")]
    #[case("[[sources]]\nid = 1\nname = \"a\"\npath = \"A\"\n[[sources]]\nid = 1\nname = \"b\"\npath = \"B\"")]
    #[case("[[sources]]\nid = 1\nname = \"escape\"\npath = \"../etc\"")]
    #[case("[[sources]]\nid = 1\nname = \"outside\"\npath = \"/elsewhere/Manga\"")]
    #[case("[settings]\nexclusions = [\"../secret\"]")]
    fn test_invalid(#[case] toml: &str) {
        let err = from_toml(toml).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)), "unexpected error: {err:?}");
    }

    #[test]
    fn test_unknown_output_mode_fails_to_load() {
        let err = from_toml("[settings]\noutput_mode = \"tarball\"").unwrap_err();
        assert_eq!(*err, ErrorKind::Load);
    }

    #[test]
    fn test_exclusions_are_normalized() {
        let config = from_toml("[settings]\nexclusions = [\"/data/Manga/Raw\", \"Comics/./Scans/\"]").unwrap();
        assert_eq!(config.settings.exclusions, vec![PathBuf::from("Manga/Raw"), PathBuf::from("Comics/Scans")]);
    }

    #[rstest]
    #[case("gloom.toml", "[settings]\nmin_images = 7\n")]
    #[case("gloom.yaml", "settings:\n  min_images: 7\n")]
    #[case("gloom.json", "{\"settings\": {\"min_images\": 7}}")]
    fn test_load_file_by_extension(#[case] name: &str, #[case] contents: &str) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(name);
        std::fs::File::create(&path).unwrap().write_all(contents.as_bytes()).unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.settings.min_images, 7);
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("missing.toml"))).unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(_)));
    }
}
