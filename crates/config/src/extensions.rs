use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

/// A normalized set of file extensions.
///
/// Extensions are stored lowercased and without a leading dot, so `".JPG"`,
/// `"jpg"` and `" Jpg "` all collapse to the same entry. Blank entries are
/// dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct ExtensionSet(BTreeSet<String>);

impl ExtensionSet {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(extensions.into_iter().filter_map(|ext| Self::normalize(ext.as_ref())).collect())
    }

    fn normalize(ext: &str) -> Option<String> {
        let clean = ext.trim().trim_start_matches('.').to_lowercase();
        (!clean.is_empty()).then_some(clean)
    }

    /// Whether the extension of `path` is a member of this set.
    #[must_use]
    pub fn matches(&self, path: impl AsRef<Path>) -> bool {
        path.as_ref()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.0.contains(&ext.to_lowercase()))
    }

    pub fn contains(&self, ext: &str) -> bool {
        Self::normalize(ext).is_some_and(|ext| self.0.contains(&ext))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl From<Vec<String>> for ExtensionSet {
    fn from(value: Vec<String>) -> Self {
        Self::new(value)
    }
}

impl From<ExtensionSet> for Vec<String> {
    fn from(value: ExtensionSet) -> Self {
        value.0.into_iter().collect()
    }
}

impl<'a> FromIterator<&'a str> for ExtensionSet {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        Self::new(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_normalizes_and_deduplicates() {
        let set = ExtensionSet::new([".JPG", "jpg", " png ", "", "."]);
        assert_eq!(set.len(), 2);
        assert!(set.contains("jpg"));
        assert!(set.contains(".PNG"));
    }

    #[rstest]
    #[case("Chapter1/001.JPG", true)]
    #[case("Chapter1/002.jpeg", false)]
    #[case("Chapter1/notes", false)]
    #[case("Chapter1/.jpg", false)]
    fn test_matches_path(#[case] path: &str, #[case] expected: bool) {
        let set: ExtensionSet = ["jpg", "png"].into_iter().collect();
        assert_eq!(set.matches(path), expected);
    }
}
