use crate::candidate::OutputKind;
use crate::plan::{Action, PlanItem, SkipReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Counters over a plan's items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub archives_to_copy: u64,
    pub galleries_to_zip: u64,
    pub folders_to_copy: u64,
    /// Skips meaning the output is already in place (unchanged or a known
    /// duplicate).
    pub skipped_existing: u64,
    pub duplicates: u64,
    pub overwrites: u64,
    /// Items that mutate the filesystem on execute.
    pub planned: u64,
    pub skipped: u64,
    pub reason_counts: BTreeMap<SkipReason, u64>,
}

impl Summary {
    pub fn tally<'a>(items: impl IntoIterator<Item = &'a PlanItem>) -> Self {
        let mut summary = Self::default();
        for item in items {
            summary.count(item.output, item.action);
        }
        summary
    }

    fn count(&mut self, output: OutputKind, action: Action) {
        match (action, output) {
            (Action::Skip(reason), _) => {
                self.skipped += 1;
                *self.reason_counts.entry(reason).or_default() += 1;
                if reason.is_existing() {
                    self.skipped_existing += 1;
                }
                return;
            },
            (Action::Copy, OutputKind::Archive) => self.archives_to_copy += 1,
            (Action::Copy, _) => self.folders_to_copy += 1,
            (Action::Zip, _) => self.galleries_to_zip += 1,
            (Action::Duplicate, _) => self.duplicates += 1,
            (Action::Overwrite, _) => self.overwrites += 1,
        }
        self.planned += 1;
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} archives to copy, {} galleries to zip, {} folders to copy, {} duplicates, {} overwrites, {} skipped ({} existing)",
            self.archives_to_copy,
            self.galleries_to_zip,
            self.folders_to_copy,
            self.duplicates,
            self.overwrites,
            self.skipped,
            self.skipped_existing,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(OutputKind::Archive, Action::Copy, 1, 0, 0)]
    #[case(OutputKind::GalleryZip, Action::Zip, 0, 1, 0)]
    #[case(OutputKind::FolderCopy, Action::Copy, 0, 0, 1)]
    fn test_mutating_actions(
        #[case] output: OutputKind,
        #[case] action: Action,
        #[case] archives: u64,
        #[case] zips: u64,
        #[case] folders: u64,
    ) {
        let mut summary = Summary::default();
        summary.count(output, action);
        assert_eq!((summary.archives_to_copy, summary.galleries_to_zip, summary.folders_to_copy), (archives, zips, folders));
        assert_eq!(summary.planned, 1);
        assert_eq!(summary.skipped, 0);
    }

    #[test]
    fn test_skips_are_counted_by_reason() {
        let mut summary = Summary::default();
        summary.count(OutputKind::GalleryZip, Action::Skip(SkipReason::ExistingUnchanged));
        summary.count(OutputKind::Archive, Action::Skip(SkipReason::DuplicateSameSize));
        summary.count(OutputKind::GalleryZip, Action::Skip(SkipReason::BelowMinImages));
        summary.count(OutputKind::GalleryZip, Action::Skip(SkipReason::BelowMinImages));
        summary.count(OutputKind::Archive, Action::Duplicate);
        summary.count(OutputKind::GalleryZip, Action::Overwrite);
        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.skipped_existing, 2);
        assert_eq!(summary.reason_counts[&SkipReason::BelowMinImages], 2);
        assert_eq!((summary.duplicates, summary.overwrites, summary.planned), (1, 1, 2));
    }

    #[test]
    fn test_serializes_reason_codes() {
        let mut summary = Summary::default();
        summary.count(OutputKind::GalleryZip, Action::Skip(SkipReason::NoImages));
        let value = serde_json::to_value(&summary).unwrap();
        assert_eq!(value["reason_counts"]["SKIP_NO_IMAGES"], 1);
    }
}
