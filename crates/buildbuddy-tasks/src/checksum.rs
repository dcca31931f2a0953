//! Change detection between two snapshots of a dependency's tree

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use buildbuddy_core::hash::Checksums;

/// How a dependency's files changed since a dependent step last saw them.
///
/// Every path of either snapshot lands in exactly one partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumStatus {
    /// Paths not present in the previous snapshot
    pub added: BTreeSet<PathBuf>,
    /// Paths present in both snapshots with different digests
    pub changed: BTreeSet<PathBuf>,
    /// Paths present only in the previous snapshot
    pub removed: BTreeSet<PathBuf>,
    /// Paths present in both snapshots with equal digests
    pub unchanged: BTreeSet<PathBuf>,
}

impl ChecksumStatus {
    /// Compare a previous snapshot against the current one
    pub fn diff(previous: &Checksums, current: &Checksums) -> Self {
        let mut status = Self::default();

        for (path, digest) in current {
            match previous.get(path) {
                Some(before) if before == digest => {
                    status.unchanged.insert(path.clone());
                }
                Some(_) => {
                    status.changed.insert(path.clone());
                }
                None => {
                    status.added.insert(path.clone());
                }
            }
        }

        status.removed = previous
            .keys()
            .filter(|p| !current.contains_key(*p))
            .cloned()
            .collect();

        status
    }

    /// Treat every path as new
    pub fn added<'a>(paths: impl IntoIterator<Item = &'a PathBuf>) -> Self {
        Self {
            added: paths.into_iter().cloned().collect(),
            ..Self::default()
        }
    }

    /// Whether anything was added, changed or removed
    pub fn is_changed(&self) -> bool {
        !self.added.is_empty() || !self.changed.is_empty() || !self.removed.is_empty()
    }

    /// Paths whose current content has not been seen before (added or changed)
    pub fn touched(&self) -> impl Iterator<Item = &Path> {
        self.added
            .iter()
            .chain(self.changed.iter())
            .map(PathBuf::as_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checksums(entries: &[(&str, &str)]) -> Checksums {
        entries
            .iter()
            .map(|(p, d)| (PathBuf::from(p), d.to_string()))
            .collect()
    }

    #[test]
    fn test_diff_partitions_paths() {
        let previous = checksums(&[("same", "1"), ("edited", "1"), ("gone", "1")]);
        let current = checksums(&[("same", "1"), ("edited", "2"), ("new", "1")]);

        let status = ChecksumStatus::diff(&previous, &current);
        assert!(status.added.contains(Path::new("new")));
        assert!(status.changed.contains(Path::new("edited")));
        assert!(status.removed.contains(Path::new("gone")));
        assert!(status.unchanged.contains(Path::new("same")));
        assert!(status.is_changed());

        let touched: Vec<_> = status.touched().collect();
        assert_eq!(touched, vec![Path::new("new"), Path::new("edited")]);
    }

    #[test]
    fn test_diff_identical_is_unchanged() {
        let snapshot = checksums(&[("a", "1"), ("b", "2")]);
        let status = ChecksumStatus::diff(&snapshot, &snapshot);
        assert!(!status.is_changed());
        assert_eq!(status.unchanged.len(), 2);
    }

    #[test]
    fn test_removal_alone_is_a_change() {
        let status = ChecksumStatus::diff(&checksums(&[("a", "1")]), &Checksums::new());
        assert!(status.is_changed());
        assert_eq!(status.touched().count(), 0);
    }

    #[test]
    fn test_added_marks_everything() {
        let snapshot = checksums(&[("a", "1"), ("b", "2")]);
        let status = ChecksumStatus::added(snapshot.keys());
        assert_eq!(status.added.len(), 2);
        assert!(status.is_changed());
    }

    #[test]
    fn test_added_of_empty_tree_is_unchanged() {
        let status = ChecksumStatus::added(Checksums::new().keys());
        assert!(!status.is_changed());
    }
}
