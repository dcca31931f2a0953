//! Content hashing of files and directory trees.
//!
//! A tree is summarized as a [`Checksums`] mapping from each regular file's
//! path, relative to the tree root, to the hex digest of its content. These
//! mappings are what the build executor persists and compares to decide
//! whether a step has to run again.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::error::{BuildError, Result};

/// Relative path to hex digest
pub type Checksums = BTreeMap<PathBuf, String>;

/// Computes the content digest of a single file
pub trait HashFunction: Send + Sync + fmt::Debug {
    /// Algorithm name, e.g. "sha256"
    fn name(&self) -> &'static str;

    /// Hex digest of the file's content
    fn hash_file(&self, path: &Path) -> io::Result<String>;
}

/// SHA-256 content hash
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Hash;

impl HashFunction for Sha256Hash {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn hash_file(&self, path: &Path) -> io::Result<String> {
        digest_file::<Sha256>(path)
    }
}

/// SHA-512 content hash
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha512Hash;

impl HashFunction for Sha512Hash {
    fn name(&self) -> &'static str {
        "sha512"
    }

    fn hash_file(&self, path: &Path) -> io::Result<String> {
        digest_file::<Sha512>(path)
    }
}

fn digest_file<D: Digest + io::Write>(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = D::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect())
}

/// Hash algorithm selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HashAlgorithm {
    /// Get the hash function implementing this algorithm
    pub fn function(self) -> Arc<dyn HashFunction> {
        match self {
            Self::Sha256 => Arc::new(Sha256Hash),
            Self::Sha512 => Arc::new(Sha512Hash),
        }
    }
}

/// Hash every regular file below `root`, keyed by its path relative to `root`.
pub fn hash_tree(root: &Path, hash: &dyn HashFunction) -> io::Result<Checksums> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        ));
    }

    let mut checksums = Checksums::new();
    for file in tree_files(root)? {
        let digest = hash.hash_file(&root.join(&file))?;
        trace!(file = %file.display(), digest = %digest, "hashed file");
        checksums.insert(file, digest);
    }
    debug!(root = %root.display(), files = checksums.len(), "hashed tree");
    Ok(checksums)
}

/// Relative paths of all regular files below `root`, in file name order
fn tree_files(root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        files.push(relative.to_path_buf());
    }
    Ok(files)
}

/// Check that the tree at `root` still matches a recorded mapping exactly.
///
/// The file listing is compared before any content is hashed, so a tree that
/// gained or lost files is rejected without reading it.
pub fn are_consistent(root: &Path, checksums: &Checksums, hash: &dyn HashFunction) -> io::Result<bool> {
    if !root.is_dir() {
        return Ok(false);
    }

    let files = tree_files(root)?;
    if files.len() != checksums.len() || files.iter().any(|f| !checksums.contains_key(f)) {
        debug!(root = %root.display(), "file listing differs from record");
        return Ok(false);
    }

    for (file, expected) in checksums {
        if hash.hash_file(&root.join(file))? != *expected {
            debug!(root = %root.display(), file = %file.display(), "content differs from record");
            return Ok(false);
        }
    }
    Ok(true)
}

/// Read a persisted mapping
pub fn read_checksums(file: &Path) -> Result<Checksums> {
    let content = fs::read_to_string(file)?;
    serde_json::from_str(&content).map_err(|e| BuildError::Record {
        path: file.to_path_buf(),
        message: e.to_string(),
    })
}

/// Read a persisted mapping, treating a missing file as absent
pub fn try_read_checksums(file: &Path) -> Result<Option<Checksums>> {
    match read_checksums(file) {
        Ok(checksums) => Ok(Some(checksums)),
        Err(BuildError::Io(e)) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Persist a mapping.
///
/// The record is written to a hidden sibling first and renamed into place.
pub fn write_checksums(file: &Path, checksums: &Checksums) -> Result<()> {
    let json = serde_json::to_string_pretty(checksums).map_err(|e| BuildError::Record {
        path: file.to_path_buf(),
        message: e.to_string(),
    })?;

    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staged = file.with_file_name(format!(".{}.tmp", name));
    fs::write(&staged, json)?;
    fs::rename(&staged, file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, file: &str, content: &str) {
        let path = root.join(file);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_hash_file_deterministic() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "hello");

        let first = Sha256Hash.hash_file(&temp.path().join("a.txt")).unwrap();
        let second = Sha256Hash.hash_file(&temp.path().join("a.txt")).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_hash_tree_uses_relative_paths() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "a");
        write(temp.path(), "nested/b.txt", "b");

        let checksums = hash_tree(temp.path(), &Sha256Hash).unwrap();
        let keys: Vec<_> = checksums.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![PathBuf::from("a.txt"), PathBuf::from("nested/b.txt")]
        );
    }

    #[test]
    fn test_hash_tree_rejects_missing_root() {
        let temp = TempDir::new().unwrap();
        assert!(hash_tree(&temp.path().join("missing"), &Sha256Hash).is_err());
    }

    #[test]
    fn test_algorithms_differ() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "a");
        let path = temp.path().join("a.txt");

        let sha256 = HashAlgorithm::Sha256.function().hash_file(&path).unwrap();
        let sha512 = HashAlgorithm::Sha512.function().hash_file(&path).unwrap();
        assert_eq!(sha256.len(), 64);
        assert_eq!(sha512.len(), 128);
    }

    #[test]
    fn test_consistency_detects_edits() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "a");
        let checksums = hash_tree(temp.path(), &Sha256Hash).unwrap();
        assert!(are_consistent(temp.path(), &checksums, &Sha256Hash).unwrap());

        write(temp.path(), "a.txt", "b");
        assert!(!are_consistent(temp.path(), &checksums, &Sha256Hash).unwrap());
    }

    #[test]
    fn test_consistency_detects_added_and_removed_files() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "a.txt", "a");
        let checksums = hash_tree(temp.path(), &Sha256Hash).unwrap();

        write(temp.path(), "b.txt", "b");
        assert!(!are_consistent(temp.path(), &checksums, &Sha256Hash).unwrap());

        fs::remove_file(temp.path().join("b.txt")).unwrap();
        fs::remove_file(temp.path().join("a.txt")).unwrap();
        assert!(!are_consistent(temp.path(), &checksums, &Sha256Hash).unwrap());
    }

    #[test]
    fn test_consistency_of_missing_root() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("missing");
        assert!(!are_consistent(&missing, &Checksums::new(), &Sha256Hash).unwrap());
    }

    #[test]
    fn test_write_and_read_record() {
        let temp = TempDir::new().unwrap();
        write(temp.path(), "tree/a.txt", "a");
        let checksums = hash_tree(&temp.path().join("tree"), &Sha256Hash).unwrap();

        let record = temp.path().join("checksums.source");
        write_checksums(&record, &checksums).unwrap();
        assert_eq!(read_checksums(&record).unwrap(), checksums);
        assert!(!temp.path().join(".checksums.source.tmp").exists());
    }

    #[test]
    fn test_try_read_missing_record() {
        let temp = TempDir::new().unwrap();
        assert!(try_read_checksums(&temp.path().join("checksums"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let temp = TempDir::new().unwrap();
        let record = temp.path().join("checksums");
        fs::write(&record, "not json").unwrap();
        assert!(matches!(
            try_read_checksums(&record),
            Err(BuildError::Record { .. })
        ));
    }
}
