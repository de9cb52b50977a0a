//! A manual: a named directory of `.md`/`.json` documents, and its content
//! fingerprint.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use crate::error::{SearchCoreError, SearchResult};

/// A single named manual, rooted at a directory on disk.
#[derive(Debug, Clone)]
pub struct Manual {
    pub id: String,
    pub root: PathBuf,
}

/// The reserved manual id that can never be used as an actual manual: it is the
/// root under which all manuals live, and addressing it directly is always an
/// `invalid_parameter` error (SPEC_FULL.md §8, invariant 5).
pub const RESERVED_ROOT_MANUAL_ID: &str = "manuals";

impl Manual {
    pub fn new(id: impl Into<String>, root: impl Into<PathBuf>) -> SearchResult<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(SearchCoreError::InvalidParameter("manual_id must not be empty".into()));
        }
        if id == RESERVED_ROOT_MANUAL_ID {
            return Err(SearchCoreError::InvalidParameter(format!(
                "manual_id {RESERVED_ROOT_MANUAL_ID:?} is reserved"
            )));
        }
        Ok(Self { id, root: root.into() })
    }

    /// Every indexable file under this manual's root: `.md` and `.json` files,
    /// walked deterministically (sorted by path) so fingerprinting and node
    /// enumeration are both order-stable across runs.
    pub fn indexable_files(&self) -> SearchResult<Vec<PathBuf>> {
        if !self.root.is_dir() {
            return Err(SearchCoreError::InvalidPath(format!(
                "manual root {} is not a directory",
                self.root.display()
            )));
        }
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| is_indexable(entry.path()))
            .map(|entry| entry.path().to_path_buf())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Stable content fingerprint: a SHA-256 over the sorted
    /// `(relative_path, size, modified_unix_nanos)` tuples of every indexable
    /// file. Changes iff any indexable file's path set, size, or mtime changes.
    pub fn fingerprint(&self) -> SearchResult<String> {
        let files = self.indexable_files()?;
        let mut hasher = Sha256::new();
        for path in files {
            let meta = std::fs::metadata(&path)?;
            let rel = path.strip_prefix(&self.root).unwrap_or(&path);
            let modified_nanos = meta
                .modified()
                .ok()
                .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            hasher.update(rel.to_string_lossy().as_bytes());
            hasher.update(b"\0");
            hasher.update(meta.len().to_le_bytes());
            hasher.update(modified_nanos.to_le_bytes());
            hasher.update(b"\n");
        }
        Ok(hex::encode(hasher.finalize()))
    }
}

fn is_indexable(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("md") | Some("json")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reserved_root_id_is_rejected() {
        let err = Manual::new(RESERVED_ROOT_MANUAL_ID, "/tmp").unwrap_err();
        assert_eq!(err.code(), "invalid_parameter");
    }

    #[test]
    fn empty_id_is_rejected() {
        let err = Manual::new("", "/tmp").unwrap_err();
        assert_eq!(err.code(), "invalid_parameter");
    }

    #[test]
    fn fingerprint_changes_when_a_file_changes() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.md");
        std::fs::write(&file_path, "# Hello\nworld").unwrap();
        let manual = Manual::new("m", dir.path()).unwrap();
        let fp1 = manual.fingerprint().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut f = std::fs::OpenOptions::new().append(true).open(&file_path).unwrap();
        writeln!(f, "more text").unwrap();
        drop(f);

        let fp2 = manual.fingerprint().unwrap();
        assert_ne!(fp1, fp2);
    }

    #[test]
    fn fingerprint_ignores_non_indexable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "# Hello").unwrap();
        let manual = Manual::new("m", dir.path()).unwrap();
        let fp1 = manual.fingerprint().unwrap();

        std::fs::write(dir.path().join("notes.txt"), "irrelevant").unwrap();
        let fp2 = manual.fingerprint().unwrap();
        assert_eq!(fp1, fp2);
    }
}
