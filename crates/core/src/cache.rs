use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;

use crate::metadata::FileMetadata;

/// What a cached record was true of. A write moves mtime/size, so a stale
/// entry misses on its next lookup even if the caller forgot to invalidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: SystemTime,
    size: u64,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let stat = fs::metadata(path).ok()?;
        Some(Self {
            mtime: stat.modified().ok()?,
            size: stat.len(),
        })
    }
}

/// Read-through cache for tool metadata records, keyed by
/// `(path, mtime, size)` and owned by the batch driver — no global state.
/// Callers invalidate after every write; the stamp check is the backstop.
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: HashMap<PathBuf, (FileStamp, FileMetadata)>,
    hits: u64,
    misses: u64,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached record if the file on disk still matches the stamp
    /// it was recorded under.
    pub fn get(&mut self, path: &Path) -> Option<FileMetadata> {
        let current = FileStamp::of(path);
        match self.entries.get(path) {
            Some((stamp, record)) if current == Some(*stamp) => {
                self.hits += 1;
                Some(record.clone())
            }
            Some(_) => {
                self.misses += 1;
                debug!(path = %path.display(), "cache entry stale; file changed on disk");
                self.entries.remove(path);
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, record: FileMetadata) {
        if let Some(stamp) = FileStamp::of(&record.path) {
            self.entries.insert(record.path.clone(), (stamp, record));
        }
    }

    /// Drops the entry for a just-written file.
    pub fn invalidate(&mut self, path: &Path) {
        self.entries.remove(path);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn record_for(path: &Path) -> FileMetadata {
        FileMetadata {
            path: path.to_path_buf(),
            make: Some("Canon".to_string()),
            model: None,
            tags: BTreeMap::new(),
            error: None,
        }
    }

    #[test]
    fn cached_record_is_returned_while_the_file_is_unchanged() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"bytes").expect("write");

        let mut cache = MetadataCache::new();
        assert!(cache.get(&path).is_none());
        cache.insert(record_for(&path));

        let hit = cache.get(&path).expect("cache hit");
        assert_eq!(hit.make.as_deref(), Some("Canon"));
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn invalidate_forces_the_next_lookup_to_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"bytes").expect("write");

        let mut cache = MetadataCache::new();
        cache.insert(record_for(&path));
        cache.invalidate(&path);
        assert!(cache.get(&path).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn a_changed_file_misses_even_without_explicit_invalidation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.jpg");
        fs::write(&path, b"bytes").expect("write");

        let mut cache = MetadataCache::new();
        cache.insert(record_for(&path));
        fs::write(&path, b"rewritten with different length").expect("rewrite");

        assert!(cache.get(&path).is_none());
        assert_eq!(cache.len(), 0, "stale entry evicted on lookup");
    }
}
