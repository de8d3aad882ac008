//! Artifact index for one render directory.
//!
//! The index maps artifact keys (file stems) to their path and processed
//! flag. It is rebuilt from a directory scan every tick and entirely
//! replaced when the watched directory changes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactEntry {
    pub path: PathBuf,
    pub processed: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactIndex {
    entries: BTreeMap<String, ArtifactEntry>,
}

impl ArtifactIndex {
    /// Index every artifact file in `dir`.
    ///
    /// Only regular files with the expected extension are considered, and
    /// files below `min_bytes` are skipped: the renderer flushes output
    /// incrementally and a tiny file is still being written.
    ///
    /// A missing or unreadable directory yields an empty index.
    pub fn scan(dir: &Path, ext: &str, min_bytes: u64) -> Self {
        let mut entries = BTreeMap::new();

        let read_dir = match std::fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "Cannot read watch directory");
                return Self::default();
            }
        };

        for item in read_dir.flatten() {
            let path = item.path();
            if path.extension().map_or(true, |e| !e.eq_ignore_ascii_case(ext)) {
                continue;
            }
            let Ok(meta) = item.metadata() else { continue };
            if !meta.is_file() || meta.len() < min_bytes {
                continue;
            }
            let Some(stem) = path.file_stem() else { continue };

            entries.insert(
                stem.to_string_lossy().into_owned(),
                ArtifactEntry {
                    path,
                    processed: false,
                },
            );
        }

        Self { entries }
    }

    /// Keep the processed mark of entries that already existed in `prev`
    /// under the same key and path.
    pub fn carry_processed_from(&mut self, prev: &ArtifactIndex) {
        for (key, entry) in &mut self.entries {
            if let Some(old) = prev.entries.get(key) {
                if old.processed && old.path == entry.path {
                    entry.processed = true;
                }
            }
        }
    }

    /// Mark every entry processed. Used for the initial index of a freshly
    /// watched directory, whose pre-existing files are not ours to verify.
    pub fn mark_all_processed(&mut self) {
        for entry in self.entries.values_mut() {
            entry.processed = true;
        }
    }

    /// Keys present here but not in `prev`.
    pub fn new_keys(&self, prev: &ArtifactIndex) -> BTreeSet<String> {
        self.entries
            .keys()
            .filter(|k| !prev.entries.contains_key(*k))
            .cloned()
            .collect()
    }

    /// Keys present in `prev` but no longer here.
    pub fn removed_keys(&self, prev: &ArtifactIndex) -> BTreeSet<String> {
        prev.entries
            .keys()
            .filter(|k| !self.entries.contains_key(*k))
            .cloned()
            .collect()
    }

    pub fn mark_processed(&mut self, key: &str) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.processed = true;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<ArtifactEntry> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&ArtifactEntry> {
        self.entries.get(key)
    }

    pub fn all_processed(&self) -> bool {
        self.entries.values().all(|e| e.processed)
    }

    /// Keys still awaiting verification.
    pub fn unprocessed_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.processed)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_file(dir: &Path, name: &str, bytes: usize) {
        fs::write(dir.join(name), vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn scan_skips_files_below_minimum_size() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.img", 400_000);
        write_file(dir.path(), "b.img", 100);

        let index = ArtifactIndex::scan(dir.path(), "img", 350_000);
        assert_eq!(index.len(), 1);
        assert!(index.get("a").is_some());
        assert!(index.get("b").is_none());
    }

    #[test]
    fn scan_skips_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "layer.sgi", 4096);
        write_file(dir.path(), "notes.txt", 4096);

        let index = ArtifactIndex::scan(dir.path(), "sgi", 200);
        assert_eq!(index.len(), 1);
        assert!(index.get("layer").is_some());
    }

    #[test]
    fn scan_extension_match_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "layer.SGI", 4096);

        let index = ArtifactIndex::scan(dir.path(), "sgi", 200);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn scan_of_missing_directory_is_empty() {
        let index = ArtifactIndex::scan(Path::new("/nonexistent/render"), "sgi", 200);
        assert!(index.is_empty());
    }

    #[test]
    fn diff_reports_new_and_removed_keys() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.sgi", 4096);
        let first = ArtifactIndex::scan(dir.path(), "sgi", 200);

        write_file(dir.path(), "b.sgi", 4096);
        fs::remove_file(dir.path().join("a.sgi")).unwrap();
        let second = ArtifactIndex::scan(dir.path(), "sgi", 200);

        assert_eq!(second.new_keys(&first).into_iter().collect::<Vec<_>>(), ["b"]);
        assert_eq!(
            second.removed_keys(&first).into_iter().collect::<Vec<_>>(),
            ["a"]
        );
    }

    #[test]
    fn processed_mark_survives_rescan() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.sgi", 4096);

        let mut first = ArtifactIndex::scan(dir.path(), "sgi", 200);
        first.mark_processed("a");

        let mut second = ArtifactIndex::scan(dir.path(), "sgi", 200);
        second.carry_processed_from(&first);
        assert!(second.get("a").unwrap().processed);
    }

    #[test]
    fn all_processed_on_empty_index() {
        assert!(ArtifactIndex::default().all_processed());
    }

    #[test]
    fn unprocessed_keys_lists_pending_entries() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.sgi", 4096);
        write_file(dir.path(), "b.sgi", 4096);

        let mut index = ArtifactIndex::scan(dir.path(), "sgi", 200);
        index.mark_processed("a");
        assert_eq!(index.unprocessed_keys(), ["b"]);
        assert!(!index.all_processed());
    }
}
