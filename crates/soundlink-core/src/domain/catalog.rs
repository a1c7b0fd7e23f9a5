//! The server-owned file catalog.
//!
//! The catalog is the list of audio files the server can play.  It is the
//! payload of every `FILE_LIST` message and one of the fields the settings
//! repository persists across restarts.
//!
//! Ids are unique: inserting a file whose id already exists replaces the old
//! entry instead of adding a duplicate.

use serde::{Deserialize, Serialize};

/// Metadata for one stored audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    /// Controller-chosen identifier, unique within the catalog.
    pub id: String,
    /// Original (unsanitized) file name as shown to users.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
    /// Duration in seconds, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    /// When the file was added, in milliseconds since the Unix epoch.
    pub added_at: u64,
}

impl FileInfo {
    /// Known duration converted to whole milliseconds, or 0 when unknown.
    pub fn duration_ms(&self) -> u64 {
        match self.duration {
            Some(secs) if secs.is_finite() && secs > 0.0 => (secs * 1000.0).round() as u64,
            _ => 0,
        }
    }
}

/// Ordered collection of [`FileInfo`] plus the id of the last file played.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileCatalog {
    files: Vec<FileInfo>,
    last_played_file_id: Option<String>,
}

impl FileCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a catalog from persisted parts.
    ///
    /// Duplicate ids in `files` collapse to the last occurrence.  A
    /// `last_played_file_id` that names no file is dropped.
    pub fn from_parts(files: Vec<FileInfo>, last_played_file_id: Option<String>) -> Self {
        let mut catalog = Self::new();
        for file in files {
            catalog.insert(file);
        }
        catalog.last_played_file_id = last_played_file_id.filter(|id| catalog.contains(id));
        catalog
    }

    /// All files in insertion order.
    pub fn files(&self) -> &[FileInfo] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FileInfo> {
        self.files.iter().find(|f| f.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// Adds `file`, replacing any existing entry with the same id.
    ///
    /// The replacement moves to the end of the list, so the catalog always
    /// reads in the order files were (re)uploaded.
    pub fn insert(&mut self, file: FileInfo) {
        self.files.retain(|f| f.id != file.id);
        self.files.push(file);
    }

    /// Removes and returns the file with `id`.
    ///
    /// Clears the last-played marker if it pointed at the removed file.
    pub fn remove(&mut self, id: &str) -> Option<FileInfo> {
        let idx = self.files.iter().position(|f| f.id == id)?;
        if self.last_played_file_id.as_deref() == Some(id) {
            self.last_played_file_id = None;
        }
        Some(self.files.remove(idx))
    }

    /// Keeps only the files for which `keep` returns `true` and returns the
    /// ones that were dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<FileInfo>
    where
        F: FnMut(&FileInfo) -> bool,
    {
        let (kept, dropped): (Vec<_>, Vec<_>) = self.files.drain(..).partition(|f| keep(f));
        self.files = kept;
        if let Some(last) = &self.last_played_file_id {
            if !self.files.iter().any(|f| &f.id == last) {
                self.last_played_file_id = None;
            }
        }
        dropped
    }

    pub fn last_played_file_id(&self) -> Option<&str> {
        self.last_played_file_id.as_deref()
    }

    /// Records `id` as the last file played.  Ignored if `id` is unknown.
    pub fn set_last_played(&mut self, id: &str) {
        if self.contains(id) {
            self.last_played_file_id = Some(id.to_string());
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn file(id: &str, name: &str) -> FileInfo {
        FileInfo {
            id: id.to_string(),
            name: name.to_string(),
            size: 100,
            duration: None,
            added_at: 1,
        }
    }

    #[test]
    fn test_file_info_serializes_camel_case_and_omits_unknown_duration() {
        let value = serde_json::to_value(file("a", "a.mp3")).unwrap();
        assert_eq!(value["addedAt"], 1);
        assert!(value.get("duration").is_none());
        assert!(value.get("added_at").is_none());
    }

    #[test]
    fn test_file_info_duration_ms_rounds_seconds() {
        let mut f = file("a", "a.mp3");
        f.duration = Some(61.5);
        assert_eq!(f.duration_ms(), 61_500);
        f.duration = Some(f64::NAN);
        assert_eq!(f.duration_ms(), 0);
        f.duration = None;
        assert_eq!(f.duration_ms(), 0);
    }

    #[test]
    fn test_insert_replaces_entry_with_same_id() {
        // Arrange
        let mut catalog = FileCatalog::new();
        catalog.insert(file("a", "old.mp3"));
        catalog.insert(file("b", "b.mp3"));

        // Act
        catalog.insert(file("a", "new.mp3"));

        // Assert
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get("a").unwrap().name, "new.mp3");
        let ids: Vec<_> = catalog.files().iter().map(|f| f.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_remove_clears_matching_last_played() {
        let mut catalog = FileCatalog::new();
        catalog.insert(file("a", "a.mp3"));
        catalog.insert(file("b", "b.mp3"));
        catalog.set_last_played("a");

        let removed = catalog.remove("a");

        assert_eq!(removed.map(|f| f.id), Some("a".to_string()));
        assert_eq!(catalog.last_played_file_id(), None);
    }

    #[test]
    fn test_remove_keeps_other_last_played() {
        let mut catalog = FileCatalog::new();
        catalog.insert(file("a", "a.mp3"));
        catalog.insert(file("b", "b.mp3"));
        catalog.set_last_played("b");

        catalog.remove("a");

        assert_eq!(catalog.last_played_file_id(), Some("b"));
    }

    #[test]
    fn test_remove_unknown_id_returns_none() {
        let mut catalog = FileCatalog::new();
        assert!(catalog.remove("ghost").is_none());
    }

    #[test]
    fn test_set_last_played_ignores_unknown_id() {
        let mut catalog = FileCatalog::new();
        catalog.set_last_played("ghost");
        assert_eq!(catalog.last_played_file_id(), None);
    }

    #[test]
    fn test_from_parts_deduplicates_and_drops_dangling_last_played() {
        let catalog = FileCatalog::from_parts(
            vec![file("a", "1.mp3"), file("a", "2.mp3")],
            Some("missing".into()),
        );
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("a").unwrap().name, "2.mp3");
        assert_eq!(catalog.last_played_file_id(), None);
    }

    #[test]
    fn test_retain_returns_dropped_files_and_clears_last_played() {
        let mut catalog = FileCatalog::new();
        catalog.insert(file("a", "a.mp3"));
        catalog.insert(file("b", "b.mp3"));
        catalog.set_last_played("b");

        let dropped = catalog.retain(|f| f.id == "a");

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].id, "b");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.last_played_file_id(), None);
    }
}
