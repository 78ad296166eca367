//! Durable storage for the note document.
//!
//! The entire document is one pretty-printed JSON file. It is loaded at
//! startup, normalized (missing collections default to empty), repaired,
//! then rewritten, so the on-disk shape is always current.

use lanshare_core::Document;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Storage for the document file.
#[derive(Debug, Clone)]
pub struct DocumentStorage {
    /// Path to the database file.
    path: PathBuf,
}

impl DocumentStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document from disk.
    ///
    /// A missing file starts an empty document; an unparseable file is
    /// treated the same (with a warning) rather than refusing to start.
    pub fn load_or_default(&self) -> Result<Document, StorageError> {
        if !self.path.exists() {
            info!("No database at {:?}, starting empty", self.path);
            return Ok(Document::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        match serde_json::from_str(&contents) {
            Ok(document) => Ok(document),
            Err(e) => {
                warn!("Failed to parse {:?} ({}), starting empty", self.path, e);
                Ok(Document::default())
            }
        }
    }

    /// Write the document to disk.
    ///
    /// Writes to a sibling temp file and renames over the target so a crash
    /// mid-write never leaves a truncated database.
    pub fn save(&self, document: &Document) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let contents = serde_json::to_string_pretty(document)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use lanshare_core::{Entry, Group, Volume};
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        "2024-05-01T10:00:00Z".parse().unwrap()
    }

    fn sample_document() -> Document {
        Document {
            groups: vec![Group {
                id: "g1".to_string(),
                title: "Trip Notes".to_string(),
                tags: vec!["travel".to_string()],
                entries: vec![Entry {
                    id: "e1".to_string(),
                    title: "Packing".to_string(),
                    content: "- socks".to_string(),
                    created_at: ts(),
                    updated_at: ts(),
                }],
                volumes: vec![Volume {
                    id: "v1".to_string(),
                    title: "Default".to_string(),
                    entry_ids: vec!["e1".to_string()],
                }],
                created_at: ts(),
                updated_at: ts(),
            }],
            tags: vec!["travel".to_string()],
            shares: vec![],
        }
    }

    // ==================== Load ====================

    #[test]
    fn test_missing_file_loads_empty_document() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DocumentStorage::new(temp_dir.path().join("db.json"));

        let document = storage.load_or_default().unwrap();
        assert!(document.groups.is_empty());
        assert!(document.tags.is_empty());
    }

    #[test]
    fn test_corrupt_file_loads_empty_document() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db.json");
        fs::write(&path, "{not json").unwrap();

        let storage = DocumentStorage::new(&path);
        let document = storage.load_or_default().unwrap();
        assert!(document.groups.is_empty());
    }

    #[test]
    fn test_missing_collections_default_to_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db.json");
        fs::write(
            &path,
            r#"{"groups": [{"id": "g1", "title": "Bare", "createdAt": "2024-05-01T10:00:00Z", "updatedAt": "2024-05-01T10:00:00Z"}]}"#,
        )
        .unwrap();

        let storage = DocumentStorage::new(&path);
        let document = storage.load_or_default().unwrap();
        assert_eq!(document.groups.len(), 1);
        assert!(document.groups[0].entries.is_empty());
        assert!(document.groups[0].volumes.is_empty());
        assert!(document.tags.is_empty());
        assert!(document.shares.is_empty());
    }

    // ==================== Save ====================

    #[test]
    fn test_save_and_reload_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DocumentStorage::new(temp_dir.path().join("db.json"));

        let document = sample_document();
        storage.save(&document).unwrap();

        let loaded = storage.load_or_default().unwrap();
        assert_eq!(loaded, document);
    }

    #[test]
    fn test_save_is_pretty_printed_camel_case() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db.json");
        let storage = DocumentStorage::new(&path);

        storage.save(&sample_document()).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains('\n'), "should be indented JSON");
        assert!(contents.contains("\"entryIds\""));
        assert!(contents.contains("\"createdAt\""));
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("db.json");
        let storage = DocumentStorage::new(&path);

        storage.save(&sample_document()).unwrap();
        storage.save(&Document::default()).unwrap();

        let names: Vec<String> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["db.json".to_string()]);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/dir/db.json");
        let storage = DocumentStorage::new(&path);

        storage.save(&Document::default()).unwrap();
        assert!(path.exists());
    }
}
