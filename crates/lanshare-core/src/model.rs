//! Document model for the shared note store.
//!
//! The tree is groups → volumes → entries. Entries hold the text; volumes
//! hold presentation order (`entryIds`); groups own both plus a tag list.
//! The whole tree is JSON-serializable with camelCase field names and is
//! copied wholesale between server and clients, never shared.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wall-clock timestamp, ISO-8601 on the wire.
pub type Timestamp = DateTime<Utc>;

/// Title given to a volume created by the system rather than the user.
pub const DEFAULT_VOLUME_TITLE: &str = "Default";
/// Title for entries created through the plain create path.
pub const NEW_ENTRY_TITLE: &str = "New Entry";
/// Seed content for entries created through the plain create path.
pub const NEW_ENTRY_CONTENT: &str = "# New Entry\n\nStart writing...";
/// Appended to the source title when an entry is cloned.
pub const CLONE_TITLE_SUFFIX: &str = " (copy)";

/// A single note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub title: String,
    pub content: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// An ordered shelf of entries within a group.
///
/// `entry_ids` is the volume's visible order and may only reference ids
/// present in the owning group's `entries`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub entry_ids: Vec<String>,
}

/// A collection of entries partitioned into volumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub entries: Vec<Entry>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// The full snapshot: everything the server knows, everything a `full_sync`
/// carries, everything that lands on disk.
///
/// `shares` belongs to the file-sharing endpoints and is carried through
/// untouched; the engine never looks inside it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Document {
    pub groups: Vec<Group>,
    pub tags: Vec<String>,
    pub shares: Vec<serde_json::Value>,
}

impl Group {
    pub fn entry(&self, id: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entry_mut(&mut self, id: &str) -> Option<&mut Entry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }

    pub fn volume(&self, id: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.id == id)
    }

    pub fn volume_mut(&mut self, id: &str) -> Option<&mut Volume> {
        self.volumes.iter_mut().find(|v| v.id == id)
    }

    /// The volume whose order currently lists `entry_id`.
    pub fn volume_containing(&self, entry_id: &str) -> Option<&Volume> {
        self.volumes
            .iter()
            .find(|v| v.entry_ids.iter().any(|id| id == entry_id))
    }

    pub fn volume_containing_mut(&mut self, entry_id: &str) -> Option<&mut Volume> {
        self.volumes
            .iter_mut()
            .find(|v| v.entry_ids.iter().any(|id| id == entry_id))
    }

    pub fn volume_by_title(&self, title: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.title == title)
    }

    pub fn entry_by_title(&self, title: &str) -> Option<&Entry> {
        self.entries.iter().find(|e| e.title == title)
    }

    /// Remove an entry and purge its id from every volume in the same step.
    ///
    /// Returns false (and changes nothing) when the entry does not exist.
    pub fn remove_entry(&mut self, entry_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != entry_id);
        if self.entries.len() == before {
            return false;
        }
        for volume in &mut self.volumes {
            volume.entry_ids.retain(|id| id != entry_id);
        }
        true
    }

    /// Restore the volume-membership invariant: every entry id appears in
    /// exactly one volume and no volume references an unknown id.
    ///
    /// With no volumes at all, a default volume is created holding every
    /// entry in `entries` order. Otherwise stale ids are purged, duplicate
    /// placements keep their first occurrence, and entries missing from all
    /// volumes are appended to the first volume. Returns whether anything
    /// was repaired.
    pub fn repair_volumes(&mut self, volume_id: impl FnOnce() -> String) -> bool {
        if self.volumes.is_empty() {
            self.volumes.push(Volume {
                id: volume_id(),
                title: DEFAULT_VOLUME_TITLE.to_string(),
                entry_ids: self.entries.iter().map(|e| e.id.clone()).collect(),
            });
            return true;
        }

        let mut changed = false;
        let mut seen: Vec<String> = Vec::new();
        for volume in &mut self.volumes {
            let before = volume.entry_ids.len();
            volume.entry_ids.retain(|id| {
                let known = self.entries.iter().any(|e| &e.id == id);
                let duplicate = seen.iter().any(|s| s == id);
                if known && !duplicate {
                    seen.push(id.clone());
                    true
                } else {
                    false
                }
            });
            changed |= volume.entry_ids.len() != before;
        }

        let orphans: Vec<String> = self
            .entries
            .iter()
            .map(|e| e.id.clone())
            .filter(|id| !seen.iter().any(|s| s == id))
            .collect();
        if !orphans.is_empty() {
            changed = true;
            self.volumes[0].entry_ids.extend(orphans);
        }
        changed
    }

    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
    }
}

impl Document {
    pub fn group(&self, id: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_mut(&mut self, id: &str) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    pub fn group_by_title(&self, title: &str) -> Option<&Group> {
        self.groups.iter().find(|g| g.title == title)
    }

    /// Repair volume membership in every group. Returns whether anything
    /// changed (used to decide whether a freshly loaded file is rewritten).
    pub fn repair(&mut self, mut volume_id: impl FnMut() -> String) -> bool {
        let mut changed = false;
        for group in &mut self.groups {
            changed |= group.repair_volumes(&mut volume_id);
        }
        changed
    }

    /// Recompute the global tag list as the union of all groups' tags,
    /// preserving first-seen order. Orphaned tags disappear. Returns whether
    /// the list changed.
    pub fn recompute_tags(&mut self) -> bool {
        let mut union: Vec<String> = Vec::new();
        for group in &self.groups {
            for tag in &group.tags {
                if !union.contains(tag) {
                    union.push(tag.clone());
                }
            }
        }
        if union != self.tags {
            self.tags = union;
            true
        } else {
            false
        }
    }
}

/// Append the members of `src` missing from `dst`, keeping `dst`'s order.
pub fn union_tags(dst: &mut Vec<String>, src: &[String]) {
    for tag in src {
        if !dst.contains(tag) {
            dst.push(tag.clone());
        }
    }
}
