//! The authoritative store.
//!
//! A `Store` owns the canonical document tree and exposes exactly one way to
//! change it: [`Store::apply`]. Intents are applied one at a time; the daemon
//! makes its event-loop task the store's single owner, which is what
//! serializes access (there is deliberately no interior locking here).
//!
//! Missing targets make an intent a silent no-op rather than an error: an
//! update racing a concurrent delete is an expected interleaving, not a
//! protocol violation. `apply` reports whether the document actually changed
//! so callers can skip broadcasting and persisting no-ops.

use crate::model::{
    CLONE_TITLE_SUFFIX, DEFAULT_VOLUME_TITLE, Document, Entry, Group, NEW_ENTRY_CONTENT,
    NEW_ENTRY_TITLE, Timestamp, Volume, union_tags,
};
use crate::protocol::{InsertPosition, Intent};
use crate::reconcile::ReconciliationKey;
use tracing::debug;
use uuid::Uuid;

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Canonical state plus the only mutation path into it.
#[derive(Debug, Default)]
pub struct Store {
    doc: Document,
}

impl Store {
    pub fn new(doc: Document) -> Self {
        Self { doc }
    }

    pub fn document(&self) -> &Document {
        &self.doc
    }

    pub fn into_document(self) -> Document {
        self.doc
    }

    /// Restore the volume-membership invariant across all groups, minting
    /// ids for any default volumes created along the way. Run once after
    /// loading from disk. Returns whether anything was repaired.
    pub fn repair(&mut self) -> bool {
        self.doc.repair(new_id)
    }

    /// Apply one intent. Returns true when the document changed (the signal
    /// that gates broadcasting and saving); false for no-ops, stale writes,
    /// and missing targets.
    pub fn apply(&mut self, intent: Intent, now: Timestamp) -> bool {
        let kind = intent.kind();
        let changed = match intent {
            Intent::CreateGroup { title, tags } => self.create_group(title, tags, now),
            Intent::UpdateGroup {
                id,
                title,
                tags,
                updated_at,
            } => self.update_group(&id, title, tags, updated_at),
            Intent::DeleteGroup { id } => self.delete_group(&id),
            Intent::CreateEntry {
                group_id,
                volume_id,
            } => self.create_entry(&group_id, volume_id.as_deref(), now),
            Intent::CreateEntryWithContent {
                group_id,
                volume_id,
                title,
                content,
                created_at,
                updated_at,
            } => self.create_entry_with_content(
                &group_id, &volume_id, title, content, created_at, updated_at, now,
            ),
            Intent::UpdateEntry {
                group_id,
                entry_id,
                title,
                content,
                updated_at,
            } => self.update_entry(&group_id, &entry_id, title, content, updated_at),
            Intent::DeleteEntry { group_id, entry_id } => self.delete_entry(&group_id, &entry_id, now),
            Intent::CloneEntry { group_id, entry_id } => self.clone_entry(&group_id, &entry_id, now),
            Intent::InsertEntry {
                group_id,
                anchor_entry_id,
                position,
            } => self.insert_entry(&group_id, &anchor_entry_id, position, now),
            Intent::CreateVolume { group_id, title } => self.create_volume(&group_id, title, now),
            Intent::UpdateVolume {
                group_id,
                volume_id,
                title,
            } => self.update_volume(&group_id, &volume_id, title, now),
            Intent::DeleteVolume {
                group_id,
                volume_id,
            } => self.delete_volume(&group_id, &volume_id, now),
            Intent::ReorderVolumes {
                group_id,
                new_order,
            } => self.reorder_volumes(&group_id, &new_order, now),
            Intent::ReorderEntries {
                group_id,
                volume_id,
                new_order,
            } => self.reorder_entries(&group_id, &volume_id, &new_order, now),
            Intent::MoveEntry {
                group_id,
                from_volume_id,
                to_volume_id,
                entry_id,
                to_index,
            } => self.move_entry(
                &group_id,
                &from_volume_id,
                &to_volume_id,
                &entry_id,
                to_index,
                now,
            ),
        };
        debug!(intent = kind, changed, "intent applied");
        changed
    }

    fn create_group(&mut self, title: String, tags: Vec<String>, now: Timestamp) -> bool {
        let mut clean_tags = Vec::new();
        union_tags(&mut clean_tags, &tags);
        union_tags(&mut self.doc.tags, &clean_tags);
        self.doc.groups.push(Group {
            id: new_id(),
            title,
            tags: clean_tags,
            entries: vec![],
            volumes: vec![Volume {
                id: new_id(),
                title: DEFAULT_VOLUME_TITLE.to_string(),
                entry_ids: vec![],
            }],
            created_at: now,
            updated_at: now,
        });
        true
    }

    fn update_group(
        &mut self,
        id: &str,
        title: Option<String>,
        tags: Option<Vec<String>>,
        updated_at: Timestamp,
    ) -> bool {
        let Some(group) = self.doc.group_mut(id) else {
            return false;
        };
        if updated_at < group.updated_at {
            debug!(group = id, "stale group update discarded");
            return false;
        }
        let mut changed = false;
        if let Some(title) = title {
            if group.title != title {
                group.title = title;
                changed = true;
            }
        }
        if let Some(tags) = tags {
            let mut clean = Vec::new();
            union_tags(&mut clean, &tags);
            if group.tags != clean {
                group.tags = clean;
                changed = true;
            }
        }
        if group.updated_at != updated_at {
            group.updated_at = updated_at;
            changed = true;
        }
        if changed {
            self.doc.recompute_tags();
        }
        changed
    }

    fn delete_group(&mut self, id: &str) -> bool {
        let before = self.doc.groups.len();
        self.doc.groups.retain(|g| g.id != id);
        if self.doc.groups.len() == before {
            return false;
        }
        self.doc.recompute_tags();
        true
    }

    fn create_entry(&mut self, group_id: &str, volume_id: Option<&str>, now: Timestamp) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        group.repair_volumes(new_id);
        let entry = Entry {
            id: new_id(),
            title: NEW_ENTRY_TITLE.to_string(),
            content: NEW_ENTRY_CONTENT.to_string(),
            created_at: now,
            updated_at: now,
        };
        let slot = volume_id
            .and_then(|id| group.volumes.iter().position(|v| v.id == id))
            .unwrap_or(0);
        group.volumes[slot].entry_ids.insert(0, entry.id.clone());
        group.entries.insert(0, entry);
        group.touch(now);
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn create_entry_with_content(
        &mut self,
        group_id: &str,
        volume_id: &str,
        title: String,
        content: String,
        created_at: Timestamp,
        updated_at: Timestamp,
        now: Timestamp,
    ) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        // Cooldown-bounded retries may deliver the same create twice; the
        // reconciliation key makes the duplicate a no-op.
        let key = ReconciliationKey::new(&title, created_at);
        if group.entries.iter().any(|e| ReconciliationKey::of(e) == key) {
            debug!(group = group_id, %key, "entry already materialized");
            return false;
        }
        group.repair_volumes(new_id);
        let entry = Entry {
            id: new_id(),
            title,
            content,
            created_at,
            updated_at,
        };
        let slot = group
            .volumes
            .iter()
            .position(|v| v.id == volume_id)
            .unwrap_or(0);
        group.volumes[slot].entry_ids.insert(0, entry.id.clone());
        group.entries.insert(0, entry);
        group.touch(now);
        true
    }

    fn update_entry(
        &mut self,
        group_id: &str,
        entry_id: &str,
        title: Option<String>,
        content: Option<String>,
        updated_at: Timestamp,
    ) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let Some(entry) = group.entry_mut(entry_id) else {
            return false;
        };
        if updated_at < entry.updated_at {
            debug!(entry = entry_id, "stale entry update discarded");
            return false;
        }
        let mut changed = false;
        if let Some(title) = title {
            if entry.title != title {
                entry.title = title;
                changed = true;
            }
        }
        if let Some(content) = content {
            if entry.content != content {
                entry.content = content;
                changed = true;
            }
        }
        if entry.updated_at != updated_at {
            entry.updated_at = updated_at;
            changed = true;
        }
        if changed && updated_at > group.updated_at {
            group.updated_at = updated_at;
        }
        changed
    }

    fn delete_entry(&mut self, group_id: &str, entry_id: &str, now: Timestamp) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        if !group.remove_entry(entry_id) {
            return false;
        }
        group.touch(now);
        true
    }

    fn clone_entry(&mut self, group_id: &str, entry_id: &str, now: Timestamp) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let repaired = group.repair_volumes(new_id);
        let Some(source) = group.entry(entry_id).cloned() else {
            return repaired;
        };
        let copy = Entry {
            id: new_id(),
            title: format!("{}{}", source.title, CLONE_TITLE_SUFFIX),
            content: source.content,
            created_at: now,
            updated_at: now,
        };
        let copy_id = copy.id.clone();
        group.entries.push(copy);
        // After repair the source is guaranteed to sit in some volume; the
        // copy lands directly behind it.
        if let Some(volume) = group.volume_containing_mut(entry_id) {
            let at = volume
                .entry_ids
                .iter()
                .position(|id| id == entry_id)
                .map(|i| i + 1)
                .unwrap_or(volume.entry_ids.len());
            volume.entry_ids.insert(at, copy_id);
        }
        group.touch(now);
        true
    }

    fn insert_entry(
        &mut self,
        group_id: &str,
        anchor_entry_id: &str,
        position: InsertPosition,
        now: Timestamp,
    ) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let repaired = group.repair_volumes(new_id);
        let Some(volume) = group.volume_containing(anchor_entry_id) else {
            return repaired;
        };
        let volume_id = volume.id.clone();
        let entry = Entry {
            id: new_id(),
            title: NEW_ENTRY_TITLE.to_string(),
            content: NEW_ENTRY_CONTENT.to_string(),
            created_at: now,
            updated_at: now,
        };
        let entry_id = entry.id.clone();
        group.entries.push(entry);
        if let Some(volume) = group.volume_mut(&volume_id) {
            if let Some(idx) = volume.entry_ids.iter().position(|id| id == anchor_entry_id) {
                let at = match position {
                    InsertPosition::Before => idx,
                    InsertPosition::After => idx + 1,
                };
                volume.entry_ids.insert(at, entry_id);
            }
        }
        group.touch(now);
        true
    }

    fn create_volume(&mut self, group_id: &str, title: String, now: Timestamp) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let title = if title.is_empty() {
            DEFAULT_VOLUME_TITLE.to_string()
        } else {
            title
        };
        group.volumes.push(Volume {
            id: new_id(),
            title,
            entry_ids: vec![],
        });
        group.touch(now);
        true
    }

    fn update_volume(&mut self, group_id: &str, volume_id: &str, title: String, now: Timestamp) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let Some(volume) = group.volume_mut(volume_id) else {
            return false;
        };
        if title.is_empty() || volume.title == title {
            return false;
        }
        volume.title = title;
        group.touch(now);
        true
    }

    fn delete_volume(&mut self, group_id: &str, volume_id: &str, now: Timestamp) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let Some(pos) = group.volumes.iter().position(|v| v.id == volume_id) else {
            return false;
        };
        let removed = group.volumes.remove(pos);
        if group.volumes.is_empty() {
            group.volumes.push(Volume {
                id: new_id(),
                title: DEFAULT_VOLUME_TITLE.to_string(),
                entry_ids: vec![],
            });
        }
        // The orphaned entries go to the front of the receiving volume, in
        // their previous relative order.
        let receiver = &mut group.volumes[0];
        let mut merged = removed.entry_ids;
        merged.append(&mut receiver.entry_ids);
        receiver.entry_ids = merged;
        group.touch(now);
        true
    }

    fn reorder_volumes(&mut self, group_id: &str, new_order: &[String], now: Timestamp) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let current: Vec<&str> = group.volumes.iter().map(|v| v.id.as_str()).collect();
        let Some(order) = validate_permutation(new_order, &current) else {
            debug!(group = group_id, "reorder_volumes is not a permutation");
            return false;
        };
        if order == current {
            return false;
        }
        let order: Vec<String> = order.iter().map(|s| s.to_string()).collect();
        group
            .volumes
            .sort_by_key(|v| order.iter().position(|id| *id == v.id));
        group.touch(now);
        true
    }

    fn reorder_entries(
        &mut self,
        group_id: &str,
        volume_id: &str,
        new_order: &[String],
        now: Timestamp,
    ) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let Some(volume) = group.volume_mut(volume_id) else {
            return false;
        };
        let current: Vec<&str> = volume.entry_ids.iter().map(|s| s.as_str()).collect();
        let Some(order) = validate_permutation(new_order, &current) else {
            debug!(group = group_id, volume = volume_id, "reorder_entries is not a permutation");
            return false;
        };
        if order == current {
            return false;
        }
        volume.entry_ids = order.iter().map(|s| s.to_string()).collect();
        group.touch(now);
        true
    }

    fn move_entry(
        &mut self,
        group_id: &str,
        from_volume_id: &str,
        to_volume_id: &str,
        entry_id: &str,
        to_index: i64,
        now: Timestamp,
    ) -> bool {
        let Some(group) = self.doc.group_mut(group_id) else {
            return false;
        };
        let Some(from) = group.volumes.iter().position(|v| v.id == from_volume_id) else {
            return false;
        };
        let Some(to) = group.volumes.iter().position(|v| v.id == to_volume_id) else {
            return false;
        };
        let Some(idx) = group.volumes[from]
            .entry_ids
            .iter()
            .position(|id| id == entry_id)
        else {
            return false;
        };
        let before = (from == to).then(|| group.volumes[to].entry_ids.clone());
        group.volumes[from].entry_ids.remove(idx);
        let len = group.volumes[to].entry_ids.len();
        let at = to_index.clamp(0, len as i64) as usize;
        group.volumes[to].entry_ids.insert(at, entry_id.to_string());
        if let Some(before) = before {
            if before == group.volumes[to].entry_ids {
                return false;
            }
        }
        group.touch(now);
        true
    }
}

/// Filter `proposed` down to ids actually present in `current` (dropping
/// duplicates); the result counts as a permutation only if nothing from
/// `current` is missing. Shared with the client's optimistic mirror so both
/// sides accept exactly the same reorders.
pub fn validate_permutation<'a>(proposed: &'a [String], current: &[&str]) -> Option<Vec<&'a str>> {
    let mut seen: Vec<&str> = Vec::new();
    for id in proposed {
        if current.contains(&id.as_str()) && !seen.contains(&id.as_str()) {
            seen.push(id);
        }
    }
    (seen.len() == current.len()).then_some(seen)
}
