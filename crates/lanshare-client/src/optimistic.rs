//! Optimistic local application of intents.
//!
//! Mirrors every store mutation against the client's own document copy so
//! edits render immediately, online or not. Where the server would mint a
//! permanent id, this layer mints a temp id instead; the reconciler retires
//! those once the server's snapshot carries the real entity.
//!
//! The mirror must drift from the server only in ids, never in shape: each
//! arm below follows the corresponding store operation step for step.

use lanshare_core::model::{
    CLONE_TITLE_SUFFIX, DEFAULT_VOLUME_TITLE, Document, Entry, NEW_ENTRY_CONTENT, NEW_ENTRY_TITLE,
    Timestamp, Volume, union_tags,
};
use lanshare_core::protocol::{InsertPosition, Intent};
use lanshare_core::store::validate_permutation;
use lanshare_core::{Group, ReconciliationKey, temp_id};

/// Apply one intent to the local document, minting temp ids where the
/// server would assign real ones. Returns the minted id for creating
/// intents; `None` otherwise (including missing-target no-ops).
pub fn apply_local(doc: &mut Document, intent: &Intent, now: Timestamp) -> Option<String> {
    match intent {
        Intent::CreateGroup { title, tags } => Some(create_group(doc, title, tags, now)),
        Intent::UpdateGroup {
            id,
            title,
            tags,
            updated_at,
        } => {
            update_group(doc, id, title.as_deref(), tags.as_deref(), *updated_at);
            None
        }
        Intent::DeleteGroup { id } => {
            delete_group(doc, id);
            None
        }
        Intent::CreateEntry {
            group_id,
            volume_id,
        } => create_entry(doc, group_id, volume_id.as_deref(), now),
        Intent::CreateEntryWithContent {
            group_id,
            volume_id,
            title,
            content,
            created_at,
            updated_at,
        } => create_entry_with_content(
            doc, group_id, volume_id, title, content, *created_at, *updated_at, now,
        ),
        Intent::UpdateEntry {
            group_id,
            entry_id,
            title,
            content,
            updated_at,
        } => {
            update_entry(
                doc,
                group_id,
                entry_id,
                title.as_deref(),
                content.as_deref(),
                *updated_at,
            );
            None
        }
        Intent::DeleteEntry { group_id, entry_id } => {
            delete_entry(doc, group_id, entry_id, now);
            None
        }
        Intent::CloneEntry { group_id, entry_id } => clone_entry(doc, group_id, entry_id, now),
        Intent::InsertEntry {
            group_id,
            anchor_entry_id,
            position,
        } => insert_entry(doc, group_id, anchor_entry_id, *position, now),
        Intent::CreateVolume { group_id, title } => create_volume(doc, group_id, title, now),
        Intent::UpdateVolume {
            group_id,
            volume_id,
            title,
        } => {
            update_volume(doc, group_id, volume_id, title, now);
            None
        }
        Intent::DeleteVolume {
            group_id,
            volume_id,
        } => {
            delete_volume(doc, group_id, volume_id, now);
            None
        }
        Intent::ReorderVolumes {
            group_id,
            new_order,
        } => {
            reorder_volumes(doc, group_id, new_order, now);
            None
        }
        Intent::ReorderEntries {
            group_id,
            volume_id,
            new_order,
        } => {
            reorder_entries(doc, group_id, volume_id, new_order, now);
            None
        }
        Intent::MoveEntry {
            group_id,
            from_volume_id,
            to_volume_id,
            entry_id,
            to_index,
        } => {
            move_entry(
                doc,
                group_id,
                from_volume_id,
                to_volume_id,
                entry_id,
                *to_index,
                now,
            );
            None
        }
    }
}

fn ms(now: Timestamp) -> u64 {
    now.timestamp_millis().max(0) as u64
}

/// Mint an id that is actually free in this document. Two creates landing
/// in the same millisecond must not share an id.
fn mint_unique(doc: &Document, mint: impl Fn(u64) -> String, mut now_ms: u64) -> String {
    loop {
        let id = mint(now_ms);
        if !id_in_use(doc, &id) {
            return id;
        }
        now_ms += 1;
    }
}

fn id_in_use(doc: &Document, id: &str) -> bool {
    doc.groups.iter().any(|g| {
        g.id == id
            || g.entries.iter().any(|e| e.id == id)
            || g.volumes.iter().any(|v| v.id == id)
    })
}

fn create_group(doc: &mut Document, title: &str, tags: &[String], now: Timestamp) -> String {
    let now_ms = ms(now);
    let group_id = mint_unique(doc, temp_id::mint_group, now_ms);
    let volume_id = mint_unique(doc, temp_id::mint_volume, now_ms);
    let mut clean_tags = Vec::new();
    union_tags(&mut clean_tags, tags);
    union_tags(&mut doc.tags, &clean_tags);
    doc.groups.push(Group {
        id: group_id.clone(),
        title: title.to_string(),
        tags: clean_tags,
        entries: vec![],
        volumes: vec![Volume {
            id: volume_id,
            title: DEFAULT_VOLUME_TITLE.to_string(),
            entry_ids: vec![],
        }],
        created_at: now,
        updated_at: now,
    });
    group_id
}

fn update_group(
    doc: &mut Document,
    id: &str,
    title: Option<&str>,
    tags: Option<&[String]>,
    updated_at: Timestamp,
) {
    let Some(group) = doc.group_mut(id) else {
        return;
    };
    if updated_at < group.updated_at {
        return;
    }
    let mut changed = false;
    if let Some(title) = title {
        if group.title != title {
            group.title = title.to_string();
            changed = true;
        }
    }
    if let Some(tags) = tags {
        let mut clean = Vec::new();
        union_tags(&mut clean, tags);
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
        doc.recompute_tags();
    }
}

fn delete_group(doc: &mut Document, id: &str) {
    let before = doc.groups.len();
    doc.groups.retain(|g| g.id != id);
    if doc.groups.len() != before {
        doc.recompute_tags();
    }
}

fn create_entry(
    doc: &mut Document,
    group_id: &str,
    volume_id: Option<&str>,
    now: Timestamp,
) -> Option<String> {
    let now_ms = ms(now);
    let entry_id = mint_unique(doc, temp_id::mint_entry, now_ms);
    let fallback_volume = mint_unique(doc, temp_id::mint_volume, now_ms);
    let group = doc.group_mut(group_id)?;
    group.repair_volumes(|| fallback_volume);
    let entry = Entry {
        id: entry_id.clone(),
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
    Some(entry_id)
}

#[allow(clippy::too_many_arguments)]
fn create_entry_with_content(
    doc: &mut Document,
    group_id: &str,
    volume_id: &str,
    title: &str,
    content: &str,
    created_at: Timestamp,
    updated_at: Timestamp,
    now: Timestamp,
) -> Option<String> {
    let now_ms = ms(now);
    let entry_id = mint_unique(doc, temp_id::mint_entry, now_ms);
    let fallback_volume = mint_unique(doc, temp_id::mint_volume, now_ms);
    let group = doc.group_mut(group_id)?;
    let key = ReconciliationKey::new(title, created_at);
    if group.entries.iter().any(|e| ReconciliationKey::of(e) == key) {
        return None;
    }
    group.repair_volumes(|| fallback_volume);
    let entry = Entry {
        id: entry_id.clone(),
        title: title.to_string(),
        content: content.to_string(),
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
    Some(entry_id)
}

fn update_entry(
    doc: &mut Document,
    group_id: &str,
    entry_id: &str,
    title: Option<&str>,
    content: Option<&str>,
    updated_at: Timestamp,
) {
    let Some(group) = doc.group_mut(group_id) else {
        return;
    };
    let Some(entry) = group.entry_mut(entry_id) else {
        return;
    };
    if updated_at < entry.updated_at {
        return;
    }
    let mut changed = false;
    if let Some(title) = title {
        if entry.title != title {
            entry.title = title.to_string();
            changed = true;
        }
    }
    if let Some(content) = content {
        if entry.content != content {
            entry.content = content.to_string();
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
}

fn delete_entry(doc: &mut Document, group_id: &str, entry_id: &str, now: Timestamp) {
    let Some(group) = doc.group_mut(group_id) else {
        return;
    };
    if group.remove_entry(entry_id) {
        group.touch(now);
    }
}

fn clone_entry(doc: &mut Document, group_id: &str, entry_id: &str, now: Timestamp) -> Option<String> {
    let now_ms = ms(now);
    let copy_id = mint_unique(doc, temp_id::mint_clone, now_ms);
    let fallback_volume = mint_unique(doc, temp_id::mint_volume, now_ms);
    let group = doc.group_mut(group_id)?;
    group.repair_volumes(|| fallback_volume);
    let source = group.entry(entry_id).cloned()?;
    let copy = Entry {
        id: copy_id.clone(),
        title: format!("{}{}", source.title, CLONE_TITLE_SUFFIX),
        content: source.content,
        created_at: now,
        updated_at: now,
    };
    group.entries.push(copy);
    if let Some(volume) = group.volume_containing_mut(entry_id) {
        let at = volume
            .entry_ids
            .iter()
            .position(|id| id == entry_id)
            .map(|i| i + 1)
            .unwrap_or(volume.entry_ids.len());
        volume.entry_ids.insert(at, copy_id.clone());
    }
    group.touch(now);
    Some(copy_id)
}

fn insert_entry(
    doc: &mut Document,
    group_id: &str,
    anchor_entry_id: &str,
    position: InsertPosition,
    now: Timestamp,
) -> Option<String> {
    let now_ms = ms(now);
    let entry_id = mint_unique(doc, temp_id::mint_insert, now_ms);
    let fallback_volume = mint_unique(doc, temp_id::mint_volume, now_ms);
    let group = doc.group_mut(group_id)?;
    group.repair_volumes(|| fallback_volume);
    let volume_id = group.volume_containing(anchor_entry_id)?.id.clone();
    let entry = Entry {
        id: entry_id.clone(),
        title: NEW_ENTRY_TITLE.to_string(),
        content: NEW_ENTRY_CONTENT.to_string(),
        created_at: now,
        updated_at: now,
    };
    group.entries.push(entry);
    if let Some(volume) = group.volume_mut(&volume_id) {
        if let Some(idx) = volume.entry_ids.iter().position(|id| id == anchor_entry_id) {
            let at = match position {
                InsertPosition::Before => idx,
                InsertPosition::After => idx + 1,
            };
            volume.entry_ids.insert(at, entry_id.clone());
        }
    }
    group.touch(now);
    Some(entry_id)
}

fn create_volume(doc: &mut Document, group_id: &str, title: &str, now: Timestamp) -> Option<String> {
    let now_ms = ms(now);
    let volume_id = mint_unique(doc, temp_id::mint_volume, now_ms);
    let group = doc.group_mut(group_id)?;
    let title = if title.is_empty() {
        DEFAULT_VOLUME_TITLE.to_string()
    } else {
        title.to_string()
    };
    group.volumes.push(Volume {
        id: volume_id.clone(),
        title,
        entry_ids: vec![],
    });
    group.touch(now);
    Some(volume_id)
}

fn update_volume(doc: &mut Document, group_id: &str, volume_id: &str, title: &str, now: Timestamp) {
    let Some(group) = doc.group_mut(group_id) else {
        return;
    };
    let Some(volume) = group.volume_mut(volume_id) else {
        return;
    };
    if title.is_empty() || volume.title == title {
        return;
    }
    volume.title = title.to_string();
    group.touch(now);
}

fn delete_volume(doc: &mut Document, group_id: &str, volume_id: &str, now: Timestamp) {
    let now_ms = ms(now);
    let replacement_id = mint_unique(doc, temp_id::mint_volume, now_ms);
    let Some(group) = doc.group_mut(group_id) else {
        return;
    };
    let Some(pos) = group.volumes.iter().position(|v| v.id == volume_id) else {
        return;
    };
    let removed = group.volumes.remove(pos);
    if group.volumes.is_empty() {
        group.volumes.push(Volume {
            id: replacement_id,
            title: DEFAULT_VOLUME_TITLE.to_string(),
            entry_ids: vec![],
        });
    }
    let receiver = &mut group.volumes[0];
    let mut merged = removed.entry_ids;
    merged.append(&mut receiver.entry_ids);
    receiver.entry_ids = merged;
    group.touch(now);
}

fn reorder_volumes(doc: &mut Document, group_id: &str, new_order: &[String], now: Timestamp) {
    let Some(group) = doc.group_mut(group_id) else {
        return;
    };
    let current: Vec<&str> = group.volumes.iter().map(|v| v.id.as_str()).collect();
    let Some(order) = validate_permutation(new_order, &current) else {
        return;
    };
    if order == current {
        return;
    }
    let order: Vec<String> = order.iter().map(|s| s.to_string()).collect();
    group
        .volumes
        .sort_by_key(|v| order.iter().position(|id| *id == v.id));
    group.touch(now);
}

fn reorder_entries(
    doc: &mut Document,
    group_id: &str,
    volume_id: &str,
    new_order: &[String],
    now: Timestamp,
) {
    let Some(group) = doc.group_mut(group_id) else {
        return;
    };
    let Some(volume) = group.volume_mut(volume_id) else {
        return;
    };
    let current: Vec<&str> = volume.entry_ids.iter().map(|s| s.as_str()).collect();
    let Some(order) = validate_permutation(new_order, &current) else {
        return;
    };
    if order == current {
        return;
    }
    volume.entry_ids = order.iter().map(|s| s.to_string()).collect();
    group.touch(now);
}

fn move_entry(
    doc: &mut Document,
    group_id: &str,
    from_volume_id: &str,
    to_volume_id: &str,
    entry_id: &str,
    to_index: i64,
    now: Timestamp,
) {
    let Some(group) = doc.group_mut(group_id) else {
        return;
    };
    let Some(from) = group.volumes.iter().position(|v| v.id == from_volume_id) else {
        return;
    };
    let Some(to) = group.volumes.iter().position(|v| v.id == to_volume_id) else {
        return;
    };
    let Some(idx) = group.volumes[from]
        .entry_ids
        .iter()
        .position(|id| id == entry_id)
    else {
        return;
    };
    group.volumes[from].entry_ids.remove(idx);
    let len = group.volumes[to].entry_ids.len();
    let at = to_index.clamp(0, len as i64) as usize;
    group.volumes[to].entry_ids.insert(at, entry_id.to_string());
    group.touch(now);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(s: &str) -> Timestamp {
        s.parse().unwrap()
    }

    fn t0() -> Timestamp {
        ts("2024-05-01T10:00:00Z")
    }

    fn t_plus(secs: i64) -> Timestamp {
        t0() + chrono::Duration::seconds(secs)
    }

    fn doc_with_group() -> (Document, String) {
        let mut doc = Document::default();
        let id = apply_local(
            &mut doc,
            &Intent::CreateGroup {
                title: "Notes".to_string(),
                tags: vec!["work".to_string()],
            },
            t0(),
        )
        .unwrap();
        (doc, id)
    }

    fn add_entry(doc: &mut Document, group_id: &str, at: Timestamp) -> String {
        apply_local(
            doc,
            &Intent::CreateEntry {
                group_id: group_id.to_string(),
                volume_id: None,
            },
            at,
        )
        .unwrap()
    }

    // ==================== Temp id minting ====================

    #[test]
    fn test_create_group_mints_temp_ids() {
        let (doc, id) = doc_with_group();
        assert!(temp_id::is_temp_group(&id));
        let group = doc.group(&id).unwrap();
        assert_eq!(group.volumes.len(), 1);
        assert!(temp_id::is_temp_volume(&group.volumes[0].id));
        assert_eq!(group.volumes[0].title, DEFAULT_VOLUME_TITLE);
        assert_eq!(doc.tags, vec!["work"]);
    }

    #[test]
    fn test_same_millisecond_creates_get_distinct_ids() {
        let mut doc = Document::default();
        let first = apply_local(
            &mut doc,
            &Intent::CreateGroup {
                title: "A".to_string(),
                tags: vec![],
            },
            t0(),
        )
        .unwrap();
        let second = apply_local(
            &mut doc,
            &Intent::CreateGroup {
                title: "B".to_string(),
                tags: vec![],
            },
            t0(),
        )
        .unwrap();
        assert_ne!(first, second);
        assert_eq!(doc.groups.len(), 2);
        let vol_ids: Vec<&String> = doc.groups.iter().map(|g| &g.volumes[0].id).collect();
        assert_ne!(vol_ids[0], vol_ids[1]);
    }

    #[test]
    fn test_each_create_path_mints_its_prefix() {
        let (mut doc, gid) = doc_with_group();
        let entry = add_entry(&mut doc, &gid, t_plus(1));
        assert!(temp_id::is_temp_entry(&entry));

        let copy = apply_local(
            &mut doc,
            &Intent::CloneEntry {
                group_id: gid.clone(),
                entry_id: entry.clone(),
            },
            t_plus(2),
        )
        .unwrap();
        assert!(copy.starts_with(temp_id::CLONE_PREFIX));

        let inserted = apply_local(
            &mut doc,
            &Intent::InsertEntry {
                group_id: gid.clone(),
                anchor_entry_id: entry,
                position: InsertPosition::After,
            },
            t_plus(3),
        )
        .unwrap();
        assert!(inserted.starts_with(temp_id::INSERT_PREFIX));

        let volume = apply_local(
            &mut doc,
            &Intent::CreateVolume {
                group_id: gid,
                title: "Side".to_string(),
            },
            t_plus(4),
        )
        .unwrap();
        assert!(temp_id::is_temp_volume(&volume));
    }

    // ==================== Store mirroring ====================

    #[test]
    fn test_create_entry_lands_in_front_like_the_server() {
        let (mut doc, gid) = doc_with_group();
        let first = add_entry(&mut doc, &gid, t_plus(1));
        let second = add_entry(&mut doc, &gid, t_plus(2));
        let group = doc.group(&gid).unwrap();
        assert_eq!(group.entries[0].id, second);
        assert_eq!(group.volumes[0].entry_ids, vec![second, first]);
        assert_eq!(group.entries[0].title, NEW_ENTRY_TITLE);
        assert_eq!(group.updated_at, t_plus(2));
    }

    #[test]
    fn test_clone_lands_behind_source() {
        let (mut doc, gid) = doc_with_group();
        let older = add_entry(&mut doc, &gid, t_plus(1));
        let newer = add_entry(&mut doc, &gid, t_plus(2));
        let copy = apply_local(
            &mut doc,
            &Intent::CloneEntry {
                group_id: gid.clone(),
                entry_id: newer.clone(),
            },
            t_plus(3),
        )
        .unwrap();
        let group = doc.group(&gid).unwrap();
        assert_eq!(group.volumes[0].entry_ids, vec![newer, copy, older]);
    }

    #[test]
    fn test_update_entry_discards_stale_writes() {
        let (mut doc, gid) = doc_with_group();
        let eid = add_entry(&mut doc, &gid, t_plus(5));
        apply_local(
            &mut doc,
            &Intent::UpdateEntry {
                group_id: gid.clone(),
                entry_id: eid.clone(),
                title: None,
                content: Some("stale".to_string()),
                updated_at: t_plus(1),
            },
            t_plus(6),
        );
        assert_eq!(
            doc.group(&gid).unwrap().entry(&eid).unwrap().content,
            NEW_ENTRY_CONTENT
        );
    }

    #[test]
    fn test_delete_last_volume_respawns_temp_default() {
        let (mut doc, gid) = doc_with_group();
        let e1 = add_entry(&mut doc, &gid, t_plus(1));
        let vid = doc.group(&gid).unwrap().volumes[0].id.clone();
        apply_local(
            &mut doc,
            &Intent::DeleteVolume {
                group_id: gid.clone(),
                volume_id: vid.clone(),
            },
            t_plus(2),
        );
        let group = doc.group(&gid).unwrap();
        assert_eq!(group.volumes.len(), 1);
        assert_ne!(group.volumes[0].id, vid);
        assert!(temp_id::is_temp_volume(&group.volumes[0].id));
        assert_eq!(group.volumes[0].entry_ids, vec![e1]);
    }

    #[test]
    fn test_reorder_mirrors_permutation_rules() {
        let (mut doc, gid) = doc_with_group();
        let e1 = add_entry(&mut doc, &gid, t_plus(1));
        let e2 = add_entry(&mut doc, &gid, t_plus(2));
        let vid = doc.group(&gid).unwrap().volumes[0].id.clone();

        apply_local(
            &mut doc,
            &Intent::ReorderEntries {
                group_id: gid.clone(),
                volume_id: vid.clone(),
                new_order: vec![e1.clone(), "ghost".to_string()],
            },
            t_plus(3),
        );
        assert_eq!(
            doc.group(&gid).unwrap().volumes[0].entry_ids,
            vec![e2.clone(), e1.clone()],
            "non-permutation leaves order untouched"
        );

        apply_local(
            &mut doc,
            &Intent::ReorderEntries {
                group_id: gid.clone(),
                volume_id: vid,
                new_order: vec![e1.clone(), e2.clone()],
            },
            t_plus(4),
        );
        assert_eq!(doc.group(&gid).unwrap().volumes[0].entry_ids, vec![e1, e2]);
    }

    #[test]
    fn test_move_entry_across_volumes() {
        let (mut doc, gid) = doc_with_group();
        let eid = add_entry(&mut doc, &gid, t_plus(1));
        let side = apply_local(
            &mut doc,
            &Intent::CreateVolume {
                group_id: gid.clone(),
                title: "Side".to_string(),
            },
            t_plus(2),
        )
        .unwrap();
        let main = doc.group(&gid).unwrap().volumes[0].id.clone();
        apply_local(
            &mut doc,
            &Intent::MoveEntry {
                group_id: gid.clone(),
                from_volume_id: main,
                to_volume_id: side.clone(),
                entry_id: eid.clone(),
                to_index: 99,
            },
            t_plus(3),
        );
        let group = doc.group(&gid).unwrap();
        assert!(group.volumes[0].entry_ids.is_empty());
        assert_eq!(group.volume(&side).unwrap().entry_ids, vec![eid]);
    }

    // ==================== No-ops ====================

    #[test]
    fn test_missing_targets_mint_nothing() {
        let mut doc = Document::default();
        let before = doc.clone();
        assert!(apply_local(
            &mut doc,
            &Intent::CreateEntry {
                group_id: "ghost".to_string(),
                volume_id: None,
            },
            t0(),
        )
        .is_none());
        assert!(apply_local(
            &mut doc,
            &Intent::DeleteGroup {
                id: "ghost".to_string()
            },
            t0(),
        )
        .is_none());
        assert_eq!(doc, before);
    }

    #[test]
    fn test_rematerialize_duplicate_key_is_noop() {
        let (mut doc, gid) = doc_with_group();
        let vid = doc.group(&gid).unwrap().volumes[0].id.clone();
        let create = Intent::CreateEntryWithContent {
            group_id: gid.clone(),
            volume_id: vid,
            title: "Packing".to_string(),
            content: "socks".to_string(),
            created_at: t0(),
            updated_at: t0(),
        };
        assert!(apply_local(&mut doc, &create, t_plus(1)).is_some());
        assert!(apply_local(&mut doc, &create, t_plus(2)).is_none());
        assert_eq!(doc.group(&gid).unwrap().entries.len(), 1);
    }
}
