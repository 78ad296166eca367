//! Client-desired orderings that must survive full-state broadcasts.
//!
//! A `full_sync` replaces the client's world wholesale, which would discard
//! any reorder performed locally but not yet round-tripped. The overlay
//! remembers the orders the user asked for, re-imposes them on every incoming
//! snapshot, and emits corrective reorder intents so the server eventually
//! converges to the client's view. It is persisted with the endpoint cache so
//! offline reorders survive restarts.

use crate::model::Document;
use crate::protocol::Intent;
use crate::reconcile::IdRemap;
use crate::temp_id;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Desired presentation order, keyed by group (volumes) and group+volume
/// (entries within a volume).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderOverlay {
    pub volume_order: HashMap<String, Vec<String>>,
    pub entry_order: HashMap<String, HashMap<String, Vec<String>>>,
}

/// Keep the ids the client wants, in the client's order, restricted to what
/// actually exists; everything else the server knows follows in server order.
pub fn merge_ids(desired: &[String], present: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();
    for id in desired {
        if present.contains(id) && !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    for id in present {
        if !merged.contains(id) {
            merged.push(id.clone());
        }
    }
    merged
}

impl OrderOverlay {
    /// Record the order a reorder gesture asked for.
    pub fn record_volume_order(&mut self, group_id: &str, order: Vec<String>) {
        self.volume_order.insert(group_id.to_string(), order);
    }

    pub fn record_entry_order(&mut self, group_id: &str, volume_id: &str, order: Vec<String>) {
        self.entry_order
            .entry(group_id.to_string())
            .or_default()
            .insert(volume_id.to_string(), order);
    }

    /// Rewrite retired temp ids to their server-assigned replacements, in
    /// both map keys and ordered sequences.
    pub fn apply_remap(&mut self, remap: &IdRemap) {
        if remap.is_empty() {
            return;
        }
        self.volume_order = self
            .volume_order
            .drain()
            .map(|(group, mut order)| {
                for id in &mut order {
                    if let Some(real) = remap.volumes.get(id.as_str()) {
                        *id = real.clone();
                    }
                }
                (remap.resolve_group(&group), order)
            })
            .collect();
        self.entry_order = self
            .entry_order
            .drain()
            .map(|(group, volumes)| {
                let volumes = volumes
                    .into_iter()
                    .map(|(volume, mut order)| {
                        for id in &mut order {
                            if let Some(real) = remap.entries.get(id.as_str()) {
                                *id = real.clone();
                            }
                        }
                        (
                            remap
                                .volumes
                                .get(volume.as_str())
                                .cloned()
                                .unwrap_or(volume),
                            order,
                        )
                    })
                    .collect();
                (remap.resolve_group(&group), volumes)
            })
            .collect();
    }

    /// Re-impose desired orders on an incoming snapshot.
    ///
    /// The snapshot is reordered in place. The returned intents are the
    /// corrective reorders for groups/volumes whose server-side order still
    /// differs from the client's desired order; they are only produced for
    /// fully real entities (temp placeholders have nothing to correct on the
    /// server yet) and never contain temp ids. Also prunes overlay records
    /// whose group or volume no longer exists.
    pub fn merge(&mut self, doc: &mut Document) -> Vec<Intent> {
        let mut corrective = Vec::new();

        let group_ids: Vec<String> = self.volume_order.keys().cloned().collect();
        for group_id in group_ids {
            let Some(group) = doc.group_mut(&group_id) else {
                self.volume_order.remove(&group_id);
                continue;
            };
            let Some(desired) = self.volume_order.get(&group_id) else {
                continue;
            };
            let present: Vec<String> = group.volumes.iter().map(|v| v.id.clone()).collect();
            let server_raw: Vec<String> = present
                .iter()
                .filter(|id| !temp_id::is_temp(id))
                .cloned()
                .collect();
            let merged = merge_ids(desired, &present);
            group
                .volumes
                .sort_by_key(|v| merged.iter().position(|id| *id == v.id));
            let real_merged: Vec<String> = merged
                .iter()
                .filter(|id| !temp_id::is_temp(id))
                .cloned()
                .collect();
            if !temp_id::is_temp_group(&group_id) && real_merged != server_raw {
                corrective.push(Intent::ReorderVolumes {
                    group_id: group_id.clone(),
                    new_order: real_merged,
                });
            }
            self.volume_order.insert(group_id, merged);
        }

        let group_ids: Vec<String> = self.entry_order.keys().cloned().collect();
        for group_id in group_ids {
            let Some(group) = doc.group_mut(&group_id) else {
                self.entry_order.remove(&group_id);
                continue;
            };
            let Some(volumes) = self.entry_order.get_mut(&group_id) else {
                continue;
            };
            let volume_ids: Vec<String> = volumes.keys().cloned().collect();
            for volume_id in volume_ids {
                let Some(volume) = group.volume_mut(&volume_id) else {
                    volumes.remove(&volume_id);
                    continue;
                };
                let Some(desired) = volumes.get(&volume_id) else {
                    continue;
                };
                let present = volume.entry_ids.clone();
                let server_raw: Vec<String> = present
                    .iter()
                    .filter(|id| !temp_id::is_temp(id))
                    .cloned()
                    .collect();
                let merged = merge_ids(desired, &present);
                volume.entry_ids = merged.clone();
                let real_merged: Vec<String> = merged
                    .iter()
                    .filter(|id| !temp_id::is_temp(id))
                    .cloned()
                    .collect();
                if !temp_id::is_temp_group(&group_id)
                    && !temp_id::is_temp_volume(&volume_id)
                    && real_merged != server_raw
                {
                    corrective.push(Intent::ReorderEntries {
                        group_id: group_id.clone(),
                        volume_id: volume_id.clone(),
                        new_order: real_merged,
                    });
                }
                volumes.insert(volume_id, merged);
            }
            if volumes.is_empty() {
                self.entry_order.remove(&group_id);
            }
        }

        corrective
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Group, Timestamp, Volume};

    fn ts() -> Timestamp {
        "2024-05-01T10:00:00Z".parse().unwrap()
    }

    fn volume(id: &str, entry_ids: &[&str]) -> Volume {
        Volume {
            id: id.to_string(),
            title: id.to_string(),
            entry_ids: entry_ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn doc_with_volumes(group_id: &str, volumes: Vec<Volume>) -> Document {
        Document {
            groups: vec![Group {
                id: group_id.to_string(),
                title: "G".to_string(),
                tags: vec![],
                entries: vec![],
                volumes,
                created_at: ts(),
                updated_at: ts(),
            }],
            tags: vec![],
            shares: vec![],
        }
    }

    fn ids(volumes: &[Volume]) -> Vec<&str> {
        volumes.iter().map(|v| v.id.as_str()).collect()
    }

    fn owned(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    // ==================== merge_ids ====================

    #[test]
    fn test_merge_keeps_desired_order_and_appends_server_extras() {
        let merged = merge_ids(&owned(&["a", "b", "c"]), &owned(&["b", "d", "a"]));
        assert_eq!(merged, owned(&["a", "b", "d"]));
    }

    #[test]
    fn test_merge_with_empty_desired_is_server_order() {
        let merged = merge_ids(&[], &owned(&["x", "y"]));
        assert_eq!(merged, owned(&["x", "y"]));
    }

    #[test]
    fn test_merge_is_stable_when_orders_agree() {
        let order = owned(&["a", "b"]);
        assert_eq!(merge_ids(&order, &order), order);
    }

    // ==================== Volume merging ====================

    #[test]
    fn test_overlay_reorders_incoming_volumes() {
        let mut overlay = OrderOverlay::default();
        overlay.record_volume_order("g1", owned(&["v2", "v1"]));
        let mut doc = doc_with_volumes("g1", vec![volume("v1", &[]), volume("v2", &[])]);

        let corrective = overlay.merge(&mut doc);
        assert_eq!(ids(&doc.groups[0].volumes), vec!["v2", "v1"]);
        assert_eq!(
            corrective,
            vec![Intent::ReorderVolumes {
                group_id: "g1".to_string(),
                new_order: owned(&["v2", "v1"]),
            }]
        );
    }

    #[test]
    fn test_no_corrective_when_orders_already_agree() {
        let mut overlay = OrderOverlay::default();
        overlay.record_volume_order("g1", owned(&["v1", "v2"]));
        let mut doc = doc_with_volumes("g1", vec![volume("v1", &[]), volume("v2", &[])]);
        assert!(overlay.merge(&mut doc).is_empty());
    }

    #[test]
    fn test_overlay_prunes_deleted_groups() {
        let mut overlay = OrderOverlay::default();
        overlay.record_volume_order("gone", owned(&["v1"]));
        overlay.record_entry_order("gone", "v1", owned(&["e1"]));
        let mut doc = Document::default();
        overlay.merge(&mut doc);
        assert!(overlay.volume_order.is_empty());
        assert!(overlay.entry_order.is_empty());
    }

    // ==================== Entry merging ====================

    #[test]
    fn test_entry_overlay_survives_snapshot_clobber() {
        let mut overlay = OrderOverlay::default();
        overlay.record_entry_order("g1", "v1", owned(&["e3", "e1", "e2"]));
        // Server broadcasts its own idea of the order, plus a new entry e4.
        let mut doc = doc_with_volumes("g1", vec![volume("v1", &["e1", "e2", "e3", "e4"])]);

        let corrective = overlay.merge(&mut doc);
        assert_eq!(
            doc.groups[0].volumes[0].entry_ids,
            owned(&["e3", "e1", "e2", "e4"])
        );
        assert_eq!(
            corrective,
            vec![Intent::ReorderEntries {
                group_id: "g1".to_string(),
                volume_id: "v1".to_string(),
                new_order: owned(&["e3", "e1", "e2", "e4"]),
            }]
        );
        // The recomputed overlay now includes the appended id.
        assert_eq!(
            overlay.entry_order["g1"]["v1"],
            owned(&["e3", "e1", "e2", "e4"])
        );
    }

    #[test]
    fn test_pending_temp_ids_are_kept_but_never_sent() {
        let mut overlay = OrderOverlay::default();
        overlay.record_entry_order("g1", "v1", owned(&["temp-100", "e1"]));
        // The reconciler kept the pending temp entry visible in the volume.
        let mut doc = doc_with_volumes("g1", vec![volume("v1", &["temp-100", "e1", "e2"])]);

        let corrective = overlay.merge(&mut doc);
        assert_eq!(
            doc.groups[0].volumes[0].entry_ids,
            owned(&["temp-100", "e1", "e2"])
        );
        // Ignoring the temp id, local and server order agree, so nothing is
        // sent; a corrective here would have mentioned an id the server
        // cannot know.
        assert!(corrective.is_empty());
    }

    #[test]
    fn test_unmaterialized_temp_ids_are_dropped() {
        let mut overlay = OrderOverlay::default();
        overlay.record_entry_order("g1", "v1", owned(&["temp-999", "e1"]));
        // Server snapshot without the temp entry and nothing kept it visible.
        let mut doc = doc_with_volumes("g1", vec![volume("v1", &["e1"])]);
        overlay.merge(&mut doc);
        assert_eq!(overlay.entry_order["g1"]["v1"], owned(&["e1"]));
    }

    #[test]
    fn test_temp_group_produces_no_corrective_traffic() {
        let mut overlay = OrderOverlay::default();
        overlay.record_volume_order("temp-group-5", owned(&["temp-vol-2", "temp-vol-1"]));
        let mut doc = doc_with_volumes(
            "temp-group-5",
            vec![volume("temp-vol-1", &[]), volume("temp-vol-2", &[])],
        );
        let corrective = overlay.merge(&mut doc);
        assert!(corrective.is_empty());
        assert_eq!(
            ids(&doc.groups[0].volumes),
            vec!["temp-vol-2", "temp-vol-1"]
        );
    }

    // ==================== Remapping ====================

    #[test]
    fn test_apply_remap_rewrites_keys_and_sequences() {
        let mut overlay = OrderOverlay::default();
        overlay.record_volume_order("temp-group-5", owned(&["temp-vol-1", "v-real"]));
        overlay.record_entry_order("temp-group-5", "temp-vol-1", owned(&["temp-7", "e-real"]));

        let mut remap = IdRemap::default();
        remap.groups.insert("temp-group-5".to_string(), "G".to_string());
        remap.volumes.insert("temp-vol-1".to_string(), "V".to_string());
        remap.entries.insert("temp-7".to_string(), "E".to_string());
        overlay.apply_remap(&remap);

        assert_eq!(overlay.volume_order["G"], owned(&["V", "v-real"]));
        assert_eq!(overlay.entry_order["G"]["V"], owned(&["E", "e-real"]));
    }
}
