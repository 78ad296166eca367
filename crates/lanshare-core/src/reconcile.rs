//! Temp-entity reconciliation.
//!
//! Clients cannot propose permanent ids, so entities created offline carry
//! temp ids with no relationship to the ids the server eventually mints.
//! When the queued creates replay, the next `full_sync` arrives with real
//! ids and no linkage back. This module closes the loop: it matches temp
//! entities onto server entities by content, re-sends creation intents
//! (cooldown-bounded) for anything the server still lacks, keeps pending
//! temp entities visible so offline work never disappears mid-sync, and
//! reports completed `temp → real` migrations so callers can rewrite
//! selections and overlays.
//!
//! Matching is best-effort by construction: two entries sharing a title and
//! creation time are indistinguishable, and the algorithm may adopt the
//! wrong one. Unresolvable temp entities stay pending and visible forever
//! rather than corrupting anything else.

use crate::model::{Document, Entry, Group, Timestamp};
use crate::protocol::Intent;
use crate::retry::{EntityKind, RetryGate};
use crate::temp_id;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// The pseudo-identity used to match a temp entry onto its server-created
/// counterpart: title plus creation time, the only fields stable across the
/// create round-trip. All matching goes through this type so the strategy
/// can be swapped in one place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationKey {
    title: String,
    created_at: Timestamp,
}

impl ReconciliationKey {
    pub fn new(title: &str, created_at: Timestamp) -> Self {
        Self {
            title: title.to_string(),
            created_at,
        }
    }

    pub fn of(entry: &Entry) -> Self {
        Self::new(&entry.title, entry.created_at)
    }
}

impl fmt::Display for ReconciliationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@@{}",
            self.title,
            self.created_at
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        )
    }
}

/// Completed `temp id → real id` migrations from one reconcile pass.
///
/// Consumers apply this to anything that might still hold a temp id:
/// selection pointers, the order overlay, scroll anchors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdRemap {
    pub groups: HashMap<String, String>,
    pub volumes: HashMap<String, String>,
    pub entries: HashMap<String, String>,
}

impl IdRemap {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.volumes.is_empty() && self.entries.is_empty()
    }

    pub fn resolve_group(&self, id: &str) -> String {
        self.groups.get(id).cloned().unwrap_or_else(|| id.to_string())
    }

    pub fn resolve_entry(&self, id: &str) -> String {
        self.entries.get(id).cloned().unwrap_or_else(|| id.to_string())
    }
}

/// Result of reconciling one incoming snapshot.
#[derive(Debug)]
pub struct ReconcileOutcome {
    /// The snapshot to commit: server truth plus still-pending temp
    /// entities synthesized back in.
    pub document: Document,
    /// Cooldown-gated intents to send (re-creates, cleanup, reordering).
    pub outgoing: Vec<Intent>,
    /// Migrations completed in this pass.
    pub remap: IdRemap,
}

#[derive(Debug, Default)]
struct TempGroupRecord {
    real_id: Option<String>,
}

/// Per-client reconciliation state, fed every incoming `full_sync`.
#[derive(Debug, Default)]
pub struct Reconciler {
    groups: HashMap<String, TempGroupRecord>,
    gate: RetryGate,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile local state against an incoming snapshot.
    ///
    /// `local` is the client's current (possibly temp-bearing) document,
    /// `incoming` the snapshot as broadcast by the server. The clock is an
    /// injected millisecond value so cooldowns are deterministic in tests.
    pub fn reconcile(
        &mut self,
        local: &Document,
        incoming: Document,
        now_ms: u64,
    ) -> ReconcileOutcome {
        let mut merged = incoming;
        let mut outgoing = Vec::new();
        let mut remap = IdRemap::default();

        // Records for temp groups the user has since deleted locally must
        // not keep claiming server groups.
        self.groups
            .retain(|temp_id, _| local.groups.iter().any(|g| g.id == *temp_id));

        for lg in local.groups.iter().filter(|g| temp_id::is_temp_group(&g.id)) {
            let real_id = self.resolve_group_id(lg.title.as_str(), &lg.id, &merged, &remap);
            let adopted = match real_id {
                Some(rid) => match merged.group(&rid).cloned() {
                    Some(rg) => Some((rid, rg)),
                    None => {
                        // The adopted group vanished from the snapshot
                        // (deleted on the server). Unclaim and start over.
                        if let Some(record) = self.groups.get_mut(&lg.id) {
                            record.real_id = None;
                        }
                        None
                    }
                },
                None => None,
            };

            let Some((real_id, rg)) = adopted else {
                // No server counterpart; ask again past the cooldown and
                // keep the offline group on screen.
                if self.gate.should_attempt(EntityKind::Group, &lg.id, now_ms) {
                    debug!(temp = %lg.id, "re-sending create_group");
                    outgoing.push(Intent::CreateGroup {
                        title: lg.title.clone(),
                        tags: lg.tags.clone(),
                    });
                }
                merged.groups.insert(0, lg.clone());
                continue;
            };

            let desired_titles: Vec<&str> = lg.volumes.iter().map(|v| v.title.as_str()).collect();
            let missing_titles: Vec<&str> = desired_titles
                .iter()
                .filter(|t| rg.volume_by_title(t).is_none())
                .copied()
                .collect();
            for title in &missing_titles {
                let key = format!("{}/{}", lg.id, title);
                if self.gate.should_attempt(EntityKind::Volume, &key, now_ms) {
                    outgoing.push(Intent::CreateVolume {
                        group_id: real_id.clone(),
                        title: (*title).to_string(),
                    });
                }
            }

            // Server volumes the client never asked for (the auto-created
            // default, typically) are cleaned up as soon as at least one
            // desired volume exists to receive focus.
            let undesired: Vec<&str> = rg
                .volumes
                .iter()
                .filter(|v| !desired_titles.contains(&v.title.as_str()))
                .map(|v| v.id.as_str())
                .collect();
            let any_desired_present = desired_titles
                .iter()
                .any(|t| rg.volume_by_title(t).is_some());
            if any_desired_present {
                for volume_id in &undesired {
                    let key = format!("{real_id}/{volume_id}");
                    if self
                        .gate
                        .should_attempt(EntityKind::VolumeCleanup, &key, now_ms)
                    {
                        outgoing.push(Intent::DeleteVolume {
                            group_id: real_id.clone(),
                            volume_id: (*volume_id).to_string(),
                        });
                    }
                }
            }

            // Restore the client's intended volume order once the real
            // group holds exactly the desired volumes.
            if missing_titles.is_empty() && undesired.is_empty() {
                let desired_order: Vec<String> = lg
                    .volumes
                    .iter()
                    .filter_map(|v| rg.volume_by_title(&v.title).map(|rv| rv.id.clone()))
                    .collect();
                let current_order: Vec<String> =
                    rg.volumes.iter().map(|v| v.id.clone()).collect();
                if desired_order != current_order
                    && self
                        .gate
                        .should_attempt(EntityKind::VolumeOrder, &real_id, now_ms)
                {
                    outgoing.push(Intent::ReorderVolumes {
                        group_id: real_id.clone(),
                        new_order: desired_order,
                    });
                }
            }

            // Entries, matched by reconciliation key.
            let mut all_materialized = true;
            for le in &lg.entries {
                let key = ReconciliationKey::of(le);
                if rg.entries.iter().any(|e| ReconciliationKey::of(e) == key) {
                    continue;
                }
                all_materialized = false;
                let volume_id = lg
                    .volume_containing(&le.id)
                    .and_then(|tv| rg.volume_by_title(&tv.title))
                    .or_else(|| rg.volumes.first())
                    .map(|v| v.id.clone())
                    .unwrap_or_default();
                if self
                    .gate
                    .should_attempt(EntityKind::Entry, &key.to_string(), now_ms)
                {
                    outgoing.push(Intent::CreateEntryWithContent {
                        group_id: real_id.clone(),
                        volume_id,
                        title: le.title.clone(),
                        content: le.content.clone(),
                        created_at: le.created_at,
                        updated_at: le.updated_at,
                    });
                }
            }

            if missing_titles.is_empty() && all_materialized {
                // Fully migrated: report the remap and retire the record.
                remap.groups.insert(lg.id.clone(), real_id.clone());
                for lv in &lg.volumes {
                    if temp_id::is_temp_volume(&lv.id) {
                        if let Some(rv) = rg.volume_by_title(&lv.title) {
                            remap.volumes.insert(lv.id.clone(), rv.id.clone());
                        }
                    }
                }
                for le in &lg.entries {
                    if temp_id::is_temp_entry(&le.id) {
                        let key = ReconciliationKey::of(le);
                        if let Some(re) = rg
                            .entries
                            .iter()
                            .find(|e| ReconciliationKey::of(e) == key)
                        {
                            remap.entries.insert(le.id.clone(), re.id.clone());
                        }
                    }
                }
                debug!(temp = %lg.id, real = %real_id, "temp group fully migrated");
                self.groups.remove(&lg.id);
                self.gate.forget(EntityKind::Group, &lg.id);
                self.gate.forget(EntityKind::VolumeOrder, &real_id);
            } else {
                merged.groups.insert(0, lg.clone());
            }
        }

        // Temp volumes and entries living inside real groups (created
        // offline against a group the server already knows).
        for lg in local.groups.iter().filter(|g| !temp_id::is_temp_group(&g.id)) {
            self.reconcile_real_group(lg, &mut merged, &mut outgoing, &mut remap, now_ms);
        }

        self.gate.prune(now_ms);
        ReconcileOutcome {
            document: merged,
            outgoing,
            remap,
        }
    }

    /// Adopt a server group for a temp group by title, first-come
    /// first-claimed across temp groups. Groups that finished migrating
    /// earlier in the same pass count as claimed too.
    fn resolve_group_id(
        &mut self,
        title: &str,
        temp_group_id: &str,
        merged: &Document,
        remap: &IdRemap,
    ) -> Option<String> {
        if let Some(real) = self
            .groups
            .get(temp_group_id)
            .and_then(|r| r.real_id.clone())
        {
            return Some(real);
        }
        let claimed: Vec<&str> = self
            .groups
            .values()
            .filter_map(|r| r.real_id.as_deref())
            .chain(remap.groups.values().map(String::as_str))
            .collect();
        let found = merged
            .groups
            .iter()
            .find(|g| {
                !temp_id::is_temp(&g.id) && g.title == title && !claimed.contains(&g.id.as_str())
            })
            .map(|g| g.id.clone());
        let record = self.groups.entry(temp_group_id.to_string()).or_default();
        record.real_id = found.clone();
        found
    }

    fn reconcile_real_group(
        &mut self,
        lg: &Group,
        merged: &mut Document,
        outgoing: &mut Vec<Intent>,
        remap: &mut IdRemap,
        now_ms: u64,
    ) {
        let Some(mg) = merged.group_mut(&lg.id) else {
            // Group deleted on the server; its pending temp children go
            // with it.
            return;
        };

        for lv in lg.volumes.iter().filter(|v| temp_id::is_temp_volume(&v.id)) {
            if let Some(rv) = mg.volume_by_title(&lv.title) {
                remap.volumes.insert(lv.id.clone(), rv.id.clone());
            } else {
                mg.volumes.push(lv.clone());
                let key = format!("{}/{}", lg.id, lv.title);
                if self.gate.should_attempt(EntityKind::Volume, &key, now_ms) {
                    outgoing.push(Intent::CreateVolume {
                        group_id: lg.id.clone(),
                        title: lv.title.clone(),
                    });
                }
            }
        }

        for le in lg.entries.iter().filter(|e| temp_id::is_temp_entry(&e.id)) {
            let key = ReconciliationKey::of(le);
            if let Some(re) = mg
                .entries
                .iter()
                .find(|e| !temp_id::is_temp_entry(&e.id) && ReconciliationKey::of(e) == key)
            {
                remap.entries.insert(le.id.clone(), re.id.clone());
                self.gate.forget(EntityKind::Entry, &key.to_string());
                continue;
            }

            // Still pending: keep it on screen in its resolved volume.
            let local_volume = lg.volume_containing(&le.id);
            let visible_volume_id = local_volume.and_then(|tv| {
                if mg.volume(&tv.id).is_some() {
                    Some(tv.id.clone())
                } else {
                    mg.volume_by_title(&tv.title).map(|v| v.id.clone())
                }
            });
            mg.entries.insert(0, le.clone());
            let slot = visible_volume_id
                .and_then(|vid| mg.volumes.iter().position(|v| v.id == vid))
                .unwrap_or(0);
            if let Some(volume) = mg.volumes.get_mut(slot) {
                if !volume.entry_ids.iter().any(|id| *id == le.id) {
                    volume.entry_ids.insert(0, le.id.clone());
                }
            }

            // The re-sent create must name a volume the server knows.
            let send_volume_id = local_volume
                .and_then(|tv| mg.volume_by_title(&tv.title))
                .filter(|v| !temp_id::is_temp(&v.id))
                .or_else(|| mg.volumes.iter().find(|v| !temp_id::is_temp(&v.id)))
                .map(|v| v.id.clone())
                .unwrap_or_default();
            if self
                .gate
                .should_attempt(EntityKind::Entry, &key.to_string(), now_ms)
            {
                outgoing.push(Intent::CreateEntryWithContent {
                    group_id: lg.id.clone(),
                    volume_id: send_volume_id,
                    title: le.title.clone(),
                    content: le.content.clone(),
                    created_at: le.created_at,
                    updated_at: le.updated_at,
                });
            }
        }
    }
}
