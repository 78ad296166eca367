//! Editor-side timing helpers.
//!
//! Pure state machines with injected clocks: the UI layer feeds in
//! monotonic milliseconds and acts on the returned decisions, so tests
//! drive time explicitly instead of sleeping.

use lanshare_core::Document;

/// An edit flushes immediately if this much time has passed since the
/// last flush.
pub const AUTOSAVE_THROTTLE_MS: u64 = 350;

/// Otherwise a trailing flush is scheduled this far out.
pub const AUTOSAVE_DEBOUNCE_MS: u64 = 600;

/// Remote content updates are held off this long after a local keystroke.
pub const CONTENT_SUPPRESSION_MS: u64 = 900;

/// Title edits settle faster than body edits.
pub const TITLE_SUPPRESSION_MS: u64 = 800;

/// Window after a drag-reorder during which an order-identical snapshot
/// is treated as our own echo and skipped for rendering.
pub const REORDER_ECHO_MS: u64 = 1000;

/// What to do with the edit that just happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutosaveDecision {
    /// Save right away. Any pending deferred flush is superseded and
    /// should be cancelled by the caller.
    FlushNow,
    /// Schedule (or reschedule) a trailing flush after `delay_ms`.
    Defer { delay_ms: u64 },
}

/// Leading-throttle-plus-trailing-debounce autosave.
///
/// The first edit in a quiet period flushes immediately; edits arriving
/// within [`AUTOSAVE_THROTTLE_MS`] of the last flush are coalesced into
/// one trailing flush [`AUTOSAVE_DEBOUNCE_MS`] later.
#[derive(Debug, Default)]
pub struct AutosavePolicy {
    last_flush_ms: Option<u64>,
}

impl AutosavePolicy {
    pub fn on_edit(&mut self, now_ms: u64) -> AutosaveDecision {
        match self.last_flush_ms {
            Some(last) if now_ms.saturating_sub(last) < AUTOSAVE_THROTTLE_MS => {
                AutosaveDecision::Defer {
                    delay_ms: AUTOSAVE_DEBOUNCE_MS,
                }
            }
            _ => {
                self.last_flush_ms = Some(now_ms);
                AutosaveDecision::FlushNow
            }
        }
    }

    /// Record that a deferred (trailing) flush actually ran.
    pub fn on_deferred_flush(&mut self, now_ms: u64) {
        self.last_flush_ms = Some(now_ms);
    }
}

/// Tracks the user's last keystroke so remote updates don't stomp an
/// editor mid-word.
#[derive(Debug, Default)]
pub struct TypingGuard {
    last_content_ms: Option<u64>,
    last_title_ms: Option<u64>,
}

impl TypingGuard {
    pub fn note_content_edit(&mut self, now_ms: u64) {
        self.last_content_ms = Some(now_ms);
    }

    pub fn note_title_edit(&mut self, now_ms: u64) {
        self.last_title_ms = Some(now_ms);
    }

    /// Should a remote content replacement be held back right now?
    pub fn suppress_content(&self, now_ms: u64) -> bool {
        matches!(self.last_content_ms, Some(last)
            if now_ms.saturating_sub(last) < CONTENT_SUPPRESSION_MS)
    }

    /// Should a remote title replacement be held back right now?
    pub fn suppress_title(&self, now_ms: u64) -> bool {
        matches!(self.last_title_ms, Some(last)
            if now_ms.saturating_sub(last) < TITLE_SUPPRESSION_MS)
    }
}

/// Remembers the last local drag-reorder so the snapshot it triggers can
/// be recognized as an echo.
#[derive(Debug, Default)]
pub struct ReorderEcho {
    last_reorder_ms: Option<u64>,
}

impl ReorderEcho {
    pub fn note_reorder(&mut self, now_ms: u64) {
        self.last_reorder_ms = Some(now_ms);
    }

    pub fn within_window(&self, now_ms: u64) -> bool {
        matches!(self.last_reorder_ms, Some(last)
            if now_ms.saturating_sub(last) < REORDER_ECHO_MS)
    }
}

/// True when two documents agree on every group, volume, and entry
/// ordering. Content differences are ignored.
pub fn same_order(a: &Document, b: &Document) -> bool {
    if a.groups.len() != b.groups.len() {
        return false;
    }
    a.groups.iter().zip(&b.groups).all(|(ga, gb)| {
        ga.id == gb.id
            && ga.volumes.len() == gb.volumes.len()
            && ga
                .volumes
                .iter()
                .zip(&gb.volumes)
                .all(|(va, vb)| va.id == vb.id && va.entry_ids == vb.entry_ids)
    })
}

/// Remap a caret byte offset in `old` to the equivalent offset in `new`.
///
/// The two texts are assumed to differ in one contiguous region.
/// Offsets before the region are unchanged, offsets after it shift by
/// the region's size delta, and offsets inside it clamp to the region's
/// new end. The result always lands on a char boundary of `new`.
pub fn remap_caret(old: &str, new: &str, caret: usize) -> usize {
    if old == new {
        return caret.min(new.len());
    }

    let caret = caret.min(old.len());
    let prefix = common_prefix_bytes(old, new);
    let max_suffix = old.len().min(new.len()) - prefix;
    let suffix = common_suffix_bytes(old, new, max_suffix);

    let old_end = old.len() - suffix;
    let new_end = new.len() - suffix;

    let mut pos = if caret <= prefix {
        caret
    } else if caret >= old_end {
        caret - old_end + new_end
    } else {
        new_end
    };
    while pos > 0 && !new.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn common_prefix_bytes(old: &str, new: &str) -> usize {
    let mut len = 0;
    let mut new_chars = new.chars();
    for c in old.chars() {
        if new_chars.next() == Some(c) {
            len += c.len_utf8();
        } else {
            break;
        }
    }
    len
}

fn common_suffix_bytes(old: &str, new: &str, max: usize) -> usize {
    let mut len = 0;
    let mut new_chars = new.chars().rev();
    for c in old.chars().rev() {
        let add = c.len_utf8();
        if len + add > max {
            break;
        }
        if new_chars.next() == Some(c) {
            len += add;
        } else {
            break;
        }
    }
    len
}
