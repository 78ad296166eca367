//! Client-minted placeholder ids.
//!
//! The creation protocol never lets a client propose a permanent id, so
//! entities created while offline carry ids minted from a prefix plus a
//! millisecond timestamp. These ids live only until the reconciler matches
//! them to the server-assigned entity and retires them; they are never
//! persisted as permanent identity.

/// Prefix for groups created offline.
pub const GROUP_PREFIX: &str = "temp-group-";
/// Prefix for volumes created offline.
pub const VOLUME_PREFIX: &str = "temp-vol-";
/// Prefix for entries created offline through the plain create path.
pub const ENTRY_PREFIX: &str = "temp-";
/// Prefix for entries created offline by cloning an existing entry.
pub const CLONE_PREFIX: &str = "temp-clone-";
/// Prefix for entries created offline by inserting at an anchor.
pub const INSERT_PREFIX: &str = "temp-insert-";

pub fn mint_group(now_ms: u64) -> String {
    format!("{GROUP_PREFIX}{now_ms}")
}

pub fn mint_volume(now_ms: u64) -> String {
    format!("{VOLUME_PREFIX}{now_ms}")
}

pub fn mint_entry(now_ms: u64) -> String {
    format!("{ENTRY_PREFIX}{now_ms}")
}

pub fn mint_clone(now_ms: u64) -> String {
    format!("{CLONE_PREFIX}{now_ms}")
}

pub fn mint_insert(now_ms: u64) -> String {
    format!("{INSERT_PREFIX}{now_ms}")
}

/// True for any client-minted id, regardless of entity kind.
pub fn is_temp(id: &str) -> bool {
    id.starts_with(ENTRY_PREFIX)
}

pub fn is_temp_group(id: &str) -> bool {
    id.starts_with(GROUP_PREFIX)
}

pub fn is_temp_volume(id: &str) -> bool {
    id.starts_with(VOLUME_PREFIX)
}

/// True for entry ids minted by any of the offline create paths.
///
/// All temp prefixes share `temp-`, so entry classification is "temp but
/// neither a group nor a volume".
pub fn is_temp_entry(id: &str) -> bool {
    is_temp(id) && !is_temp_group(id) && !is_temp_volume(id)
}
