//! Local cache of the last-known world, keyed by server endpoint.
//!
//! Each endpoint gets one JSON file holding the last snapshot, the offline
//! queue, and the order overlay, so a client restarted while the server is
//! unreachable still renders its notes and keeps its pending edits.

use lanshare_core::{Document, OfflineQueue, OrderOverlay};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] io::Error),
    #[error("cache encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Everything a client persists per endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachedState {
    pub snapshot: Document,
    pub queue: OfflineQueue,
    pub overlay: OrderOverlay,
}

/// Per-endpoint cache files in a single directory.
#[derive(Debug, Clone)]
pub struct ClientCache {
    dir: PathBuf,
}

impl ClientCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Cache file for an endpoint like `192.168.1.5:8081`.
    fn file_for(&self, endpoint: &str) -> PathBuf {
        let sanitized: String = endpoint
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' {
                    c
                } else {
                    '-'
                }
            })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }

    /// Load the cached state for an endpoint.
    ///
    /// A missing file is a fresh state; an unparseable one is discarded
    /// with a warning rather than blocking startup.
    pub fn load(&self, endpoint: &str) -> Result<CachedState, CacheError> {
        let path = self.file_for(endpoint);
        if !path.exists() {
            return Ok(CachedState::default());
        }

        let contents = fs::read_to_string(&path)?;
        match serde_json::from_str(&contents) {
            Ok(state) => Ok(state),
            Err(e) => {
                warn!("Failed to parse cache {:?} ({}), starting fresh", path, e);
                Ok(CachedState::default())
            }
        }
    }

    /// Write the cached state for an endpoint.
    ///
    /// Writes to a sibling temp file and renames over the target so a crash
    /// mid-write never leaves a truncated cache.
    pub fn save(&self, endpoint: &str, state: &CachedState) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        let contents = serde_json::to_string_pretty(state)?;
        let path = self.file_for(endpoint);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use lanshare_core::{Group, Intent, Volume};
    use tempfile::TempDir;

    fn ts() -> DateTime<Utc> {
        "2024-05-01T10:00:00Z".parse().unwrap()
    }

    fn sample_state() -> CachedState {
        let mut state = CachedState::default();
        state.snapshot.groups.push(Group {
            id: "temp-group-1".to_string(),
            title: "Trip Notes".to_string(),
            tags: vec![],
            entries: vec![],
            volumes: vec![Volume {
                id: "temp-vol-1".to_string(),
                title: "Default".to_string(),
                entry_ids: vec![],
            }],
            created_at: ts(),
            updated_at: ts(),
        });
        state.queue.push(
            Intent::CreateGroup {
                title: "Trip Notes".to_string(),
                tags: vec![],
            },
            ts(),
        );
        state
            .overlay
            .record_volume_order("temp-group-1", vec!["temp-vol-1".to_string()]);
        state
    }

    // ==================== Load / save ====================

    #[test]
    fn test_missing_cache_loads_fresh_state() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ClientCache::new(temp_dir.path());

        let state = cache.load("192.168.1.5:8081").unwrap();
        assert_eq!(state, CachedState::default());
    }

    #[test]
    fn test_save_and_reload_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ClientCache::new(temp_dir.path());

        let state = sample_state();
        cache.save("192.168.1.5:8081", &state).unwrap();

        let loaded = cache.load("192.168.1.5:8081").unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_corrupt_cache_starts_fresh() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ClientCache::new(temp_dir.path());

        cache.save("host:1", &sample_state()).unwrap();
        fs::write(cache.file_for("host:1"), "{broken").unwrap();

        let state = cache.load("host:1").unwrap();
        assert_eq!(state, CachedState::default());
    }

    #[test]
    fn test_save_replaces_file_without_leaving_temp() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ClientCache::new(temp_dir.path());

        cache.save("host:1", &sample_state()).unwrap();
        cache.save("host:1", &CachedState::default()).unwrap();

        let tmp = cache.file_for("host:1").with_extension("json.tmp");
        assert!(!tmp.exists(), "temp file is renamed over the target");
        assert_eq!(cache.load("host:1").unwrap(), CachedState::default());
    }

    #[test]
    fn test_stale_temp_from_interrupted_write_is_ignored() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ClientCache::new(temp_dir.path());

        let state = sample_state();
        cache.save("host:1", &state).unwrap();
        // A crash between write and rename leaves a half-written sibling.
        let tmp = cache.file_for("host:1").with_extension("json.tmp");
        fs::write(&tmp, "{\"snapshot\":").unwrap();

        assert_eq!(cache.load("host:1").unwrap(), state);
        cache.save("host:1", &state).unwrap();
        assert_eq!(cache.load("host:1").unwrap(), state);
    }

    #[test]
    fn test_endpoints_get_separate_files() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ClientCache::new(temp_dir.path());

        cache.save("192.168.1.5:8081", &sample_state()).unwrap();
        cache.save("192.168.1.6:8081", &CachedState::default()).unwrap();

        let a = cache.load("192.168.1.5:8081").unwrap();
        let b = cache.load("192.168.1.6:8081").unwrap();
        assert_eq!(a.queue.len(), 1);
        assert!(b.queue.is_empty());
    }

    #[test]
    fn test_endpoint_sanitized_into_filename() {
        let temp_dir = TempDir::new().unwrap();
        let cache = ClientCache::new(temp_dir.path());

        let path = cache.file_for("192.168.1.5:8081");
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert_eq!(name, "192.168.1.5-8081.json");
        assert!(!name.contains(':'), "no separator characters in filenames");
    }
}
