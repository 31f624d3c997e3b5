//! Persisted event stamps used to throttle low-value recurring events.
//!
//! The cache record is a small JSON file mapping event keys to absolute
//! expiry times (seconds since the epoch). It is loaded, mutated and saved
//! explicitly on each use. There is no cross-process locking: two
//! simultaneous runs may both pass an expired deadline and both emit the
//! event, which is acceptable for metric deduplication.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecycleContext;

pub const TIMEZONE_KEY: &str = "rcc.cli.tz";

/// One day, in seconds.
pub const DAILY: i64 = 60 * 60 * 24;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheRecord {
    #[serde(default)]
    stamps: BTreeMap<String, i64>,
    /// Other sections of the shared cache file, kept as found.
    #[serde(flatten)]
    other: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
pub struct StampCache {
    path: PathBuf,
    record: CacheRecord,
}

impl StampCache {
    /// Load the record at `path`. A missing file is an empty cache; an
    /// unparsable one is discarded with a warning.
    pub fn load(path: &Path) -> Result<Self> {
        let record = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("[stamps] Discarding unreadable cache {:?}: {}", path, e);
                CacheRecord::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheRecord::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read cache {:?}", path));
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            record,
        })
    }

    pub fn get(&self, key: &str) -> Option<i64> {
        self.record.stamps.get(key).copied()
    }

    pub fn set(&mut self, key: &str, deadline: i64) {
        self.record.stamps.insert(key.to_string(), deadline);
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let json = serde_json::to_string_pretty(&self.record)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write cache {:?}", self.path))
    }
}

/// Run `event` at most once per day for `key`.
///
/// Returns whether the event ran. The deadline is stored before the event
/// runs and the cache is saved afterwards; a save failure is returned even
/// though the event already happened.
pub fn daily_throttle<F: FnOnce()>(cache_path: &Path, key: &str, now: i64, event: F) -> Result<bool> {
    let mut cache = StampCache::load(cache_path)?;
    if let Some(deadline) = cache.get(key) {
        if deadline > now {
            debug!("[stamps] {} throttled until {}", key, deadline);
            return Ok(false);
        }
    }
    cache.set(key, now + DAILY);
    event();
    cache.save()?;
    Ok(true)
}

/// Local UTC offset, e.g. `+0200`.
pub fn local_zone() -> String {
    chrono::Local::now().format("%z").to_string()
}

/// Report the local timezone, at most once per day.
pub fn timezone_metric(ctx: &LifecycleContext) -> Result<()> {
    daily_throttle(
        &ctx.locations().cache_file(),
        TIMEZONE_KEY,
        ctx.started_at(),
        || {
            ctx.telemetry()
                .background_metric(&ctx.controller_identity(), TIMEZONE_KEY, &local_zone());
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_missing_cache_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = StampCache::load(&tmp.path().join("cache.json")).unwrap();
        assert_eq!(cache.get("anything"), None);
    }

    #[test]
    fn test_set_save_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("cache.json");
        let mut cache = StampCache::load(&path).unwrap();
        cache.set("a", 42);
        cache.save().unwrap();

        let cache = StampCache::load(&path).unwrap();
        assert_eq!(cache.get("a"), Some(42));
    }

    #[test]
    fn test_save_keeps_other_sections() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        std::fs::write(
            &path,
            r#"{"stamps": {"old": 5}, "users": ["a"], "hostname": "box"}"#,
        )
        .unwrap();

        let mut cache = StampCache::load(&path).unwrap();
        cache.set("new", 9);
        cache.save().unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["users"], serde_json::json!(["a"]));
        assert_eq!(saved["hostname"], "box");
        assert_eq!(saved["stamps"]["old"], 5);
        assert_eq!(saved["stamps"]["new"], 9);
    }

    #[test]
    fn test_corrupt_cache_starts_over() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        std::fs::write(&path, "{not json").unwrap();
        let cache = StampCache::load(&path).unwrap();
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_daily_throttle_window() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        let calls = Cell::new(0);
        let now = 1_700_000_000;

        assert!(daily_throttle(&path, "k", now, || calls.set(calls.get() + 1)).unwrap());
        assert!(!daily_throttle(&path, "k", now + 10, || calls.set(calls.get() + 1)).unwrap());
        assert!(!daily_throttle(&path, "k", now + DAILY - 1, || calls.set(calls.get() + 1)).unwrap());
        assert_eq!(calls.get(), 1);

        assert!(daily_throttle(&path, "k", now + DAILY, || calls.set(calls.get() + 1)).unwrap());
        assert_eq!(calls.get(), 2);
        assert_eq!(StampCache::load(&path).unwrap().get("k"), Some(now + 2 * DAILY));
    }

    #[test]
    fn test_keys_are_independent() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        let calls = Cell::new(0);
        daily_throttle(&path, "a", 100, || calls.set(calls.get() + 1)).unwrap();
        daily_throttle(&path, "b", 100, || calls.set(calls.get() + 1)).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_save_failure_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("cache.json");
        let mut cache = StampCache::load(&path).unwrap();
        // A directory now sits where the file should go.
        std::fs::create_dir(&path).unwrap();
        cache.set("k", 1);
        assert!(cache.save().is_err());
    }

    #[test]
    fn test_local_zone_has_offset() {
        let zone = local_zone();
        assert!(zone.contains('+') || zone.contains('-'), "zone: {}", zone);
    }
}
