//! Shared counters for rate limiting.
//!
//! Stores never fail: a read that cannot take its lock sees an empty series
//! (so the caller allows), and a write that cannot take its lock is dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::lock::{LockMode, lock_blocking};

/// Suffix of persisted timestamp series.
const SERIES_EXT: &str = "json";
const COUNTER_EXT: &str = "count";

pub trait CounterStore: Send + Sync {
    /// Timestamps recorded under `key`, oldest first.
    fn read_series(&self, key: &str) -> Vec<i64>;

    /// Read-modify-write of the series under `key`, atomic across processes.
    fn update_series(&self, key: &str, update: &mut dyn FnMut(&mut Vec<i64>));

    fn read_counter(&self, name: &str) -> u64;

    /// Add `delta` to the counter, clamping at zero. Returns the new value.
    fn add_to_counter(&self, name: &str, delta: i64) -> u64;

    /// Drop series untouched for longer than `max_age`. Returns how many went.
    fn cleanup(&self, max_age: Duration) -> usize;
}

fn clamp_add(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta.unsigned_abs())
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

// ---------------------------------------------------------------------------
// File-backed store
// ---------------------------------------------------------------------------

/// One JSON file per series and one text file per counter, each guarded by a
/// sibling `.lock` file so several processes can share a directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self, name: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{name}.{ext}"))
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.lock"))
    }

    fn load_series(path: &Path) -> Vec<i64> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "corrupt rate series, starting over");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }
}

/// Write via a temp file in the same directory, then rename.
fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

impl CounterStore for FileStore {
    fn read_series(&self, key: &str) -> Vec<i64> {
        let Ok(_guard) = lock_blocking(&self.lock_path(key), LockMode::Shared) else {
            debug!(key, "series lock unavailable, treating as empty");
            return Vec::new();
        };
        Self::load_series(&self.data_path(key, SERIES_EXT))
    }

    fn update_series(&self, key: &str, update: &mut dyn FnMut(&mut Vec<i64>)) {
        let _guard = match lock_blocking(&self.lock_path(key), LockMode::Exclusive) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(key, error = %e, "series lock unavailable, update dropped");
                return;
            }
        };
        let path = self.data_path(key, SERIES_EXT);
        let mut series = Self::load_series(&path);
        update(&mut series);
        let result = serde_json::to_vec(&series)
            .map_err(std::io::Error::other)
            .and_then(|json| write_atomic(&path, &json));
        if let Err(e) = result {
            warn!(key, error = %e, "failed to persist rate series");
        }
    }

    fn read_counter(&self, name: &str) -> u64 {
        let Ok(_guard) = lock_blocking(&self.lock_path(name), LockMode::Shared) else {
            return 0;
        };
        std::fs::read_to_string(self.data_path(name, COUNTER_EXT))
            .ok()
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or(0)
    }

    fn add_to_counter(&self, name: &str, delta: i64) -> u64 {
        let _guard = match lock_blocking(&self.lock_path(name), LockMode::Exclusive) {
            Ok(guard) => guard,
            Err(e) => {
                warn!(name, error = %e, "counter lock unavailable, update dropped");
                return 0;
            }
        };
        let path = self.data_path(name, COUNTER_EXT);
        let current: u64 = std::fs::read_to_string(&path)
            .ok()
            .and_then(|t| t.trim().parse().ok())
            .unwrap_or(0);
        let next = clamp_add(current, delta);
        if let Err(e) = write_atomic(&path, next.to_string().as_bytes()) {
            warn!(name, error = %e, "failed to persist counter");
        }
        next
    }

    fn cleanup(&self, max_age: Duration) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SERIES_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_stale(&path, max_age) {
                continue;
            }
            let lock_path = self.lock_path(key);
            let Ok(_guard) = lock_blocking(&lock_path, LockMode::Exclusive) else {
                debug!(key, "series lock unavailable, skipping cleanup");
                continue;
            };
            // A writer may have refreshed the series while we waited.
            if !is_stale(&path, max_age) {
                continue;
            }
            if std::fs::remove_file(&path).is_ok() {
                removed += 1;
                if let Err(e) = std::fs::remove_file(&lock_path) {
                    debug!(key, error = %e, "failed to remove series lock file");
                }
            }
        }
        removed
    }
}

fn is_stale(path: &Path, max_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Single-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: Mutex<HashMap<String, Vec<i64>>>,
    counters: Mutex<HashMap<String, u64>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CounterStore for MemoryStore {
    fn read_series(&self, key: &str) -> Vec<i64> {
        lock(&self.series).get(key).cloned().unwrap_or_default()
    }

    fn update_series(&self, key: &str, update: &mut dyn FnMut(&mut Vec<i64>)) {
        let mut series = lock(&self.series);
        update(series.entry(key.to_string()).or_default());
    }

    fn read_counter(&self, name: &str) -> u64 {
        lock(&self.counters).get(name).copied().unwrap_or(0)
    }

    fn add_to_counter(&self, name: &str, delta: i64) -> u64 {
        let mut counters = lock(&self.counters);
        let value = counters.entry(name.to_string()).or_insert(0);
        *value = clamp_add(*value, delta);
        *value
    }

    fn cleanup(&self, _max_age: Duration) -> usize {
        let mut series = lock(&self.series);
        let before = series.len();
        series.retain(|_, s| !s.is_empty());
        before - series.len()
    }
}
