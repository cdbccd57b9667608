//! Bounded cache of loaded checkpoint states.
//!
//! Owned by the [`CheckpointStore`](crate::checkpoint::CheckpointStore) and
//! injected explicitly; there is no process-wide instance. Entries are evicted
//! least-recently-used first once `max_entries` is reached.

use crate::checkpoint::CheckpointState;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Cache statistics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

#[derive(Debug)]
struct CachedState {
    state: Arc<CheckpointState>,
    /// Blob length when the state was read.
    size_bytes: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<PathBuf, CachedState>,
    tick: u64,
    stats: CacheStats,
}

#[derive(Debug)]
pub struct StateCache {
    max_entries: usize,
    inner: Mutex<CacheInner>,
}

impl StateCache {
    /// Creates a cache holding at most `max_entries` states (minimum 1).
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self { max_entries: max_entries.max(1), inner: Mutex::new(CacheInner::default()) }
    }

    /// Returns the cached state for `path` if the blob still has `size_bytes`.
    /// An entry recorded with another size is stale and dropped.
    pub fn get(&self, path: &Path, size_bytes: u64) -> Option<Arc<CheckpointState>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(path) {
            Some(cached) if cached.size_bytes == size_bytes => {
                cached.last_used = tick;
                let state = Arc::clone(&cached.state);
                inner.stats.hits += 1;
                Some(state)
            }
            Some(_) => {
                inner.entries.remove(path);
                inner.stats.size = inner.entries.len();
                inner.stats.misses += 1;
                debug!(path = %path.display(), "Dropped stale checkpoint state");
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    pub fn insert(&self, path: PathBuf, state: Arc<CheckpointState>, size_bytes: u64) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.entries.contains_key(&path) && inner.entries.len() >= self.max_entries {
            let lru = inner
                .entries
                .iter()
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(key, _)| key.clone());
            if let Some(key) = lru {
                inner.entries.remove(&key);
                inner.stats.evictions += 1;
                debug!(path = %key.display(), "Evicted checkpoint state from cache");
            }
        }
        inner.entries.insert(path, CachedState { state, size_bytes, last_used: tick });
        inner.stats.size = inner.entries.len();
    }

    pub fn remove(&self, path: &Path) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(path).is_some();
        inner.stats.size = inner.entries.len();
        removed
    }

    /// Drops every cached state. Returns how many were released.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let cleared = inner.entries.len();
        inner.entries.clear();
        inner.stats.size = 0;
        cleared
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.max_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobId;

    fn state(step: u64) -> Arc<CheckpointState> {
        Arc::new(CheckpointState::new(JobId::from("job"), 0, step, vec![1, 2, 3]))
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = StateCache::new(2);
        assert!(cache.get(Path::new("a"), 10).is_none());
        cache.insert(PathBuf::from("a"), state(1), 10);
        assert_eq!(cache.get(Path::new("a"), 10).unwrap().step, 1);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let cache = StateCache::new(2);
        cache.insert(PathBuf::from("a"), state(1), 10);
        cache.insert(PathBuf::from("b"), state(2), 10);
        // touch "a" so "b" becomes the LRU entry
        cache.get(Path::new("a"), 10);
        cache.insert(PathBuf::from("c"), state(3), 10);

        assert!(cache.get(Path::new("b"), 10).is_none());
        assert!(cache.get(Path::new("a"), 10).is_some());
        assert!(cache.get(Path::new("c"), 10).is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_cache_clear_and_remove() {
        let cache = StateCache::new(4);
        cache.insert(PathBuf::from("a"), state(1), 10);
        cache.insert(PathBuf::from("b"), state(2), 10);
        assert!(cache.remove(Path::new("a")));
        assert!(!cache.remove(Path::new("a")));
        assert_eq!(cache.clear(), 1);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_entry_with_changed_size_is_stale() {
        let cache = StateCache::new(2);
        cache.insert(PathBuf::from("a"), state(1), 120);
        assert!(cache.get(Path::new("a"), 0).is_none());
        // the stale entry is gone even when asked with the old size
        assert!(cache.get(Path::new("a"), 120).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.size, 0);
    }
}
