use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use tracing::trace;

use super::headers::HeaderList;

mod entry;
mod key;
mod maintenance;
mod policy;

pub use entry::{CacheEntry, PendingEntry};
pub use key::CacheKey;
pub use maintenance::spawn_cache_sweeper;
pub use policy::{CacheDecision, CachePolicy};

/// In-memory response cache shared by all connection tasks.
///
/// Stale entries are never served: a lookup that finds one tombstones it and
/// reports a miss. Physical removal happens only in [`HttpCache::sweep`].
#[derive(Clone)]
pub struct HttpCache {
    state: Arc<CacheState>,
}

struct CacheState {
    entries: RwLock<HashMap<CacheKey, Arc<CacheEntry>>>,
    hits: AtomicU64,
    policy: CachePolicy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub entries: usize,
    pub removed: usize,
    pub hits: u64,
}

impl HttpCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            state: Arc::new(CacheState {
                entries: RwLock::new(HashMap::new()),
                hits: AtomicU64::new(0),
                policy,
            }),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.lookup_at(key, SystemTime::now())
    }

    fn lookup_at(&self, key: &CacheKey, now: SystemTime) -> Option<Arc<CacheEntry>> {
        let entry = self.state.entries.read().get(key).cloned()?;
        if !entry.is_fresh_at(now) {
            trace!(uri = key.uri(), "cache entry stale");
            entry.tombstone();
            return None;
        }
        self.state.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry)
    }

    pub fn can_cache(&self, headers: &HeaderList) -> CacheDecision {
        self.state.policy.evaluate(headers, SystemTime::now())
    }

    /// Stores `entry` unless its key is already present. Returns whether it
    /// was stored.
    pub fn insert(&self, entry: CacheEntry) -> bool {
        let mut guard = self.state.entries.write();
        if guard.contains_key(entry.key()) {
            return false;
        }
        guard.insert(entry.key().clone(), Arc::new(entry));
        true
    }

    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(SystemTime::now())
    }

    fn sweep_at(&self, now: SystemTime) -> SweepStats {
        let stale: Vec<CacheKey> = self
            .state
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| !entry.is_fresh_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut guard = self.state.entries.write();
        let mut removed = 0;
        for key in &stale {
            if guard.remove(key).is_some() {
                removed += 1;
            }
        }
        let entries = guard.len();
        drop(guard);

        SweepStats {
            entries,
            removed,
            hits: self.hits(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.state.hits.load(Ordering::Relaxed)
    }
}
