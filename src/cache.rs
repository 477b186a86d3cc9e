//! Bounded, time-expiring memoization for async lookups.
//!
//! Each key maps to a shared once-cell. Concurrent callers for the same key
//! await the same in-flight lookup; a failed lookup leaves the cell empty so
//! the next caller retries. Entries expire `max_age` after creation and the
//! table is bounded with LRU eviction.

use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use lru::LruCache;
use tokio::sync::OnceCell;
use tokio::time::Instant;

struct CacheEntry<V> {
    cell: Arc<OnceCell<V>>,
    created_at: Instant,
}

pub struct TtlCache<K: Hash + Eq, V> {
    entries: StdMutex<LruCache<K, CacheEntry<V>>>,
    max_age: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(max_size: usize, max_age: Duration) -> Self {
        let cap = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: StdMutex::new(LruCache::new(cap)),
            max_age,
        }
    }

    /// Return the memoized value for `key`, running `fetch` if there is none.
    pub async fn get_or_try_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        match self.cell_for(key) {
            Some(cell) => cell.get_or_try_init(fetch).await.cloned(),
            None => fetch().await,
        }
    }

    fn cell_for(&self, key: K) -> Option<Arc<OnceCell<V>>> {
        let mut guard = self.entries.lock().ok()?;
        if let Some(entry) = guard.get(&key)
            && entry.created_at.elapsed() < self.max_age
        {
            return Some(entry.cell.clone());
        }
        let cell = Arc::new(OnceCell::new());
        guard.put(key, CacheEntry {
            cell: cell.clone(),
            created_at: Instant::now(),
        });
        Some(cell)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.entries.lock() {
            guard.clear();
        }
    }
}
