//! Process-wide TTL cache for read-mostly configuration entities.
//!
//! The dispatcher and planner read projects, endpoints, and subscriptions
//! on every job; this cache bounds that load. Writers invalidate by key so
//! config changes take effect without waiting out the TTL.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::RwLock;

/// Default entry lifetime for config reads.
pub const DEFAULT_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Keyed cache with per-entry expiry.
///
/// Cloneable handle; all clones share the same entries.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Arc<RwLock<HashMap<K, Entry<V>>>>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self { ttl: self.ttl, entries: self.entries.clone() }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    /// Creates a cache with the given entry lifetime.
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Creates a cache with [`DEFAULT_TTL`].
    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL)
    }

    /// Returns the cached value if present and unexpired.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| entry.inserted_at.elapsed() < self.ttl)
            .map(|entry| entry.value.clone())
    }

    /// Inserts or refreshes an entry.
    pub async fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write().await;
        entries.insert(key, Entry { value, inserted_at: Instant::now() });
    }

    /// Drops an entry. Writers call this after every mutation.
    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Drops expired entries. Called opportunistically by long-lived owners.
    pub async fn evict_expired(&self) {
        let mut entries = self.entries.write().await;
        entries.retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
    }

    /// Number of entries, including expired ones not yet evicted.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Whether the cache holds no entries.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.insert("k", 7).await;
        assert_eq!(cache.get(&"k").await, Some(7));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get(&"k").await, None);
    }

    #[tokio::test]
    async fn invalidation_takes_effect_immediately() {
        let cache: TtlCache<&str, u32> = TtlCache::with_default_ttl();
        cache.insert("k", 1).await;
        cache.invalidate(&"k").await;
        assert_eq!(cache.get(&"k").await, None);
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let cache: TtlCache<&str, u32> = TtlCache::with_default_ttl();
        let clone = cache.clone();
        cache.insert("k", 3).await;
        assert_eq!(clone.get(&"k").await, Some(3));
    }

    #[tokio::test]
    async fn eviction_drops_only_expired() {
        let cache: TtlCache<&str, u32> = TtlCache::new(Duration::from_millis(20));
        cache.insert("old", 1).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        cache.insert("new", 2).await;

        cache.evict_expired().await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get(&"new").await, Some(2));
    }
}
