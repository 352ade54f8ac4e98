//! Weighted least-recently-used index
//!
//! Not internally synchronized; the tunnel registry wraps it in a mutex. Eviction
//! is driven by the caller through [`LruCache::evict_lru_where`] so the caller can
//! exclude entries that must not go (tunnels with a live owner).

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

/// Approximate in-memory footprint of a cached value, in bytes
pub trait Weighted {
    fn weight(&self) -> usize;
}

impl<T: Weighted + ?Sized> Weighted for Arc<T> {
    fn weight(&self) -> usize {
        (**self).weight()
    }
}

struct Slot<V> {
    value: V,
    stamp: u64,
    weight: usize,
}

pub struct LruCache<K, V> {
    entries: HashMap<K, Slot<V>>,
    /// stamp -> key, oldest first
    recency: BTreeMap<u64, K>,
    tick: u64,
    weight: usize,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Weighted,
{
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
            weight: 0,
        }
    }

    fn next_stamp(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up a value and mark it most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let stamp = self.next_stamp();
        let slot = self.entries.get_mut(key)?;
        if let Some(k) = self.recency.remove(&slot.stamp) {
            self.recency.insert(stamp, k);
        }
        slot.stamp = stamp;
        Some(&slot.value)
    }

    /// Look up a value without touching recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.get(key).map(|slot| &slot.value)
    }

    /// Insert or overwrite, marking the entry most recently used
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let stamp = self.next_stamp();
        let weight = value.weight();
        self.weight += weight;
        self.recency.insert(stamp, key.clone());

        let previous = self.entries.insert(
            key,
            Slot {
                value,
                stamp,
                weight,
            },
        );

        previous.map(|slot| {
            self.recency.remove(&slot.stamp);
            self.weight -= slot.weight;
            slot.value
        })
    }

    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let slot = self.entries.remove(key)?;
        self.recency.remove(&slot.stamp);
        self.weight -= slot.weight;
        Some(slot.value)
    }

    /// Remove the least recently used entry accepted by `evictable`
    pub fn evict_lru_where<F>(&mut self, mut evictable: F) -> Option<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let victim = self.recency.values().find(|key| {
            self.entries
                .get(*key)
                .is_some_and(|slot| evictable(*key, &slot.value))
        })?;
        let victim = victim.clone();
        let value = self.remove(&victim)?;
        Some((victim, value))
    }

    /// Values from least to most recently used
    pub fn values_lru(&self) -> impl Iterator<Item = &V> {
        self.recency
            .values()
            .filter_map(|key| self.entries.get(key).map(|slot| &slot.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of the weights of all entries
    pub fn weight(&self) -> usize {
        self.weight
    }
}

impl<K, V> Default for LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Weighted,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item(usize);

    impl Weighted for Item {
        fn weight(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn test_weight_tracks_overwrite_and_remove() {
        let mut cache = LruCache::new();
        cache.insert("a".to_string(), Item(10));
        cache.insert("b".to_string(), Item(5));
        assert_eq!(cache.weight(), 15);

        let old = cache.insert("a".to_string(), Item(3));
        assert_eq!(old, Some(Item(10)));
        assert_eq!(cache.weight(), 8);
        assert_eq!(cache.len(), 2);

        cache.remove("b");
        assert_eq!(cache.weight(), 3);
        assert!(cache.remove("b").is_none());
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut cache = LruCache::new();
        cache.insert("a".to_string(), Item(1));
        cache.insert("b".to_string(), Item(1));
        cache.insert("c".to_string(), Item(1));

        cache.get("a");

        let (victim, _) = cache.evict_lru_where(|_, _| true).unwrap();
        assert_eq!(victim, "b");

        let order: Vec<usize> = cache.values_lru().map(|v| v.0).collect();
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn test_peek_does_not_refresh() {
        let mut cache = LruCache::new();
        cache.insert("a".to_string(), Item(1));
        cache.insert("b".to_string(), Item(1));

        assert!(cache.peek("a").is_some());

        let (victim, _) = cache.evict_lru_where(|_, _| true).unwrap();
        assert_eq!(victim, "a");
    }

    #[test]
    fn test_evict_skips_protected_entries() {
        let mut cache = LruCache::new();
        cache.insert("keep".to_string(), Item(1));
        cache.insert("drop".to_string(), Item(1));

        let (victim, _) = cache.evict_lru_where(|k, _| k != "keep").unwrap();
        assert_eq!(victim, "drop");
        assert!(cache.evict_lru_where(|k, _| k != "keep").is_none());
        assert_eq!(cache.len(), 1);
    }
}
