//! Size-bounded LRU cache for identifier interning
//!
//! Entries live in an arena (`Vec` of slots plus a free list) threaded by a
//! doubly linked list of slot indices, most recently used at the head. A
//! `HashMap` maps keys to slots.
//!
//! Size is counted in units chosen by an [`EntrySizer`], one per entry by
//! default. `rename` and the `alter_*` operations edit an entry in place and
//! never move it in the recency list; only `get` and `put` do.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

const NIL: usize = usize::MAX;

/// Measures an entry in cache size units
pub trait EntrySizer<K, V> {
    fn size_of(&self, key: &K, value: &V) -> usize;
}

/// Every entry costs one unit
#[derive(Debug, Clone, Copy, Default)]
pub struct UnitSizer;

impl<K, V> EntrySizer<K, V> for UnitSizer {
    fn size_of(&self, _key: &K, _value: &V) -> usize {
        1
    }
}

/// Entries cost the byte length of their string side plus a fixed overhead
#[derive(Debug, Clone, Copy, Default)]
pub struct StrSizer;

/// Per-entry bookkeeping charged by [`StrSizer`]
const STR_ENTRY_OVERHEAD: usize = 16;

impl EntrySizer<Arc<str>, i64> for StrSizer {
    fn size_of(&self, key: &Arc<str>, _value: &i64) -> usize {
        key.len() + STR_ENTRY_OVERHEAD
    }
}

impl EntrySizer<i64, Arc<str>> for StrSizer {
    fn size_of(&self, _key: &i64, value: &Arc<str>) -> usize {
        value.len() + STR_ENTRY_OVERHEAD
    }
}

struct Node<K, V> {
    key: K,
    value: V,
    size: usize,
    prev: usize,
    next: usize,
}

/// Hit/miss/eviction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Size-bounded LRU map
pub struct IdentifierCache<K, V, S = UnitSizer> {
    map: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    size: usize,
    max_size: usize,
    sizer: S,
    stats: CacheStats,
}

impl<K, V> IdentifierCache<K, V, UnitSizer>
where
    K: Hash + Eq + Clone,
{
    /// Cache holding at most `max_size` entries
    pub fn new(max_size: usize) -> Self {
        Self::with_sizer(max_size, UnitSizer)
    }
}

impl<K, V, S> IdentifierCache<K, V, S>
where
    K: Hash + Eq + Clone,
    S: EntrySizer<K, V>,
{
    /// Cache bounded by `max_size` units as measured by `sizer`
    pub fn with_sizer(max_size: usize, sizer: S) -> Self {
        Self {
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            size: 0,
            max_size,
            sizer,
            stats: CacheStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Current size in sizer units
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Change the bound, evicting as needed
    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.trim();
    }

    /// Look up `key` and mark it most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        match self.map.get(key).copied() {
            Some(idx) => {
                self.stats.hits += 1;
                self.move_to_head(idx);
                Some(&self.node(idx).value)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Look up `key` without touching recency
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).map(|&idx| &self.node(idx).value)
    }

    /// The stored key instance equal to `key`, without touching recency
    pub fn normalize<Q>(&self, key: &Q) -> Option<&K>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.get(key).map(|&idx| &self.node(idx).key)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.contains_key(key)
    }

    /// Insert or replace, mark most recently used, then evict from the tail
    ///
    /// Returns the previous value for `key`, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        let entry_size = self.sizer.size_of(&key, &value);

        let previous = match self.map.get(&key).copied() {
            Some(idx) => {
                let node = self.node_mut(idx);
                let old_size = node.size;
                node.size = entry_size;
                let old = std::mem::replace(&mut node.value, value);
                self.size = self.size - old_size + entry_size;
                self.move_to_head(idx);
                Some(old)
            }
            None => {
                let idx = self.alloc(Node {
                    key: key.clone(),
                    value,
                    size: entry_size,
                    prev: NIL,
                    next: NIL,
                });
                self.map.insert(key, idx);
                self.push_head(idx);
                self.size += entry_size;
                None
            }
        };

        self.trim();
        previous
    }

    /// Remove `key`, returning its value
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.map.remove(key)?;
        Some(self.release(idx).1)
    }

    /// Give the entry under `old` the key `new`, keeping its list position
    ///
    /// An existing entry under `new` is dropped. Returns false if `old` is
    /// not cached.
    pub fn rename<Q>(&mut self, old: &Q, new: K) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(idx) = self.map.remove(old) else {
            return false;
        };
        if let Some(other) = self.map.remove::<K>(&new) {
            self.release(other);
        }
        self.map.insert(new.clone(), idx);
        self.node_mut(idx).key = new;
        self.resize_in_place(idx);
        true
    }

    /// Replace the value under `key`, keeping its list position
    ///
    /// Returns the old value, or `None` if `key` is not cached.
    pub fn alter_value<Q>(&mut self, key: &Q, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.map.get(key).copied()?;
        let old = std::mem::replace(&mut self.node_mut(idx).value, value);
        self.resize_in_place(idx);
        Some(old)
    }

    /// Replace both key and value of the entry under `old`, keeping its
    /// list position
    pub fn alter_entry<Q>(&mut self, old: &Q, new_key: K, value: V) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let idx = self.map.get(old).copied()?;
        let previous = std::mem::replace(&mut self.node_mut(idx).value, value);
        self.rename(old, new_key);
        Some(previous)
    }

    /// Drop every entry
    pub fn clear(&mut self) {
        self.map.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
        self.size = 0;
    }

    /// Keys from most to least recently used
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            if cursor == NIL {
                return None;
            }
            let node = self.node(cursor);
            cursor = node.next;
            Some(&node.key)
        })
    }

    // ==================== Internals ====================

    fn node(&self, idx: usize) -> &Node<K, V> {
        self.slots[idx].as_ref().expect("linked slot is occupied")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        self.slots[idx].as_mut().expect("linked slot is occupied")
    }

    fn alloc(&mut self, node: Node<K, V>) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    /// Unlink a slot whose map entry is already gone
    fn release(&mut self, idx: usize) -> (K, V) {
        self.unlink(idx);
        let node = self.slots[idx].take().expect("linked slot is occupied");
        self.free.push(idx);
        self.size -= node.size;
        (node.key, node.value)
    }

    fn resize_in_place(&mut self, idx: usize) {
        let node = self.node(idx);
        let new_size = self.sizer.size_of(&node.key, &node.value);
        let old_size = node.size;
        self.node_mut(idx).size = new_size;
        self.size = self.size - old_size + new_size;
        self.trim();
    }

    fn trim(&mut self) {
        while self.size > self.max_size && self.tail != NIL {
            let idx = self.tail;
            let key = self.node(idx).key.clone();
            self.map.remove(&key);
            self.release(idx);
            self.stats.evictions += 1;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
        let node = self.node_mut(idx);
        node.prev = NIL;
        node.next = NIL;
    }

    fn push_head(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(idx);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head == NIL {
            self.tail = idx;
        } else {
            self.node_mut(old_head).prev = idx;
        }
        self.head = idx;
    }

    fn move_to_head(&mut self, idx: usize) {
        if self.head != idx {
            self.unlink(idx);
            self.push_head(idx);
        }
    }
}

impl<K: fmt::Debug, V: fmt::Debug, S> fmt::Debug for IdentifierCache<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifierCache")
            .field("len", &self.map.len())
            .field("size", &self.size)
            .field("max_size", &self.max_size)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys_of<S: EntrySizer<u32, &'static str>>(
        cache: &IdentifierCache<u32, &'static str, S>,
    ) -> Vec<u32> {
        cache.keys().copied().collect()
    }

    #[test]
    fn test_put_and_get() {
        let mut cache = IdentifierCache::new(3);
        cache.put(1u32, "one");
        cache.put(2, "two");
        assert_eq!(cache.get(&1), Some(&"one"));
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut cache = IdentifierCache::new(3);
        cache.put(1u32, "one");
        cache.put(2, "two");
        cache.put(3, "three");
        cache.get(&1);
        cache.put(4, "four");

        assert!(!cache.contains_key(&2));
        assert_eq!(keys_of(&cache), vec![4, 1, 3]);
        assert!(cache.size() <= cache.max_size());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_eviction_follows_insertion_order_without_access() {
        let mut cache = IdentifierCache::new(2);
        for key in 0u32..5 {
            cache.put(key, "v");
        }
        assert_eq!(keys_of(&cache), vec![4, 3]);
    }

    #[test]
    fn test_peek_and_normalize_do_not_promote() {
        let mut cache = IdentifierCache::new(2);
        cache.put(1u32, "one");
        cache.put(2, "two");
        assert_eq!(cache.peek(&1), Some(&"one"));
        assert_eq!(cache.normalize(&1), Some(&1));
        cache.put(3, "three");
        assert!(!cache.contains_key(&1));
    }

    #[test]
    fn test_normalize_returns_stored_instance() {
        let mut cache: IdentifierCache<Arc<str>, i64> = IdentifierCache::new(4);
        let stored: Arc<str> = Arc::from("title");
        cache.put(stored.clone(), 7);

        let canonical = cache.normalize("title").unwrap();
        assert!(Arc::ptr_eq(canonical, &stored));
    }

    #[test]
    fn test_put_existing_replaces_and_promotes() {
        let mut cache = IdentifierCache::new(2);
        cache.put(1u32, "one");
        cache.put(2, "two");
        assert_eq!(cache.put(1, "uno"), Some("one"));
        assert_eq!(keys_of(&cache), vec![1, 2]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_rename_keeps_position() {
        let mut cache = IdentifierCache::new(3);
        cache.put(1u32, "one");
        cache.put(2, "two");
        cache.put(3, "three");

        assert!(cache.rename(&1, 10));
        assert_eq!(keys_of(&cache), vec![3, 2, 10]);
        assert_eq!(cache.peek(&10), Some(&"one"));
        assert!(!cache.rename(&99, 100));

        // the renamed tail entry is still first out
        cache.put(4, "four");
        assert!(!cache.contains_key(&10));
    }

    #[test]
    fn test_rename_onto_existing_key_drops_it() {
        let mut cache = IdentifierCache::new(3);
        cache.put(1u32, "one");
        cache.put(2, "two");
        assert!(cache.rename(&1, 2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.peek(&2), Some(&"one"));
        assert_eq!(cache.size(), 1);
    }

    #[test]
    fn test_alter_value_keeps_position() {
        let mut cache = IdentifierCache::new(3);
        cache.put(1u32, "one");
        cache.put(2, "two");
        assert_eq!(cache.alter_value(&1, "ONE"), Some("one"));
        assert_eq!(keys_of(&cache), vec![2, 1]);
        assert_eq!(cache.alter_value(&5, "five"), None);
    }

    #[test]
    fn test_alter_entry_keeps_position() {
        let mut cache = IdentifierCache::new(3);
        cache.put(1u32, "one");
        cache.put(2, "two");
        assert_eq!(cache.alter_entry(&1, 11, "eleven"), Some("one"));
        assert_eq!(keys_of(&cache), vec![2, 11]);
        assert_eq!(cache.peek(&11), Some(&"eleven"));
    }

    #[test]
    fn test_custom_sizer_bounds_units() {
        let mut cache: IdentifierCache<Arc<str>, i64, StrSizer> =
            IdentifierCache::with_sizer(100, StrSizer);
        cache.put(Arc::from("a".repeat(30)), 1);
        cache.put(Arc::from("b".repeat(30)), 2);
        assert_eq!(cache.size(), 2 * (30 + STR_ENTRY_OVERHEAD));

        cache.put(Arc::from("c".repeat(30)), 3);
        assert!(cache.size() <= 100);
        assert!(!cache.contains_key("a".repeat(30).as_str()));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_alter_value_resizes() {
        let mut cache: IdentifierCache<i64, Arc<str>, StrSizer> =
            IdentifierCache::with_sizer(1000, StrSizer);
        cache.put(1, Arc::from("short"));
        cache.alter_value(&1, Arc::from("a much longer value"));
        assert_eq!(cache.size(), "a much longer value".len() + STR_ENTRY_OVERHEAD);
    }

    #[test]
    fn test_oversized_entry_evicts_everything() {
        let mut cache: IdentifierCache<Arc<str>, i64, StrSizer> =
            IdentifierCache::with_sizer(20, StrSizer);
        cache.put(Arc::from("x"), 1);
        cache.put(Arc::from("y".repeat(50)), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_remove_and_slot_reuse() {
        let mut cache = IdentifierCache::new(4);
        cache.put(1u32, "one");
        cache.put(2, "two");
        assert_eq!(cache.remove(&1), Some("one"));
        cache.put(3, "three");
        assert_eq!(keys_of(&cache), vec![3, 2]);
        assert_eq!(cache.slots.len(), 2);
    }

    #[test]
    fn test_set_max_size_trims() {
        let mut cache = IdentifierCache::new(5);
        for key in 0u32..5 {
            cache.put(key, "v");
        }
        cache.set_max_size(2);
        assert_eq!(keys_of(&cache), vec![4, 3]);
    }

    #[test]
    fn test_clear() {
        let mut cache = IdentifierCache::new(5);
        cache.put(1u32, "one");
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
        cache.put(2, "two");
        assert_eq!(keys_of(&cache), vec![2]);
    }
}
