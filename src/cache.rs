//! Bounded LRU cache with pinned entries
//!
//! Backs the per-object metadata registries. An entry is pinned while an
//! in-flight write may still append to it; pinned entries are never
//! evicted. `clear_pinned` moves every pinned entry with key at or below
//! a bound back into the LRU, making it evictable again.
//!
//! All operations are thread-safe. The LRU splice-to-front on lookup only
//! happens when the `reorder` flag is set, so scans can inspect entries
//! without perturbing eviction order.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use parking_lot::Mutex;

struct Inner<K, V> {
    max_size: usize,
    // recency sequence -> entry; larger sequence = more recently used
    lru: BTreeMap<u64, (K, V)>,
    contents: HashMap<K, u64>,
    pinned: BTreeMap<K, V>,
    next_seq: u64,
}

impl<K, V> Inner<K, V>
where
    K: Ord + Hash + Clone,
    V: Clone,
{
    fn trim(&mut self) {
        while self.lru.len() > self.max_size {
            let (_, (k, _)) = self.lru.pop_first().unwrap();
            self.contents.remove(&k);
        }
    }

    fn add(&mut self, key: K, value: V) {
        if let Some(seq) = self.contents.remove(&key) {
            self.lru.remove(&seq);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.contents.insert(key.clone(), seq);
        self.lru.insert(seq, (key, value));
        self.trim();
    }

    fn touch(&mut self, key: &K) {
        if let Some(&seq) = self.contents.get(key) {
            let entry = self.lru.remove(&seq).unwrap();
            let new_seq = self.next_seq;
            self.next_seq += 1;
            self.contents.insert(key.clone(), new_seq);
            self.lru.insert(new_seq, entry);
        }
    }
}

/// Thread-safe bounded LRU with pinned entries and range queries.
pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Ord + Hash + Clone,
    V: Clone,
{
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                max_size,
                lru: BTreeMap::new(),
                contents: HashMap::new(),
                pinned: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    /// Look up `key`, checking the LRU first and pinned entries second.
    ///
    /// With `reorder` set, an LRU hit moves the entry to the front.
    pub fn lookup_with_reorder(&self, key: &K, reorder: bool) -> Option<V> {
        let mut inner = self.inner.lock();
        if inner.contents.contains_key(key) {
            if reorder {
                inner.touch(key);
            }
            let seq = inner.contents[key];
            return Some(inner.lru[&seq].1.clone());
        }
        inner.pinned.get(key).cloned()
    }

    pub fn lookup(&self, key: &K) -> Option<V> {
        self.lookup_with_reorder(key, true)
    }

    /// Insert `key`, evicting the least recently used unpinned entries
    /// if the cache is over capacity.
    pub fn add(&self, key: K, value: V) {
        self.inner.lock().add(key, value);
    }

    /// Return the cached value for `key`, inserting `value` if absent.
    pub fn lookup_or_create(&self, key: K, value: V) -> V {
        let mut inner = self.inner.lock();
        if inner.contents.contains_key(&key) {
            inner.touch(&key);
            let seq = inner.contents[&key];
            return inner.lru[&seq].1.clone();
        }
        if let Some(v) = inner.pinned.get(&key) {
            return v.clone();
        }
        inner.add(key, value.clone());
        value
    }

    /// Pin `key` so it cannot be evicted until `clear_pinned` passes it.
    pub fn pin(&self, key: K, value: V) {
        self.inner.lock().pinned.insert(key, value);
    }

    /// Unpin every entry with key at or below `bound`, moving it into
    /// the LRU (splicing to the front if already present).
    pub fn clear_pinned(&self, bound: &K) {
        let mut inner = self.inner.lock();
        let keep = inner.pinned.split_off(bound);
        let mut released = std::mem::replace(&mut inner.pinned, keep);
        // split_off leaves the bound key itself in the tail; it is
        // included in the release per the inclusive contract.
        if let Some(v) = inner.pinned.remove(bound) {
            released.insert(bound.clone(), v);
        }
        for (k, v) in released {
            if inner.contents.contains_key(&k) {
                inner.touch(&k);
            } else {
                inner.add(k, v);
            }
        }
    }

    /// Drop `key` from the LRU (pinned entries are untouched).
    pub fn clear(&self, key: &K) {
        let mut inner = self.inner.lock();
        if let Some(seq) = inner.contents.remove(key) {
            inner.lru.remove(&seq);
        }
    }

    /// Number of entries in the LRU (excludes pinned).
    pub fn size(&self) -> usize {
        self.inner.lock().lru.len()
    }

    /// Change capacity, evicting immediately if shrinking.
    pub fn set_size(&self, max_size: usize) {
        let mut inner = self.inner.lock();
        inner.max_size = max_size;
        inner.trim();
    }

    /// The `n` least recently used keys, oldest first.
    pub fn last_n_keys(&self, n: usize) -> Vec<K> {
        let inner = self.inner.lock();
        inner.lru.values().map(|(k, _)| k.clone()).take(n).collect()
    }

    /// Keys from the cold end of the LRU, skipping `offset` and taking
    /// up to `len`.
    pub fn get_range_keys(&self, offset: usize, len: usize) -> Vec<K> {
        let inner = self.inner.lock();
        inner
            .lru
            .values()
            .map(|(k, _)| k.clone())
            .skip(offset)
            .take(len)
            .collect()
    }
}
