//! Weakly-consistent iteration.
//!
//! A cursor walks partitions in reverse index order, buckets within a
//! partition in reverse index order, and each chain head-to-tail. It pins
//! a single epoch guard for its entire lifetime, which is also what makes
//! holding raw pointers across `next()` calls sound here: nothing the
//! cursor has already observed can be physically freed before the guard
//! (and therefore the cursor) drops. It is guaranteed to produce every
//! entry that was present at creation and still present when reached; it
//! may or may not produce entries inserted afterward; it never produces
//! the same key twice.
//!
//! Yielding `Arc<K>`/`Arc<V>` rather than cloned owned values means the
//! cursor never needs a `Clone` bound on the map's key or value type, and
//! a yielded entry stays valid even if its node is concurrently unlinked.

use crate::bucket::BucketTable;
use crate::map::StripedHashMap;
use crate::node::Node;
use crossbeam::epoch::Guard;
use std::hash::Hash;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct Cursor<'a, K, V> {
    map: &'a StripedHashMap<K, V>,
    guard: Guard,
    partition_idx: isize,
    table: *const BucketTable<K, V>,
    bucket_idx: isize,
    next_node: *const Node<K, V>,
    last_key: Option<Arc<K>>,
    exhausted: bool,
}

impl<'a, K, V> Cursor<'a, K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    fn new(map: &'a StripedHashMap<K, V>) -> Self {
        Cursor {
            map,
            guard: crossbeam::epoch::pin(),
            partition_idx: map.partition_count() as isize,
            table: std::ptr::null(),
            bucket_idx: -1,
            next_node: std::ptr::null(),
            last_key: None,
            exhausted: false,
        }
    }

    /// Advances to (and returns) the next live node, descending through
    /// buckets and partitions in reverse order as the current chain runs
    /// dry.
    fn advance(&mut self) -> Option<*const Node<K, V>> {
        loop {
            if !self.next_node.is_null() {
                let node = self.next_node;
                let n = unsafe { &*node };
                self.next_node = n.next.load(Ordering::Acquire, &self.guard).as_raw();
                return Some(node);
            }

            if self.bucket_idx < 0 {
                self.partition_idx -= 1;
                if self.partition_idx < 0 {
                    self.exhausted = true;
                    return None;
                }
                let idx = self.partition_idx as usize;
                let Some(partition) = self.map.directory_partition(idx) else {
                    continue;
                };
                let table_ptr = partition.snapshot_table(&self.guard).as_raw();
                self.bucket_idx = unsafe { &*table_ptr }.len() as isize - 1;
                self.table = table_ptr;
                continue;
            }

            let table = self.table;
            let bucket = unsafe { &*table }.bucket(self.bucket_idx as usize);
            self.bucket_idx -= 1;
            self.next_node = bucket.load(Ordering::Acquire, &self.guard).as_raw();
        }
    }
}

/// Iterates `(key, value)` pairs.
pub struct Entries<'a, K, V> {
    cursor: Cursor<'a, K, V>,
}

impl<'a, K, V> Entries<'a, K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    pub(crate) fn new(map: &'a StripedHashMap<K, V>) -> Self {
        Entries { cursor: Cursor::new(map) }
    }

    /// Removes the entry this cursor most recently returned. Fails if
    /// called before any call to `next`, called again without an
    /// intervening `next`, or called after the cursor is exhausted.
    pub fn remove(&mut self) -> Result<(), crate::error::MapError> {
        if self.cursor.exhausted {
            return Err(crate::error::MapError::CursorMisuse(
                "remove called after the cursor was exhausted".into(),
            ));
        }
        match self.cursor.last_key.take() {
            Some(key) => {
                self.cursor.map.remove(&key);
                Ok(())
            }
            None => Err(crate::error::MapError::CursorMisuse(
                "remove called before any call to next".into(),
            )),
        }
    }

    /// Total number of entries, via the map's aggregate protocol.
    pub fn len(&self) -> usize {
        self.cursor.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.map.is_empty()
    }
}

impl<'a, K, V> Iterator for Entries<'a, K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    type Item = (Arc<K>, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        let node_ptr = self.cursor.advance()?;
        let n = unsafe { &*node_ptr };
        self.cursor.last_key = Some(Arc::clone(&n.key));
        Some((Arc::clone(&n.key), Arc::clone(&n.value)))
    }
}

/// Iterates keys only.
pub struct Keys<'a, K, V> {
    inner: Entries<'a, K, V>,
}

impl<'a, K, V> Keys<'a, K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    pub(crate) fn new(map: &'a StripedHashMap<K, V>) -> Self {
        Keys { inner: Entries::new(map) }
    }

    /// Total number of entries, via the map's aggregate protocol.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.cursor.map.contains_key(key)
    }
}

impl<'a, K, V> Iterator for Keys<'a, K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    type Item = Arc<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }
}

/// Iterates values only.
pub struct Values<'a, K, V> {
    inner: Entries<'a, K, V>,
}

impl<'a, K, V> Values<'a, K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    pub(crate) fn new(map: &'a StripedHashMap<K, V>) -> Self {
        Values { inner: Entries::new(map) }
    }

    /// Total number of entries, via the map's aggregate protocol.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        self.inner.cursor.map.contains_value(value)
    }
}

impl<'a, K, V> Iterator for Values<'a, K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    type Item = Arc<V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use crate::map::StripedHashMap;
    use std::collections::HashSet;

    #[test]
    fn entries_visits_every_inserted_key_exactly_once() {
        let map = StripedHashMap::new();
        for i in 0..200 {
            map.insert(i, i * 2);
        }
        let mut seen = HashSet::new();
        for (k, v) in map.entries() {
            assert!(seen.insert(*k), "duplicate key from cursor");
            assert_eq!(*v, *k * 2);
        }
        assert_eq!(seen.len(), 200);
    }

    #[test]
    fn keys_and_values_agree_in_count_with_entries() {
        let map = StripedHashMap::new();
        for i in 0..50 {
            map.insert(i, -i);
        }
        assert_eq!(map.keys().count(), 50);
        assert_eq!(map.values().count(), 50);
    }

    #[test]
    fn empty_map_yields_no_entries() {
        let map: StripedHashMap<i32, i32> = StripedHashMap::new();
        assert!(map.entries().next().is_none());
    }

    #[test]
    fn cursor_remove_deletes_the_last_yielded_entry() {
        let map = StripedHashMap::new();
        map.insert(1, 100);
        map.insert(2, 200);
        let mut entries = map.entries();
        let (first_key, _) = entries.next().unwrap();
        entries.remove().unwrap();
        assert!(!map.contains_key(&first_key));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn cursor_remove_before_next_is_a_misuse_error() {
        let map: StripedHashMap<i32, i32> = StripedHashMap::new();
        map.insert(1, 1);
        let mut entries = map.entries();
        assert!(entries.remove().is_err());
    }

    #[test]
    fn cursor_remove_after_exhaustion_is_a_misuse_error() {
        let map: StripedHashMap<i32, i32> = StripedHashMap::new();
        map.insert(1, 1);
        let mut entries = map.entries();
        entries.by_ref().for_each(drop);
        assert!(entries.remove().is_err());
    }

    #[test]
    fn views_forward_len_is_empty_and_contains() {
        let map = StripedHashMap::new();
        map.insert("a", 1);
        map.insert("b", 2);

        assert_eq!(map.entries().len(), 2);
        assert!(!map.entries().is_empty());
        assert_eq!(map.keys().len(), 2);
        assert!(map.keys().contains(&"a"));
        assert!(!map.keys().contains(&"z"));
        assert_eq!(map.values().len(), 2);
        assert!(map.values().contains(&1));
        assert!(!map.values().contains(&99));

        map.clear();
        assert!(map.entries().is_empty());
    }
}
