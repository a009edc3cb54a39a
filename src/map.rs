//! The public façade: routes key-addressed calls to the right partition
//! and validates constructor arguments.

use crate::aggregate;
use crate::bucket::clamp_capacity;
use crate::directory::{clamp_partition_count, Directory};
use crate::error::MapError;
use crate::hash::Spreader;
use crate::iter::{Entries, Keys, Values};
use crate::partition::Partition;
use crossbeam::epoch;
use std::hash::Hash;
use std::sync::Arc;

/// Default resize threshold, expressed as a fraction of a partition's
/// bucket table length.
const DEFAULT_LOAD_FACTOR: f64 = 0.75;

/// Builder for [`StripedHashMap`], mirroring the constructor configuration
/// of `java.util.concurrent.ConcurrentHashMap`: an initial capacity hint, a
/// per-partition load factor, and a concurrency-level hint that becomes the
/// (power-of-two, clamped) number of partitions.
#[derive(Debug, Clone)]
pub struct StripedHashMapBuilder {
    initial_capacity: i64,
    load_factor: f64,
    concurrency_level: i64,
}

impl Default for StripedHashMapBuilder {
    fn default() -> Self {
        StripedHashMapBuilder {
            initial_capacity: 0,
            load_factor: DEFAULT_LOAD_FACTOR,
            concurrency_level: num_cpus::get() as i64,
        }
    }
}

impl StripedHashMapBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries the map should be sized to hold without
    /// resizing. Must be non-negative.
    pub fn initial_capacity(mut self, capacity: i64) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Fraction of a partition's bucket table that may fill before it
    /// doubles. Must be positive.
    pub fn load_factor(mut self, load_factor: f64) -> Self {
        self.load_factor = load_factor;
        self
    }

    /// Hint for the expected number of threads updating the map
    /// concurrently; the actual partition count is the smallest power of
    /// two at least this large, clamped to
    /// [`crate::directory::MAX_PARTITIONS`]. Must be positive.
    pub fn concurrency_level(mut self, level: i64) -> Self {
        self.concurrency_level = level;
        self
    }

    pub fn build<K, V>(self) -> Result<StripedHashMap<K, V>, MapError>
    where
        K: Eq + Hash + 'static,
        V: 'static,
    {
        if self.initial_capacity < 0 {
            return Err(MapError::InvalidArgument("initial_capacity must not be negative".into()));
        }
        if !(self.load_factor > 0.0) {
            return Err(MapError::InvalidArgument("load_factor must be positive".into()));
        }
        if self.concurrency_level <= 0 {
            return Err(MapError::InvalidArgument("concurrency_level must be positive".into()));
        }

        let partition_count = clamp_partition_count(self.concurrency_level as usize);
        let requested = self.initial_capacity as usize;
        let per_partition_capacity = clamp_capacity((requested + partition_count - 1) / partition_count);

        Ok(StripedHashMap {
            directory: Directory::new(partition_count, per_partition_capacity, self.load_factor),
            spreader: Spreader::new(),
        })
    }
}

/// A segmented, lock-striped concurrent hash map.
///
/// Reads never block: a lookup walks a bucket chain using only
/// acquire-loads, without ever touching a lock. Writes lock only the
/// partition the key hashes into, so writers on distinct partitions
/// proceed in parallel. See `SPEC_FULL.md` for the full concurrency
/// model.
pub struct StripedHashMap<K, V> {
    pub(crate) directory: Directory<K, V>,
    spreader: Spreader,
}

impl<K, V> Default for StripedHashMap<K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> StripedHashMap<K, V>
where
    K: Eq + Hash + 'static,
    V: 'static,
{
    /// Builds a map with default configuration: load factor 0.75,
    /// concurrency level equal to the number of available CPUs.
    pub fn new() -> Self {
        StripedHashMapBuilder::default()
            .build()
            .expect("default builder configuration is always valid")
    }

    pub fn builder() -> StripedHashMapBuilder {
        StripedHashMapBuilder::default()
    }

    /// Copies every entry from `source` into a freshly built map with
    /// default configuration. Equivalent to `StripedHashMap::new()`
    /// followed by inserting every entry of `source`.
    pub fn from_map(source: &StripedHashMap<K, V>) -> Self {
        let copy = Self::new();
        for (key, value) in source.entries() {
            let hash = copy.spreader.spread(key.as_ref());
            let idx = copy.directory.index_of(hash);
            let partition = copy.directory.ensure_partition(idx);
            let guard = epoch::pin();
            partition.put(&guard, hash, key, value, false);
        }
        copy
    }

    pub(crate) fn directory_partition(&self, index: usize) -> Option<&Partition<K, V>> {
        self.directory.existing_partition(index)
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.directory.partition_count()
    }

    pub(crate) fn load_factor(&self) -> f64 {
        self.directory.load_factor()
    }

    fn spread(&self, key: &K) -> (u32, usize) {
        let hash = self.spreader.spread(key);
        (hash, self.directory.index_of(hash))
    }

    /// Returns a clone of the value mapped to `key`, if present.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.get_and(key, |v| v.clone())
    }

    /// Applies `f` to the value mapped to `key`, if present, without
    /// requiring `V: Clone`.
    pub fn get_and<T>(&self, key: &K, f: impl FnOnce(&V) -> T) -> Option<T> {
        let (hash, idx) = self.spread(key);
        let partition = self.directory.existing_partition(idx)?;
        let guard = epoch::pin();
        partition.get(&guard, hash, key).map(|v| f(v.as_ref()))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let (hash, idx) = self.spread(key);
        let Some(partition) = self.directory.existing_partition(idx) else {
            return false;
        };
        let guard = epoch::pin();
        partition.get(&guard, hash, key).is_some()
    }

    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let guard = epoch::pin();
        aggregate::any_contains_value(&self.directory, &guard, value)
    }

    /// Inserts `key` -> `value`, returning the value it displaced, if any.
    pub fn insert(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let (hash, idx) = self.spread(&key);
        let partition = self.directory.ensure_partition(idx);
        let guard = epoch::pin();
        partition
            .put(&guard, hash, Arc::new(key), Arc::new(value), false)
            .map(|v| (*v).clone())
    }

    /// Inserts `key` -> `value` only if `key` is currently absent. Returns
    /// the existing value if the key was already present (in which case
    /// the map is unchanged).
    pub fn insert_if_absent(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let (hash, idx) = self.spread(&key);
        let partition = self.directory.ensure_partition(idx);
        let guard = epoch::pin();
        partition
            .put(&guard, hash, Arc::new(key), Arc::new(value), true)
            .map(|v| (*v).clone())
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let (hash, idx) = self.spread(key);
        let partition = self.directory.existing_partition(idx)?;
        let guard = epoch::pin();
        partition.remove(&guard, hash, key, None).map(|v| (*v).clone())
    }

    /// Removes `key` only if its current value equals `value`.
    pub fn remove_if_equals(&self, key: &K, value: &V) -> bool
    where
        V: PartialEq,
    {
        let (hash, idx) = self.spread(key);
        let Some(partition) = self.directory.existing_partition(idx) else {
            return false;
        };
        let guard = epoch::pin();
        partition.remove(&guard, hash, key, Some(value)).is_some()
    }

    /// Unconditionally replaces `key`'s value, if present. Returns the
    /// previous value.
    pub fn replace(&self, key: &K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let (hash, idx) = self.spread(key);
        let partition = self.directory.existing_partition(idx)?;
        let guard = epoch::pin();
        partition.replace(&guard, hash, key, value).map(|v| (*v).clone())
    }

    /// Replaces `key`'s value with `new` iff its current value equals
    /// `expected`.
    pub fn replace_if_equals(&self, key: &K, expected: &V, new: V) -> bool
    where
        V: PartialEq,
    {
        let (hash, idx) = self.spread(key);
        let Some(partition) = self.directory.existing_partition(idx) else {
            return false;
        };
        let guard = epoch::pin();
        partition.replace_if_equals(&guard, hash, key, expected, new)
    }

    /// Total number of entries. Uses the retry-then-lock-all protocol: a
    /// handful of unlocked passes, falling back to locking every partition
    /// only if the count never stabilizes on its own.
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        aggregate::stable_read(&self.directory, &guard, |_| aggregate::total_len(&self.directory))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry from every materialized partition.
    pub fn clear(&self) {
        let guard = epoch::pin();
        for i in 0..self.directory.partition_count() {
            if let Some(p) = self.directory.existing_partition(i) {
                p.clear(&guard);
            }
        }
    }

    /// A weakly-consistent cursor over `(key, value)` pairs.
    pub fn entries(&self) -> Entries<'_, K, V> {
        Entries::new(self)
    }

    /// A weakly-consistent cursor over keys.
    pub fn keys(&self) -> Keys<'_, K, V> {
        Keys::new(self)
    }

    /// A weakly-consistent cursor over values.
    pub fn values(&self) -> Values<'_, K, V> {
        Values::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_negative_initial_capacity() {
        let result = StripedHashMapBuilder::new().initial_capacity(-1).build::<i32, i32>();
        assert!(matches!(result, Err(MapError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_non_positive_load_factor() {
        let result = StripedHashMapBuilder::new().load_factor(0.0).build::<i32, i32>();
        assert!(matches!(result, Err(MapError::InvalidArgument(_))));
    }

    #[test]
    fn rejects_non_positive_concurrency_level() {
        let result = StripedHashMapBuilder::new().concurrency_level(0).build::<i32, i32>();
        assert!(matches!(result, Err(MapError::InvalidArgument(_))));
    }

    #[test]
    fn concurrency_level_clamps_to_max_partitions() {
        let map = StripedHashMapBuilder::new()
            .concurrency_level(10_000_000)
            .build::<i32, i32>()
            .unwrap();
        assert_eq!(map.partition_count(), crate::directory::MAX_PARTITIONS);
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let map = StripedHashMap::new();
        assert!(map.insert("a", 1).is_none());
        assert_eq!(map.insert("a", 2), Some(1));
        assert_eq!(map.get(&"a"), Some(2));
        assert_eq!(map.remove(&"a"), Some(2));
        assert!(map.get(&"a").is_none());
    }

    #[test]
    fn insert_if_absent_does_not_overwrite() {
        let map = StripedHashMap::new();
        assert!(map.insert_if_absent("a", 1).is_none());
        assert_eq!(map.insert_if_absent("a", 2), Some(1));
        assert_eq!(map.get(&"a"), Some(1));
    }

    #[test]
    fn replace_if_equals_only_swaps_on_match() {
        let map = StripedHashMap::new();
        map.insert("a", 1);
        assert!(!map.replace_if_equals(&"a", &99, 2));
        assert_eq!(map.get(&"a"), Some(1));
        assert!(map.replace_if_equals(&"a", &1, 2));
        assert_eq!(map.get(&"a"), Some(2));
    }

    #[test]
    fn replace_is_commutative_with_itself() {
        let map = StripedHashMap::new();
        map.insert("a", 1);
        map.replace(&"a", 5);
        map.replace(&"a", 5);
        assert_eq!(map.get(&"a"), Some(5));
    }

    #[test]
    fn clear_then_clear_is_idempotent() {
        let map = StripedHashMap::new();
        map.insert("a", 1);
        map.clear();
        map.clear();
        assert_eq!(map.len(), 0);
        assert!(map.is_empty());
    }

    #[test]
    fn rehash_boundary_scenario_preserves_lookups() {
        // capacity 4, load factor 0.75, 4 partitions: partition 0's table
        // should double from 4 to 8 on the 4th insertion routed into it.
        let map = StripedHashMapBuilder::new()
            .initial_capacity(16)
            .load_factor(0.75)
            .concurrency_level(4)
            .build::<i32, i32>()
            .unwrap();
        for i in 0..200 {
            map.insert(i, i * 10);
        }
        for i in 0..200 {
            assert_eq!(map.get(&i), Some(i * 10));
        }
        assert_eq!(map.len(), 200);
    }

    #[test]
    fn contains_key_and_contains_value() {
        let map = StripedHashMap::new();
        map.insert("a", 1);
        assert!(map.contains_key(&"a"));
        assert!(!map.contains_key(&"b"));
        assert!(map.contains_value(&1));
        assert!(!map.contains_value(&2));
    }

    #[test]
    fn from_map_copies_every_entry() {
        let source = StripedHashMap::new();
        for i in 0..50 {
            source.insert(i, i + 1);
        }
        let copy = StripedHashMap::from_map(&source);
        assert_eq!(copy.len(), 50);
        for i in 0..50 {
            assert_eq!(copy.get(&i), Some(i + 1));
        }
    }
}
