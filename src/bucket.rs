//! The bucket table: a power-of-two array of chain heads.

use crate::node::Node;
use crossbeam::epoch::Atomic;

/// Smallest bucket table a partition is ever constructed with.
pub(crate) const MIN_BUCKET_CAPACITY: usize = 2;
/// Largest bucket table a partition is allowed to grow to. Rehash stops
/// doubling once a partition's table reaches this size; further growth is
/// absorbed by longer chains instead.
pub(crate) const MAX_CAPACITY: usize = 1 << 30;

/// A partition's bucket array. Replaced wholesale on rehash; never resized
/// in place.
pub(crate) struct BucketTable<K, V> {
    buckets: Box<[Atomic<Node<K, V>>]>,
}

impl<K, V> BucketTable<K, V> {
    /// Allocates an empty table of the given capacity, which must already
    /// be a power of two.
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let mut buckets = Vec::with_capacity(capacity);
        buckets.resize_with(capacity, Atomic::null);
        BucketTable {
            buckets: buckets.into_boxed_slice(),
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Maps a spread hash to a bucket index in this table.
    #[inline]
    pub(crate) fn index_of(&self, hash: u32) -> usize {
        (hash as usize) & (self.buckets.len() - 1)
    }

    #[inline]
    pub(crate) fn bucket(&self, index: usize) -> &Atomic<Node<K, V>> {
        &self.buckets[index]
    }
}

/// Rounds `n` up to the next power of two, clamped to `[MIN_BUCKET_CAPACITY, MAX_CAPACITY]`.
pub(crate) fn clamp_capacity(n: usize) -> usize {
    let p = n.max(1).next_power_of_two();
    p.clamp(MIN_BUCKET_CAPACITY, MAX_CAPACITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_capacity_rounds_up_to_power_of_two() {
        assert_eq!(clamp_capacity(0), MIN_BUCKET_CAPACITY);
        assert_eq!(clamp_capacity(1), MIN_BUCKET_CAPACITY);
        assert_eq!(clamp_capacity(3), 4);
        assert_eq!(clamp_capacity(16), 16);
        assert_eq!(clamp_capacity(17), 32);
    }

    #[test]
    fn new_table_has_requested_length_and_empty_buckets() {
        let t: BucketTable<i32, i32> = BucketTable::new(8);
        assert_eq!(t.len(), 8);
        let guard = crossbeam::epoch::pin();
        for i in 0..8 {
            assert!(t.bucket(i).load(std::sync::atomic::Ordering::Acquire, &guard).is_null());
        }
    }

    #[test]
    fn index_of_masks_to_table_length() {
        let t: BucketTable<i32, i32> = BucketTable::new(8);
        assert_eq!(t.index_of(0), 0);
        assert_eq!(t.index_of(8), 0);
        assert_eq!(t.index_of(9), 1);
        assert_eq!(t.index_of(u32::MAX), 7);
    }
}
