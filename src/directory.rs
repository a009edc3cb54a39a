//! The fixed partition array and lazy partition materialization.

use crate::partition::Partition;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

/// Hard ceiling on the number of partitions, regardless of the requested
/// concurrency level. 65536 partitions already means 65536 independent
/// locks; beyond that, contention was never the bottleneck.
pub(crate) const MAX_PARTITIONS: usize = 1 << 16;

/// A fixed array of lazily-materialized partitions.
///
/// Partition 0 is built eagerly at construction, so there is always at
/// least one fully-formed partition to use as a prototype (bucket capacity,
/// load factor) for the others. Every other slot starts null and is
/// populated on first write via `compare_exchange`; the array itself is
/// never reallocated.
pub(crate) struct Directory<K, V> {
    slots: Box<[AtomicPtr<Partition<K, V>>]>,
    mask: usize,
    load_factor: f64,
    partition_bucket_capacity: usize,
}

impl<K, V> Directory<K, V> {
    pub(crate) fn new(partition_count: usize, partition_bucket_capacity: usize, load_factor: f64) -> Self {
        debug_assert!(partition_count.is_power_of_two());
        let mut slots = Vec::with_capacity(partition_count);
        slots.push(AtomicPtr::new(Box::into_raw(Box::new(Partition::new(
            0,
            partition_bucket_capacity,
            load_factor,
        )))));
        for _ in 1..partition_count {
            slots.push(AtomicPtr::new(std::ptr::null_mut()));
        }
        Directory {
            slots: slots.into_boxed_slice(),
            mask: partition_count - 1,
            load_factor,
            partition_bucket_capacity,
        }
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn load_factor(&self) -> f64 {
        self.load_factor
    }

    /// Selects the partition index for a 32-bit spread hash: the high bits,
    /// so that partition selection and in-partition bucket selection (which
    /// uses the low bits) are drawn from independent parts of the hash.
    pub(crate) fn index_of(&self, hash: u32) -> usize {
        if self.mask == 0 {
            return 0;
        }
        let shift = 32 - (self.mask.count_ones());
        ((hash as usize) >> shift) & self.mask
    }

    /// Returns the partition at `index`, materializing it first if this is
    /// the first write ever routed there.
    pub(crate) fn ensure_partition(&self, index: usize) -> &Partition<K, V> {
        let slot = &self.slots[index];
        let existing = slot.load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let candidate = Box::into_raw(Box::new(Partition::new(index, self.partition_bucket_capacity, self.load_factor)));
        match slot.compare_exchange(std::ptr::null_mut(), candidate, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => {
                log::debug!("partition {}: materialized", index);
                unsafe { &*candidate }
            }
            Err(winner) => {
                // Lost the race: drop our candidate and adopt the winner's.
                drop(unsafe { Box::from_raw(candidate) });
                unsafe { &*winner }
            }
        }
    }

    /// Returns the partition at `index` only if it has already been
    /// materialized, without creating it. Used by read-only aggregate paths
    /// that should not force allocation of partitions nobody has written to.
    pub(crate) fn existing_partition(&self, index: usize) -> Option<&Partition<K, V>> {
        let ptr = self.slots[index].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { &*ptr })
        }
    }
}

impl<K, V> Drop for Directory<K, V> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let ptr = slot.load(Ordering::Acquire);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

// SAFETY: a `Directory` only ever hands out `&Partition<K, V>` references,
// and `Partition` itself is `Sync` whenever `K`/`V` are `Send + Sync` (the
// same bound the map's public API already requires for the map to be
// shareable across threads).
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Directory<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Directory<K, V> {}

/// Smallest power of two `>= requested`, clamped to `[1, MAX_PARTITIONS]`.
pub(crate) fn clamp_partition_count(requested: usize) -> usize {
    requested.max(1).next_power_of_two().min(MAX_PARTITIONS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_to_max_partitions() {
        assert_eq!(clamp_partition_count(1_000_000), MAX_PARTITIONS);
        assert_eq!(clamp_partition_count(3), 4);
        assert_eq!(clamp_partition_count(0), 1);
    }

    #[test]
    fn lazily_materializes_non_zero_partitions() {
        let _ = env_logger::try_init();
        let dir: Directory<Arc<str>, i32> = Directory::new(4, 2, 0.75);
        assert!(dir.existing_partition(1).is_none());
        dir.ensure_partition(1);
        assert!(dir.existing_partition(1).is_some());
    }
}
