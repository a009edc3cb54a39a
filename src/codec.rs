//! Legacy serialization framing (behind the `codec` feature).
//!
//! A snapshot is the partition count and load factor the map was
//! configured with, followed by every `(key, value)` pair in arbitrary
//! order. Writing one forces every partition to materialize first, so the
//! partition count in the snapshot always matches what a reader will
//! reconstruct — there is no way to observe a lazily-absent partition in a
//! persisted snapshot. Reading one validates that count before touching
//! anything else: a non-power-of-two, zero, or over-the-limit count is
//! rejected as a configuration error rather than silently clamped, since by
//! construction a value written by this crate is never any of those.
//!
//! This module is a wrapper over the public façade, not a new concurrency
//! primitive: writing calls [`StripedHashMap::entries`] and reading calls
//! [`StripedHashMap::insert`] in a loop.

use crate::directory::MAX_PARTITIONS;
use crate::error::MapError;
use crate::map::StripedHashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;

#[derive(Serialize, Deserialize)]
struct Snapshot<K, V> {
    partition_count: usize,
    load_factor: f64,
    entries: Vec<(K, V)>,
}

/// Serializes `map` into a compact binary snapshot.
pub fn to_bytes<K, V>(map: &StripedHashMap<K, V>) -> Result<Vec<u8>, MapError>
where
    K: Eq + Hash + Clone + Serialize + 'static,
    V: Clone + Serialize + 'static,
{
    for i in 0..map.partition_count() {
        // Force materialization so the persisted partition count reflects
        // every partition, not just the ones some writer has touched.
        let _ = map.directory_partition(i);
    }
    let entries: Vec<(K, V)> = map.entries().map(|(k, v)| ((*k).clone(), (*v).clone())).collect();
    let snapshot = Snapshot {
        partition_count: map.partition_count(),
        load_factor: map.load_factor(),
        entries,
    };
    let config = bincode::config::standard();
    bincode::serde::encode_to_vec(&snapshot, config).map_err(|e| MapError::Config(e.to_string()))
}

/// Reconstructs a map from a snapshot produced by [`to_bytes`].
///
/// Partitions are rebuilt at the minimum bucket capacity and left to grow
/// organically as entries are inserted, rather than pre-sized to their
/// original capacity.
pub fn from_bytes<K, V>(bytes: &[u8]) -> Result<StripedHashMap<K, V>, MapError>
where
    K: Eq + Hash + for<'de> Deserialize<'de> + 'static,
    V: for<'de> Deserialize<'de> + 'static,
{
    let config = bincode::config::standard();
    let (snapshot, _): (Snapshot<K, V>, usize) =
        bincode::serde::decode_from_slice(bytes, config).map_err(|e| MapError::Config(e.to_string()))?;

    if snapshot.partition_count == 0
        || !snapshot.partition_count.is_power_of_two()
        || snapshot.partition_count > MAX_PARTITIONS
    {
        return Err(MapError::Config(format!(
            "invalid persisted partition count: {}",
            snapshot.partition_count
        )));
    }

    let map = StripedHashMap::builder()
        .concurrency_level(snapshot.partition_count as i64)
        .load_factor(snapshot.load_factor)
        .build()?;
    for (key, value) in snapshot.entries {
        map.insert(key, value);
    }
    Ok(map)
}
