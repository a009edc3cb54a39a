//! A segmented, lock-striped concurrent hash map.
//!
//! The map is split into a fixed number of independent partitions
//! ("stripes"), each with its own bucket table and lock. Reads never
//! acquire a lock — they walk a bucket chain using only acquire-loads, so
//! they never block behind a writer and never block each other. Writers
//! lock only the partition their key hashes into, so writers on distinct
//! partitions proceed fully in parallel; only writers racing for the same
//! partition serialize against each other.
//!
//! ```
//! use stripemap::StripedHashMap;
//!
//! let map = StripedHashMap::new();
//! map.insert("a", 1);
//! assert_eq!(map.get(&"a"), Some(1));
//! assert_eq!(map.len(), 1);
//! ```
//!
//! See `SPEC_FULL.md` in the repository root for the full design: the
//! memory model backing lock-free reads, the scan-and-lock protocol
//! writers use to acquire a partition's lock, partition-local rehashing,
//! and the retry-then-lock-all protocol behind `len`/`is_empty`/
//! `contains_value`.

mod aggregate;
mod bucket;
mod directory;
mod error;
mod hash;
mod iter;
mod map;
mod node;
mod partition;

#[cfg(feature = "codec")]
mod codec;

pub use error::{MapError, Result};
pub use iter::{Entries, Keys, Values};
pub use map::{StripedHashMap, StripedHashMapBuilder};

#[cfg(feature = "codec")]
pub use codec::{from_bytes, to_bytes};
