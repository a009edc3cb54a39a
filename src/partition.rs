//! A single stripe: one bucket table, one lock, and the mutators that
//! serialize writes against it while leaving readers untouched.
//!
//! Every mutating operation follows the same shape: acquire the partition
//! lock via the scan-and-lock protocol (§[`Partition::acquire_lock`]),
//! locate the target bucket, splice or unlink a node, publish with a
//! release-store, bump `mod_stamp`, release the lock. Reads never touch the
//! lock: they load the bucket table and chain with acquire semantics and
//! walk it exactly as a writer would, just without ever blocking.

use crate::bucket::{clamp_capacity, BucketTable, MAX_CAPACITY};
use crate::node::Node;
use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Maximum non-blocking scan-and-lock attempts before falling back to a
/// blocking lock acquire. 64 on multiprocessor hosts mirrors the upstream
/// tuning; a single CPU gets no benefit from spinning, so it falls back
/// immediately.
static MAX_SCAN_RETRIES: Lazy<i32> = Lazy::new(|| if num_cpus::get() > 1 { 64 } else { 1 });

pub(crate) struct Partition<K, V> {
    index: usize,
    table: Atomic<BucketTable<K, V>>,
    count: AtomicUsize,
    mod_stamp: AtomicU32,
    threshold: AtomicUsize,
    load_factor: f64,
    lock: Mutex<()>,
}

impl<K, V> Partition<K, V> {
    pub(crate) fn new(index: usize, initial_capacity: usize, load_factor: f64) -> Self {
        let capacity = clamp_capacity(initial_capacity);
        let threshold = (capacity as f64 * load_factor) as usize;
        Partition {
            index,
            table: Atomic::new(BucketTable::new(capacity)),
            count: AtomicUsize::new(0),
            mod_stamp: AtomicU32::new(0),
            threshold: AtomicUsize::new(threshold),
            load_factor,
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn load_factor(&self) -> f64 {
        self.load_factor
    }

    /// Entry count as of the last completed mutation. Exact only when no
    /// writer currently holds the lock; see the aggregate protocol for how
    /// callers turn this into a stable cross-partition total.
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// A monotonically bumped counter, one increment per completed
    /// mutation. Used by the aggregate protocol to detect whether a
    /// partition changed between two observations.
    pub(crate) fn mod_stamp(&self) -> u32 {
        self.mod_stamp.load(Ordering::Acquire)
    }

    /// Blocks until the partition's lock is held. Used by the aggregate
    /// protocol's lock-all fallback.
    pub(crate) fn lock_all(&self) -> MutexGuard<'_, ()> {
        self.lock.lock()
    }

    pub(crate) fn bucket_table_len(&self, guard: &Guard) -> usize {
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }.len()
    }

    pub(crate) fn snapshot_table<'g>(&self, guard: &'g Guard) -> Shared<'g, BucketTable<K, V>> {
        self.table.load(Ordering::Acquire, guard)
    }

    // ---- scan-and-lock -----------------------------------------------

    /// Interleaves non-blocking lock attempts with a chain walk: while the
    /// lock is contended, keep tracing the bucket chain so its cache lines
    /// are warm by the time the lock is actually acquired. The walk is a
    /// hint only — every mutator re-scans authoritatively once the lock is
    /// held.
    fn acquire_lock(&self, guard: &Guard, hash: u32, key: &K) -> MutexGuard<'_, ()>
    where
        K: Eq,
    {
        let mut retries: i32 = -1;
        let mut head = self.table_bucket_head(guard, hash);
        let mut cur = head;
        loop {
            if let Some(g) = self.lock.try_lock() {
                return g;
            }
            if retries < 0 {
                // Locating: advance one link per attempt so the lock is
                // polled between cache misses instead of after them all.
                if cur.is_null() {
                    retries = 0;
                } else {
                    let n = unsafe { cur.deref() };
                    if n.hash == hash && n.key.as_ref() == key {
                        retries = 0;
                    } else {
                        cur = n.next.load(Ordering::Acquire, guard);
                    }
                }
            } else {
                retries += 1;
                if retries > *MAX_SCAN_RETRIES {
                    return self.lock.lock();
                }
                if retries % 2 == 0 {
                    let fresh_head = self.table_bucket_head(guard, hash);
                    if fresh_head.as_raw() != head.as_raw() {
                        head = fresh_head;
                        cur = head;
                        retries = -1;
                    }
                }
            }
        }
    }

    fn table_bucket_head<'g>(&self, guard: &'g Guard, hash: u32) -> Shared<'g, Node<K, V>> {
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let idx = table.index_of(hash);
        table.bucket(idx).load(Ordering::Acquire, guard)
    }

    /// Like [`Partition::acquire_lock`], but for `put`: while contending for
    /// the lock, speculatively build the node that will be needed if the
    /// key turns out to be absent, so the allocation doesn't happen while
    /// the lock is held. `key`/`value` are handed back regardless of
    /// whether a candidate was built, since building one only bumps their
    /// `Arc` refcount rather than consuming them.
    fn acquire_lock_for_put(
        &self,
        guard: &Guard,
        hash: u32,
        key: Arc<K>,
        value: Arc<V>,
    ) -> (MutexGuard<'_, ()>, Arc<K>, Arc<V>, Option<Node<K, V>>)
    where
        K: Eq,
    {
        let mut retries: i32 = -1;
        let mut candidate: Option<Node<K, V>> = None;
        let mut head = self.table_bucket_head(guard, hash);
        let mut cur = head;
        loop {
            if let Some(g) = self.lock.try_lock() {
                return (g, key, value, candidate);
            }
            if retries < 0 {
                // Locating: advance one link per attempt, speculatively
                // allocating a candidate node only once the chain is known
                // to be exhausted.
                if cur.is_null() {
                    if candidate.is_none() {
                        candidate = Some(Node::new(hash, Arc::clone(&key), Arc::clone(&value)));
                    }
                    retries = 0;
                } else {
                    let n = unsafe { cur.deref() };
                    if n.hash == hash && n.key.as_ref() == key.as_ref() {
                        retries = 0;
                    } else {
                        cur = n.next.load(Ordering::Acquire, guard);
                    }
                }
            } else {
                retries += 1;
                if retries > *MAX_SCAN_RETRIES {
                    return (self.lock.lock(), key, value, candidate);
                }
                if retries % 2 == 0 {
                    let fresh_head = self.table_bucket_head(guard, hash);
                    if fresh_head.as_raw() != head.as_raw() {
                        head = fresh_head;
                        cur = head;
                        retries = -1;
                        candidate = None;
                    }
                }
            }
        }
    }

    // ---- reads ---------------------------------------------------------

    pub(crate) fn get(&self, guard: &Guard, hash: u32, key: &K) -> Option<Arc<V>>
    where
        K: Eq,
    {
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let mut cur = table.bucket(table.index_of(hash)).load(Ordering::Acquire, guard);
        while !cur.is_null() {
            let n = unsafe { cur.deref() };
            if n.hash == hash && n.key.as_ref() == key {
                return Some(Arc::clone(&n.value));
            }
            cur = n.next.load(Ordering::Acquire, guard);
        }
        None
    }

    pub(crate) fn contains_value(&self, guard: &Guard, value: &V) -> bool
    where
        V: PartialEq,
    {
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        for i in 0..table.len() {
            let mut cur = table.bucket(i).load(Ordering::Acquire, guard);
            while !cur.is_null() {
                let n = unsafe { cur.deref() };
                if n.value.as_ref() == value {
                    return true;
                }
                cur = n.next.load(Ordering::Acquire, guard);
            }
        }
        false
    }

    // ---- writes ----------------------------------------------------------

    /// Inserts or overwrites `key`. If `only_if_absent` is set and the key
    /// is already present, the map is left untouched. Returns the value
    /// that was displaced, if any.
    ///
    /// Takes `key`/`value` already wrapped in `Arc` so that callers copying
    /// entries between maps (the bulk-copy constructor, rehash) can reuse
    /// the existing allocation instead of cloning.
    pub(crate) fn put(&self, guard: &Guard, hash: u32, key: Arc<K>, value: Arc<V>, only_if_absent: bool) -> Option<Arc<V>>
    where
        K: Eq,
    {
        let (_lock, key, value, candidate) = self.acquire_lock_for_put(guard, hash, key, value);

        let table_shared = self.table.load(Ordering::Acquire, guard);
        let table = unsafe { table_shared.deref() };
        let idx = table.index_of(hash);
        let head = table.bucket(idx);

        let mut cur = head.load(Ordering::Acquire, guard);
        let mut prev: Option<Shared<Node<K, V>>> = None;
        while !cur.is_null() {
            let n = unsafe { cur.deref() };
            if n.hash == hash && n.key.as_ref() == key.as_ref() {
                let old_value = Arc::clone(&n.value);
                if only_if_absent {
                    return Some(old_value);
                }
                let mut replacement = Node::new(hash, key, value);
                replacement.next.store(n.next.load(Ordering::Acquire, guard), Ordering::Relaxed);
                let replacement = Owned::new(replacement);
                match prev {
                    Some(p) => unsafe { p.deref() }.next.store(replacement, Ordering::Release),
                    None => head.store(replacement, Ordering::Release),
                }
                self.mod_stamp.fetch_add(1, Ordering::Release);
                unsafe { guard.defer_destroy(cur) };
                return Some(old_value);
            }
            prev = Some(cur);
            cur = n.next.load(Ordering::Acquire, guard);
        }

        let mut new_node = candidate.unwrap_or_else(|| Node::new(hash, key, value));
        let new_count = self.count.load(Ordering::Relaxed) + 1;

        if new_count > self.threshold.load(Ordering::Relaxed) && table.len() < MAX_CAPACITY {
            self.rehash(guard, table_shared, new_node);
        } else {
            let current_head = head.load(Ordering::Acquire, guard);
            new_node.next.store(current_head, Ordering::Relaxed);
            head.store(Owned::new(new_node), Ordering::Release);
        }
        self.count.store(new_count, Ordering::Release);
        self.mod_stamp.fetch_add(1, Ordering::Release);
        None
    }

    /// Removes `key`, provided `expected` is either absent (remove
    /// unconditionally) or matches the current value (remove-if-equals).
    pub(crate) fn remove(&self, guard: &Guard, hash: u32, key: &K, expected: Option<&V>) -> Option<Arc<V>>
    where
        K: Eq,
        V: PartialEq,
    {
        let _lock = self.acquire_lock(guard, hash, key);
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let idx = table.index_of(hash);
        let head = table.bucket(idx);

        let mut cur = head.load(Ordering::Acquire, guard);
        let mut prev: Option<Shared<Node<K, V>>> = None;
        while !cur.is_null() {
            let n = unsafe { cur.deref() };
            if n.hash == hash && n.key.as_ref() == key {
                if let Some(expected_value) = expected {
                    if n.value.as_ref() != expected_value {
                        return None;
                    }
                }
                let successor = n.next.load(Ordering::Acquire, guard);
                match prev {
                    Some(p) => unsafe { p.deref() }.next.store(successor, Ordering::Release),
                    None => head.store(successor, Ordering::Release),
                }
                self.count.fetch_sub(1, Ordering::Release);
                self.mod_stamp.fetch_add(1, Ordering::Release);
                let old_value = Arc::clone(&n.value);
                unsafe { guard.defer_destroy(cur) };
                return Some(old_value);
            }
            prev = Some(cur);
            cur = n.next.load(Ordering::Acquire, guard);
        }
        None
    }

    /// Replaces `key`'s value with `new` iff its current value equals
    /// `expected`.
    pub(crate) fn replace_if_equals(&self, guard: &Guard, hash: u32, key: &K, expected: &V, new: V) -> bool
    where
        K: Eq,
        V: PartialEq,
    {
        let _lock = self.acquire_lock(guard, hash, key);
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let idx = table.index_of(hash);
        let head = table.bucket(idx);

        let mut cur = head.load(Ordering::Acquire, guard);
        let mut prev: Option<Shared<Node<K, V>>> = None;
        while !cur.is_null() {
            let n = unsafe { cur.deref() };
            if n.hash == hash && n.key.as_ref() == key {
                if n.value.as_ref() != expected {
                    return false;
                }
                let mut replacement = Node::new(hash, Arc::clone(&n.key), Arc::new(new));
                replacement.next.store(n.next.load(Ordering::Acquire, guard), Ordering::Relaxed);
                let replacement = Owned::new(replacement);
                match prev {
                    Some(p) => unsafe { p.deref() }.next.store(replacement, Ordering::Release),
                    None => head.store(replacement, Ordering::Release),
                }
                self.mod_stamp.fetch_add(1, Ordering::Release);
                unsafe { guard.defer_destroy(cur) };
                return true;
            }
            prev = Some(cur);
            cur = n.next.load(Ordering::Acquire, guard);
        }
        false
    }

    /// Unconditionally replaces `key`'s value, if present. Returns the
    /// previous value.
    pub(crate) fn replace(&self, guard: &Guard, hash: u32, key: &K, new: V) -> Option<Arc<V>>
    where
        K: Eq,
    {
        let _lock = self.acquire_lock(guard, hash, key);
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        let idx = table.index_of(hash);
        let head = table.bucket(idx);

        let mut cur = head.load(Ordering::Acquire, guard);
        let mut prev: Option<Shared<Node<K, V>>> = None;
        while !cur.is_null() {
            let n = unsafe { cur.deref() };
            if n.hash == hash && n.key.as_ref() == key {
                let old_value = Arc::clone(&n.value);
                let mut replacement = Node::new(hash, Arc::clone(&n.key), Arc::new(new));
                replacement.next.store(n.next.load(Ordering::Acquire, guard), Ordering::Relaxed);
                let replacement = Owned::new(replacement);
                match prev {
                    Some(p) => unsafe { p.deref() }.next.store(replacement, Ordering::Release),
                    None => head.store(replacement, Ordering::Release),
                }
                self.mod_stamp.fetch_add(1, Ordering::Release);
                unsafe { guard.defer_destroy(cur) };
                return Some(old_value);
            }
            prev = Some(cur);
            cur = n.next.load(Ordering::Acquire, guard);
        }
        None
    }

    pub(crate) fn clear(&self, guard: &Guard) {
        let _lock = self.lock.lock();
        let table = unsafe { self.table.load(Ordering::Acquire, guard).deref() };
        for i in 0..table.len() {
            let bucket = table.bucket(i);
            let mut cur = bucket.load(Ordering::Acquire, guard);
            if cur.is_null() {
                continue;
            }
            while !cur.is_null() {
                let n = unsafe { cur.deref() };
                let next = n.next.load(Ordering::Acquire, guard);
                unsafe { guard.defer_destroy(cur) };
                cur = next;
            }
            bucket.store(Shared::null(), Ordering::Release);
        }
        self.count.store(0, Ordering::Release);
        self.mod_stamp.fetch_add(1, Ordering::Release);
    }

    // ---- rehash ----------------------------------------------------------

    /// Doubles the bucket table. Each old chain splits into at most two new
    /// chains because a node's new bucket index is either its old index or
    /// that index plus the old length. The longest same-bucket suffix
    /// (`last_run`) is relinked as-is; everything before it is cloned (an
    /// `Arc` bump, not a deep copy) into the head of its new chain. `new_node`
    /// — the entry whose insertion triggered this rehash — is placed last.
    fn rehash<'g>(&self, guard: &'g Guard, old_table_shared: Shared<'g, BucketTable<K, V>>, new_node: Node<K, V>) {
        let old_table = unsafe { old_table_shared.deref() };
        let old_len = old_table.len();
        let new_len = (old_len * 2).min(MAX_CAPACITY);
        let new_table = BucketTable::new(new_len);
        let new_mask = new_len - 1;

        log::debug!("partition {}: rehashing {} -> {} buckets", self.index, old_len, new_len);

        for old_idx in 0..old_len {
            let old_head = old_table.bucket(old_idx).load(Ordering::Acquire, guard);
            if old_head.is_null() {
                continue;
            }
            let lo_bit = old_idx;
            let hi_bit = old_idx + old_len;

            let mut last_run = old_head;
            let mut last_run_bit = unsafe { old_head.deref() }.hash as usize & new_mask;
            let mut p = old_head;
            while !p.is_null() {
                let n = unsafe { p.deref() };
                let bit = n.hash as usize & new_mask;
                if bit != last_run_bit {
                    last_run_bit = bit;
                    last_run = p;
                }
                p = n.next.load(Ordering::Acquire, guard);
            }

            let mut lo_head: Shared<Node<K, V>> = Shared::null();
            let mut hi_head: Shared<Node<K, V>> = Shared::null();
            let mut lo_tail: Shared<Node<K, V>> = Shared::null();
            let mut hi_tail: Shared<Node<K, V>> = Shared::null();

            let mut p = old_head;
            while p != last_run {
                let n = unsafe { p.deref() };
                let bit = n.hash as usize & new_mask;
                let (k, v) = n.clone_kv();
                let cloned = Owned::new(Node::new(n.hash, k, v)).into_shared(guard);
                if bit == lo_bit {
                    unsafe { cloned.deref() }.next.store(lo_head, Ordering::Relaxed);
                    if lo_head.is_null() {
                        lo_tail = cloned;
                    }
                    lo_head = cloned;
                } else {
                    unsafe { cloned.deref() }.next.store(hi_head, Ordering::Relaxed);
                    if hi_head.is_null() {
                        hi_tail = cloned;
                    }
                    hi_head = cloned;
                }
                let next_p = n.next.load(Ordering::Acquire, guard);
                // Safe to retire now: this node is unreachable from the new
                // table, and the old table (still intact) is not touched by
                // this rehash, so in-flight readers of it are unaffected.
                unsafe { guard.defer_destroy(p) };
                p = next_p;
            }

            if last_run_bit == lo_bit {
                if lo_tail.is_null() {
                    lo_head = last_run;
                } else {
                    unsafe { lo_tail.deref() }.next.store(last_run, Ordering::Relaxed);
                }
            } else if hi_tail.is_null() {
                hi_head = last_run;
            } else {
                unsafe { hi_tail.deref() }.next.store(last_run, Ordering::Relaxed);
            }

            new_table.bucket(lo_bit).store(lo_head, Ordering::Relaxed);
            new_table.bucket(hi_bit).store(hi_head, Ordering::Relaxed);
        }

        let new_idx = new_node.hash as usize & new_mask;
        let existing = new_table.bucket(new_idx).load(Ordering::Relaxed, guard);
        let mut new_node = new_node;
        new_node.next.store(existing, Ordering::Relaxed);
        new_table.bucket(new_idx).store(Owned::new(new_node), Ordering::Relaxed);

        self.threshold
            .store((new_len as f64 * self.load_factor) as usize, Ordering::Relaxed);
        self.table.store(Owned::new(new_table), Ordering::Release);
        // The array of bucket-head pointers, not any node it pointed to —
        // `Atomic<T>` never recursively frees its pointee, so this alone
        // cannot double-free a node reused or cloned above.
        unsafe { guard.defer_destroy(old_table_shared) };
    }
}

impl<K, V> Drop for Partition<K, V> {
    fn drop(&mut self) {
        // No concurrent access is possible once we're being dropped, so an
        // unprotected guard is sound here.
        let guard = unsafe { epoch::unprotected() };
        let table_shared = self.table.load(Ordering::Acquire, guard);
        if table_shared.is_null() {
            return;
        }
        let table = unsafe { table_shared.deref() };
        for i in 0..table.len() {
            let mut cur = table.bucket(i).load(Ordering::Acquire, guard);
            while !cur.is_null() {
                let owned = unsafe { cur.into_owned() };
                let next = owned.next.load(Ordering::Acquire, guard);
                drop(owned);
                cur = next;
            }
        }
        drop(unsafe { table_shared.into_owned() });
    }
}
