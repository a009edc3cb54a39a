//! Chain entry nodes.
//!
//! A node's `hash` and `key` never change after construction; its `value`
//! is likewise fixed for the node's lifetime. "Updating" a key's value does
//! not mutate a node in place — it splices a *replacement* node with the
//! new value into the chain and retires the old one (§[`crate::partition`]).
//! This sidesteps the need for a second, separately-reclaimed atomic slot
//! per node and keeps exactly one object — the node itself — subject to
//! epoch reclamation.
//!
//! `key` and `value` are held behind `Arc` rather than stored inline. The
//! rehash's "longest run" optimization (§[`crate::partition`]) reuses the
//! tail of an old chain by reference, but nodes *before* the split point
//! must become new node objects (their `next` differs) while keeping the
//! same key and value. Sharing through `Arc` makes that a refcount bump
//! instead of a `Clone` bound on every key and value type the map is ever
//! instantiated with.
//!
//! Only `next` is genuinely mutable, since unlinking or splicing a node
//! rewrites its predecessor's (or its bucket head's) link, never the node
//! being unlinked.

use crossbeam::epoch::Atomic;
use std::sync::Arc;

/// A single entry in a bucket chain.
pub(crate) struct Node<K, V> {
    pub(crate) hash: u32,
    pub(crate) key: Arc<K>,
    pub(crate) value: Arc<V>,
    pub(crate) next: Atomic<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    /// Builds a new, unlinked node. The caller publishes it by storing a
    /// reference to it into a bucket head or a predecessor's `next`.
    pub(crate) fn new(hash: u32, key: Arc<K>, value: Arc<V>) -> Self {
        Node {
            hash,
            key,
            value,
            next: Atomic::null(),
        }
    }

    /// Builds a node that shares the same key and value as `self`. Used to
    /// splice a replacement node into the chain at the same logical slot
    /// (`next` is set separately by the caller once the new position's
    /// predecessor is known).
    pub(crate) fn clone_kv(&self) -> (Arc<K>, Arc<V>) {
        (Arc::clone(&self.key), Arc::clone(&self.value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_has_null_next() {
        let n = Node::new(1, Arc::new("a"), Arc::new(1));
        let guard = crossbeam::epoch::pin();
        assert!(n.next.load(std::sync::atomic::Ordering::Acquire, &guard).is_null());
    }

    #[test]
    fn clone_kv_shares_the_same_allocations() {
        let key = Arc::new("a");
        let value = Arc::new(1);
        let n = Node::new(1, Arc::clone(&key), Arc::clone(&value));
        let (k2, v2) = n.clone_kv();
        assert!(Arc::ptr_eq(&key, &k2));
        assert!(Arc::ptr_eq(&value, &v2));
        assert_eq!(Arc::strong_count(&key), 3);
    }
}
