//! Error types returned by the map's fallible operations.

use thiserror::Error;

/// Everything that can go wrong when constructing, configuring, or iterating
/// a [`crate::StripedHashMap`](crate::map::StripedHashMap).
///
/// Per-key operations (`get`, `insert`, `remove`, ...) never fail: a missing
/// key or value is represented by `Option`/`bool`, not by an error variant,
/// since Rust's type system already forbids passing an absent key or value
/// by reference or by value at the call site.
#[derive(Debug, Error)]
pub enum MapError {
    /// A constructor or builder argument was out of its valid range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A deserialized snapshot described a partition layout that cannot
    /// exist (zero partitions, a non-power-of-two count, or a count above
    /// the maximum).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A cursor was used incorrectly: `remove` called before any `next`, or
    /// called again after the cursor already removed the same entry, or any
    /// cursor call made after the cursor was exhausted.
    #[error("cursor misuse: {0}")]
    CursorMisuse(String),
}

/// Convenience alias used throughout the crate's fallible APIs.
pub type Result<T> = std::result::Result<T, MapError>;
