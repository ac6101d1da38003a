//! Allocator error types.

use thiserror::Error;

/// Why an allocation request was turned down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No single free chunk is large enough right now. The arena may hold
    /// enough free bytes in total, just not contiguously. Retry later or ask
    /// for less.
    #[error("no free chunk can hold {requested} bytes right now")]
    Busy {
        /// Payload bytes the caller asked for.
        requested: usize,
    },
    /// Zero bytes, or more than the arena could hold even when empty.
    #[error("invalid allocation size {requested} (must be between 1 and {limit})")]
    InvalidSize {
        /// Payload bytes the caller asked for.
        requested: usize,
        /// Largest request this arena can ever satisfy.
        limit: usize,
    },
    /// The shared allocator was used before its arena was bootstrapped.
    #[error("shared memory used before initialization")]
    Uninitialized,
}

/// Corruption found while walking the chunk lists.
///
/// These never happen when callers only release what they acquired, once.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvariantError {
    #[error("chunk at {addr:#x} ({size} bytes) lies outside the arena")]
    OutOfBounds { addr: usize, size: usize },
    #[error("chunk at {addr:#x} is smaller than a chunk header ({size} bytes)")]
    Undersized { addr: usize, size: usize },
    #[error("free chunk at {next:#x} does not come after {prev:#x}")]
    Unordered { prev: usize, next: usize },
    #[error("free chunks at {prev:#x} and {next:#x} touch but were not merged")]
    Unmerged { prev: usize, next: usize },
    #[error("chunks at {first:#x} and {second:#x} overlap")]
    Overlap { first: usize, second: usize },
    #[error("back link of chunk at {addr:#x} does not point to its predecessor")]
    BrokenLink { addr: usize },
    #[error("chunks cover {counted} bytes but the arena is {len} bytes")]
    Conservation { counted: usize, len: usize },
    #[error("released buffer at {addr:#x} is not an allocated chunk")]
    NotAllocated { addr: usize },
}
