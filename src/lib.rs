//! Fixed-arena shared memory allocator.
//!
//! The firmware reserves one block of RAM at boot and every task borrows
//! short-lived buffers out of it: protocol frames, flash pages, crypto
//! scratch space. There is no other heap.
//!
//! ```text
//!                    SharedMem (one lock)
//!                            |
//!                          Arena
//!         +------------------+------------------+
//!         |                                     |
//!     FreeList                           allocated List
//!  (address ordered,                    (most recent first)
//!   always coalesced)
//! ```
//!
//! Buffers are carved with a best-fit search over the free list and merged
//! back with their free neighbors on release, so two adjacent releases
//! always leave a single free chunk behind.
//!
//! ```no_run
//! use shmalloc::{HostMemory, SHARED_MEM};
//!
//! SHARED_MEM.init(HostMemory::new(64 * 1024).unwrap());
//!
//! let mut frame = shmalloc::acquire(256).unwrap();
//! frame.fill(0);
//! // `frame` goes back to the arena here.
//! ```

mod arena;
mod chunk;
mod error;
mod freelist;
mod list;
mod memory;
mod shared;
mod stats;
mod utils;

pub use arena::Arena;
pub use chunk::CHUNK_HEADER_SIZE;
pub use error::{Error, InvariantError};
pub use memory::{HostMemory, StaticRegion, UsableMemory};
pub use shared::{SharedBuffer, SharedMem};
pub use stats::Stats;
pub use utils::WORD_SIZE;

/// The arena every task in the firmware shares.
pub static SHARED_MEM: SharedMem = SharedMem::new();

/// Acquires a buffer from [`SHARED_MEM`]. See [`SharedMem::acquire`].
pub fn acquire(size: usize) -> Result<SharedBuffer<'static>, Error> {
    SHARED_MEM.acquire(size)
}

/// Largest request [`SHARED_MEM`] can serve right now.
pub fn capacity() -> usize {
    SHARED_MEM.capacity()
}

/// Snapshot of [`SHARED_MEM`], `None` before it is initialized.
pub fn stats() -> Option<Stats> {
    SHARED_MEM.stats()
}
