//! The allocator as the rest of the firmware sees it: one arena behind one
//! lock.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice,
};

use log::error;
use spin::{mutex::Mutex, relax::Yield};

use crate::{arena::Arena, error::Error, memory::UsableMemory, stats::Stats};

/// Arena shared by every task.
///
/// Each operation holds the lock from start to finish, so no task ever sees
/// a list half way through a split or a merge. A task that finds the lock
/// taken yields until the holder is done.
///
/// Not for interrupt handlers: the lock may make the caller wait.
pub struct SharedMem {
    arena: Mutex<Option<Arena>, Yield>,
}

impl SharedMem {
    pub const fn new() -> Self {
        Self {
            arena: Mutex::new(None),
        }
    }

    /// Bootstraps the arena from the usable memory the environment reports.
    ///
    /// The region is moved into the arena, so the same bytes can never back
    /// two allocators:
    ///
    /// ```compile_fail
    /// use shmalloc::{HostMemory, SharedMem};
    ///
    /// let (a, b) = (SharedMem::new(), SharedMem::new());
    /// let memory = HostMemory::new(4096).unwrap();
    /// a.init(memory);
    /// b.init(memory);
    /// ```
    ///
    /// # Panics
    ///
    /// If called more than once.
    pub fn init<M: UsableMemory + Send + 'static>(&self, memory: M) {
        let mut arena = self.arena.lock();

        if arena.is_some() {
            error!("shared memory initialized twice");
            panic!("shared memory initialized twice");
        }

        *arena = Some(Arena::carve(memory));
    }

    pub fn is_initialized(&self) -> bool {
        self.arena.lock().is_some()
    }

    /// Payload bytes available in the largest free chunk. Zero before
    /// [`SharedMem::init`].
    pub fn capacity(&self) -> usize {
        self.arena.lock().as_ref().map_or(0, Arena::capacity)
    }

    /// Acquires a buffer of `size` bytes that goes back to the arena when
    /// dropped.
    pub fn acquire(&self, size: usize) -> Result<SharedBuffer<'_>, Error> {
        let ptr = self.acquire_raw(size)?;

        Ok(SharedBuffer {
            owner: self,
            ptr,
            len: size,
        })
    }

    /// Acquires a buffer of at least `size` bytes and hands over the raw
    /// pointer. Give it back with [`SharedMem::release_raw`].
    pub fn acquire_raw(&self, size: usize) -> Result<NonNull<u8>, Error> {
        self.arena
            .lock()
            .as_mut()
            .ok_or(Error::Uninitialized)?
            .acquire(size)
    }

    /// Returns a buffer obtained from [`SharedMem::acquire_raw`]. Null is
    /// ignored.
    ///
    /// **SAFETY**: `ptr` must be null or come from this allocator and not
    /// have been released already.
    pub unsafe fn release_raw(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        match self.arena.lock().as_mut() {
            Some(arena) => unsafe { arena.release(ptr) },
            None => error!("release of {:p} before shared memory initialization", ptr),
        }
    }

    /// Snapshot for the shmem console command. `None` before
    /// [`SharedMem::init`].
    pub fn stats(&self) -> Option<Stats> {
        self.arena.lock().as_ref().map(Arena::stats)
    }
}

impl Default for SharedMem {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer borrowed from a [`SharedMem`], released on drop.
///
/// Dereferences to exactly the number of bytes requested.
pub struct SharedBuffer<'a> {
    owner: &'a SharedMem,
    ptr: NonNull<u8>,
    len: usize,
}

impl SharedBuffer<'_> {
    /// Keeps the buffer allocated and returns its pointer. Pass it to
    /// [`SharedMem::release_raw`] when done.
    pub fn into_raw(self) -> NonNull<u8> {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Deref for SharedBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for SharedBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for SharedBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for SharedBuffer<'_> {
    fn drop(&mut self) {
        unsafe { self.owner.release_raw(self.ptr.as_ptr()) };
    }
}

// The caller owns the bytes exclusively until the buffer is dropped.
unsafe impl Send for SharedBuffer<'_> {}
unsafe impl Sync for SharedBuffer<'_> {}
