use std::{mem, ptr::NonNull};

use log::{debug, error, info};

use crate::{
    chunk::{self, CHUNK_HEADER_SIZE, Chunk, ChunkNode},
    error::{Error, InvariantError},
    freelist::FreeList,
    list::List,
    memory::UsableMemory,
    stats::Stats,
    utils::{WORD_SIZE, align, align_down},
};

/// The allocator engine: one fixed byte range and the two chunk lists that
/// partition it.
///
/// ```text
///  base                                                     base + len
///  +----------+----------+-------------+----------+-----------------+
///  | allocated|   free   |  allocated  | allocated|      free       |
///  +----------+----------+-------------+----------+-----------------+
/// ```
///
/// Every byte of the arena belongs to exactly one chunk. Free chunks are
/// linked in address order through [`FreeList`], allocated chunks are linked
/// most recent first in a plain [`List`]. A chunk moves between the two
/// lists, it is never copied.
///
/// `Arena` is not synchronized. [`crate::SharedMem`] puts it behind a lock.
pub struct Arena {
    base: NonNull<u8>,
    len: usize,
    free: FreeList,
    allocated: List<Chunk>,
    /// Largest chunk handed out since bootstrap.
    max_allocated: usize,
    /// Region the arena was carved from, kept alive and out of anyone
    /// else's hands for as long as the arena exists.
    _region: Option<Box<dyn UsableMemory + Send>>,
}

// The arena owns its memory exclusively, nothing about it is tied to the
// thread that created it.
unsafe impl Send for Arena {}

impl Arena {
    /// Seeds `[base, base + len)` as a single free chunk.
    ///
    /// **SAFETY**: the range must be valid for reads and writes, aligned for
    /// a chunk header, used by nothing else, and outlive the arena.
    ///
    /// # Panics
    ///
    /// If the range cannot hold at least one header and one word of payload,
    /// or `len` is not a multiple of the word size.
    pub unsafe fn init(base: NonNull<u8>, len: usize) -> Self {
        assert!(
            len > CHUNK_HEADER_SIZE,
            "arena of {len} bytes cannot hold a chunk header"
        );
        assert_eq!(len % WORD_SIZE, 0, "arena length must be word aligned");
        assert_eq!(
            base.as_ptr() as usize % mem::align_of::<ChunkNode>(),
            0,
            "arena base must be aligned for a chunk header"
        );

        let mut free = FreeList::new();

        unsafe {
            let node = List::write(Chunk { size: len }, base);
            free.insert(node);
        }

        info!("shared memory arena at {:p}, {} bytes", base, len);

        Self {
            base,
            len,
            free,
            allocated: List::new(),
            max_allocated: 0,
            _region: None,
        }
    }

    /// Carves the arena out of the region the environment reports as usable.
    ///
    /// The arena takes the region over, so no other arena can be built on
    /// the same bytes while this one lives. The start is rounded up and the
    /// length rounded down so that every chunk header lands on a word
    /// boundary.
    ///
    /// ```compile_fail
    /// use shmalloc::{Arena, HostMemory};
    ///
    /// let memory = HostMemory::new(4096).unwrap();
    /// let first = Arena::carve(memory);
    /// let second = Arena::carve(memory);
    /// ```
    pub fn carve<M: UsableMemory + Send + 'static>(memory: M) -> Self {
        let start = memory.base().as_ptr() as usize;
        let base_offset = start.next_multiple_of(mem::align_of::<ChunkNode>()) - start;
        let usable = memory.usable_end().saturating_sub(start + base_offset);

        let mut arena = unsafe {
            let base = memory.base().add(base_offset);
            Self::init(base, align_down(usable, WORD_SIZE))
        };

        arena._region = Some(Box::new(memory));
        arena
    }

    /// Arena length in bytes.
    pub fn size(&self) -> usize {
        self.len
    }

    /// First byte of the arena.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Largest request this arena could satisfy if everything were free.
    pub fn limit(&self) -> usize {
        self.len - CHUNK_HEADER_SIZE
    }

    /// Payload bytes available in the largest free chunk.
    ///
    /// This is the number to compare a request against: free bytes spread
    /// over several chunks cannot serve a single request.
    pub fn capacity(&self) -> usize {
        self.free.largest().saturating_sub(CHUNK_HEADER_SIZE)
    }

    /// Hands out a buffer of at least `size` bytes.
    ///
    /// The free chunk with the least headroom wins, the lowest address
    /// breaking ties. The buffer is word aligned and its length is `size`
    /// rounded up to a word, sometimes plus up to one header of slack.
    pub fn acquire(&mut self, size: usize) -> Result<NonNull<u8>, Error> {
        let limit = self.limit();

        let required = match align(size, WORD_SIZE) {
            Some(aligned) if size != 0 && size <= limit => aligned + CHUNK_HEADER_SIZE,
            _ => {
                return Err(Error::InvalidSize {
                    requested: size,
                    limit,
                });
            }
        };

        let Some((node, _headroom)) = self.free.best_fit(required) else {
            debug!(
                "acquire {size}: busy, largest free chunk is {} bytes",
                self.free.largest()
            );

            return Err(Error::Busy { requested: size });
        };

        let node = unsafe {
            let node = self.free.take(node, required);
            self.allocated.push_front(node);
            node
        };

        let granted = unsafe { node.as_ref().data.size };
        self.max_allocated = self.max_allocated.max(granted);

        let buffer = chunk::payload(node);
        debug!("acquire {size}: {granted} byte chunk, buffer at {:p}", buffer);

        self.validate();

        Ok(buffer)
    }

    /// Gives a buffer back, merging its chunk with any free neighbor.
    ///
    /// A null pointer is ignored.
    ///
    /// **SAFETY**: `buffer` must be null or come from [`Arena::acquire`] on
    /// this arena and not have been released since. Debug builds check this
    /// and panic instead of corrupting the lists.
    pub unsafe fn release(&mut self, buffer: *mut u8) {
        let Some(buffer) = NonNull::new(buffer) else {
            return;
        };

        let node = unsafe { chunk::from_payload(buffer) };

        if cfg!(any(debug_assertions, feature = "validate")) && !self.allocated.contains(node) {
            let err = InvariantError::NotAllocated {
                addr: buffer.as_ptr() as usize,
            };

            error!("shared memory corrupted: {err}");
            panic!("shared memory corrupted: {err}");
        }

        unsafe {
            debug!(
                "release {:p}: {} byte chunk",
                buffer,
                node.as_ref().data.size
            );

            self.allocated.remove(node);
            self.free.insert(node);
        }

        self.validate();
    }

    /// Counts for the shmem console command.
    pub fn stats(&self) -> Stats {
        Stats {
            total: self.len,
            allocated: self.allocated.iter().map(|chunk| chunk.size).sum(),
            free: self.free.total(),
            largest_free: self.free.largest(),
            max_allocated: self.max_allocated,
            free_chunks: self.free.chunks.len(),
            allocated_chunks: self.allocated.len(),
        }
    }

    /// Walks both lists and checks that they still partition the arena.
    ///
    /// Checks bounds, header sizes, back links, free list ordering and
    /// merging, overlap between any two chunks, and that every byte is
    /// counted exactly once.
    pub fn verify(&self) -> Result<(), InvariantError> {
        let start = self.base.as_ptr() as usize;
        let end = start + self.len;

        let mut chunks = Vec::with_capacity(self.free.chunks.len() + self.allocated.len());

        for list in [&self.free.chunks, &self.allocated] {
            let mut prev = None;

            for node in list.nodes() {
                let addr = chunk::start(node);
                let size = unsafe { node.as_ref().data.size };

                if unsafe { node.as_ref().prev } != prev {
                    return Err(InvariantError::BrokenLink { addr });
                }

                if size < CHUNK_HEADER_SIZE {
                    return Err(InvariantError::Undersized { addr, size });
                }

                if addr < start || addr.checked_add(size).is_none_or(|chunk_end| chunk_end > end) {
                    return Err(InvariantError::OutOfBounds { addr, size });
                }

                chunks.push((addr, size));
                prev = Some(node);
            }
        }

        for (prev, next) in self.free.chunks.nodes().zip(self.free.chunks.nodes().skip(1)) {
            let (prev_start, next_start) = (chunk::start(prev), chunk::start(next));

            if next_start <= prev_start {
                return Err(InvariantError::Unordered {
                    prev: prev_start,
                    next: next_start,
                });
            }

            if chunk::end(prev) == next_start {
                return Err(InvariantError::Unmerged {
                    prev: prev_start,
                    next: next_start,
                });
            }
        }

        chunks.sort_unstable();

        for pair in chunks.windows(2) {
            let ((first, first_size), (second, _)) = (pair[0], pair[1]);

            if first + first_size > second {
                return Err(InvariantError::Overlap { first, second });
            }
        }

        let counted: usize = chunks.iter().map(|&(_, size)| size).sum();

        if counted != self.len {
            return Err(InvariantError::Conservation {
                counted,
                len: self.len,
            });
        }

        Ok(())
    }

    #[inline]
    fn validate(&self) {
        if !cfg!(feature = "validate") {
            return;
        }

        if let Err(err) = self.verify() {
            error!("shared memory corrupted: {err}");
            panic!("shared memory corrupted: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        freelist::Branch,
        memory::{HostMemory, StaticRegion},
    };

    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const H: usize = CHUNK_HEADER_SIZE;

    /// Builds an arena over a word-aligned vector. The vector must outlive
    /// the arena, so it is handed back alongside it.
    fn arena(len: usize) -> (Vec<usize>, Arena) {
        let mut memory = vec![0usize; len / WORD_SIZE];
        let base = NonNull::new(memory.as_mut_ptr()).unwrap().cast::<u8>();
        let arena = unsafe { Arena::init(base, len) };

        (memory, arena)
    }

    fn offset(arena: &Arena, buffer: NonNull<u8>) -> usize {
        buffer.as_ptr() as usize - arena.base().as_ptr() as usize
    }

    /// `(offset, size)` of every free chunk, in list order.
    fn free_layout(arena: &Arena) -> Vec<(usize, usize)> {
        let base = arena.base().as_ptr() as usize;

        arena
            .free
            .chunks
            .nodes()
            .map(|node| (chunk::start(node) - base, unsafe { node.as_ref().data.size }))
            .collect()
    }

    fn release(arena: &mut Arena, buffer: NonNull<u8>) {
        unsafe { arena.release(buffer.as_ptr()) };
        arena.verify().unwrap();
    }

    #[test]
    fn init_seeds_one_free_chunk() {
        let (_memory, arena) = arena(1024);

        assert_eq!(free_layout(&arena), vec![(0, 1024)]);
        assert_eq!(arena.capacity(), 1024 - H);
        assert_eq!(arena.stats().free, 1024);
        assert_eq!(arena.stats().allocated, 0);
        arena.verify().unwrap();
    }

    #[test]
    #[should_panic(expected = "cannot hold a chunk header")]
    fn init_rejects_tiny_arena() {
        let _ = arena(H);
    }

    #[test]
    fn carve_aligns_the_usable_region() {
        let buffer: &'static mut [u8] =
            Box::leak(vec![0u8; 512 + 2 * WORD_SIZE].into_boxed_slice());
        let start = buffer.as_ptr() as usize;

        let arena = Arena::carve(StaticRegion::new(&mut buffer[3..]));
        let base = arena.base().as_ptr() as usize;

        assert_eq!(base % WORD_SIZE, 0);
        assert!(base >= start + 3);
        assert!(base + arena.size() <= start + 512 + 2 * WORD_SIZE);
        assert_eq!(arena.size() % WORD_SIZE, 0);
        arena.verify().unwrap();
    }

    #[test]
    fn carved_arenas_never_share_bytes() {
        let mut first = Arena::carve(HostMemory::new(4096).unwrap());
        let mut second = Arena::carve(HostMemory::new(4096).unwrap());

        let x = first.acquire(16).unwrap();
        let y = second.acquire(16).unwrap();
        assert_ne!(x, y);

        unsafe {
            x.as_ptr().write_bytes(1, 16);
            y.as_ptr().write_bytes(2, 16);
            assert_eq!(*x.as_ptr(), 1);
            assert_eq!(*y.as_ptr(), 2);
        }

        // The region moved into the arena, so it stays mapped as long as
        // the arena does.
        release(&mut first, x);
        release(&mut second, y);
    }

    #[test]
    fn invalid_sizes_touch_nothing() {
        let (_memory, mut arena) = arena(512);
        let limit = arena.limit();

        assert_eq!(
            arena.acquire(0),
            Err(Error::InvalidSize { requested: 0, limit })
        );
        assert_eq!(
            arena.acquire(limit + 1),
            Err(Error::InvalidSize { requested: limit + 1, limit })
        );
        assert_eq!(
            arena.acquire(usize::MAX),
            Err(Error::InvalidSize { requested: usize::MAX, limit })
        );
        assert_eq!(free_layout(&arena), vec![(0, 512)]);
    }

    #[test]
    fn busy_when_no_chunk_is_large_enough() {
        let (_memory, mut arena) = arena(512);

        let whole = arena.acquire(arena.limit()).unwrap();
        assert_eq!(offset(&arena, whole), H);
        assert_eq!(arena.capacity(), 0);
        assert_eq!(arena.acquire(1), Err(Error::Busy { requested: 1 }));

        release(&mut arena, whole);
        assert_eq!(free_layout(&arena), vec![(0, 512)]);
    }

    #[test]
    fn fragmentation_is_busy_not_invalid() {
        let (_memory, mut arena) = arena(8 * H);

        let a = arena.acquire(H).unwrap();
        let b = arena.acquire(H).unwrap();
        let c = arena.acquire(H).unwrap();
        let d = arena.acquire(arena.capacity()).unwrap();

        release(&mut arena, a);
        release(&mut arena, c);

        let stats = arena.stats();
        assert_eq!(stats.free, 4 * H);
        assert_eq!(stats.largest_free, 2 * H);
        assert_eq!(stats.fragmented(), 2 * H);
        assert_eq!(arena.acquire(2 * H), Err(Error::Busy { requested: 2 * H }));

        release(&mut arena, b);
        assert_eq!(free_layout(&arena), vec![(0, 6 * H)]);
        assert!(arena.acquire(2 * H).is_ok());

        release(&mut arena, d);
    }

    #[test]
    fn best_fit_picks_least_headroom() {
        let (_memory, mut arena) = arena(64 * H);

        let a = arena.acquire(80).unwrap();
        let _s1 = arena.acquire(WORD_SIZE).unwrap();
        let b = arena.acquire(24).unwrap();
        let _s2 = arena.acquire(WORD_SIZE).unwrap();
        let c = arena.acquire(48).unwrap();
        let _s3 = arena.acquire(arena.capacity()).unwrap();

        release(&mut arena, a);
        release(&mut arena, b);
        release(&mut arena, c);

        let sizes: Vec<usize> = free_layout(&arena).iter().map(|&(_, size)| size).collect();
        assert_eq!(sizes, vec![H + 80, H + 24, H + 48]);

        // Needs H + 32: headroom 48 in the first chunk, 16 in the last.
        assert_eq!(arena.acquire(32).unwrap(), c);
        // Needs H + 24: exact fit in the middle chunk.
        assert_eq!(arena.acquire(24).unwrap(), b);
        arena.verify().unwrap();
    }

    #[test]
    fn headroom_of_one_header_is_not_split() {
        let len = 16 * H;
        let (_memory, mut arena) = arena(len);

        let buffer = arena.acquire(len - 2 * H).unwrap();

        assert!(free_layout(&arena).is_empty());
        assert_eq!(arena.stats().allocated, len);
        assert_ne!(arena.free.branches & (1 << Branch::NoSplit as u8), 0);
        assert_eq!(arena.free.branches & (1 << Branch::Split as u8), 0);

        release(&mut arena, buffer);
        assert_eq!(free_layout(&arena), vec![(0, len)]);
    }

    #[test]
    fn headroom_above_one_header_is_split() {
        let len = 16 * H;
        let (_memory, mut arena) = arena(len);

        let _buffer = arena.acquire(len - 2 * H - WORD_SIZE).unwrap();

        assert_eq!(free_layout(&arena), vec![(len - H - WORD_SIZE, H + WORD_SIZE)]);
        assert_eq!(arena.stats().allocated, len - H - WORD_SIZE);
        assert_ne!(arena.free.branches & (1 << Branch::Split as u8), 0);
    }

    #[test]
    fn requests_are_word_aligned() {
        let (_memory, mut arena) = arena(1024);

        let first = arena.acquire(1).unwrap();
        let second = arena.acquire(1).unwrap();

        assert_eq!(first.as_ptr() as usize % WORD_SIZE, 0);
        assert_eq!(offset(&arena, second) - offset(&arena, first), WORD_SIZE + H);
    }

    #[test]
    fn acquire_then_release_restores_free_list() {
        let (_memory, mut arena) = arena(2048);
        let _held = arena.acquire(100).unwrap();
        let before = free_layout(&arena);

        for size in [1, 7, 64, 500, arena.capacity()] {
            let buffer = arena.acquire(size).unwrap();
            release(&mut arena, buffer);

            assert_eq!(free_layout(&arena), before, "size {size}");
        }
    }

    #[test]
    fn adjacent_releases_coalesce_in_either_order() {
        for lower_first in [true, false] {
            let (_memory, mut arena) = arena(1024);

            let low = arena.acquire(40).unwrap();
            let high = arena.acquire(40).unwrap();
            let _rest = arena.acquire(arena.capacity()).unwrap();

            let (first, second) = if lower_first { (low, high) } else { (high, low) };
            release(&mut arena, first);
            release(&mut arena, second);

            let span = 2 * (align(40, WORD_SIZE).unwrap() + H);
            assert_eq!(free_layout(&arena), vec![(0, span)]);
        }
    }

    #[test]
    fn release_closes_gap_on_both_sides() {
        let (_memory, mut arena) = arena(1024);

        let a = arena.acquire(32).unwrap();
        let b = arena.acquire(32).unwrap();
        let c = arena.acquire(32).unwrap();
        let _d = arena.acquire(32).unwrap();

        release(&mut arena, a);
        release(&mut arena, c);
        assert_eq!(free_layout(&arena).len(), 3);

        release(&mut arena, b);

        assert_eq!(free_layout(&arena)[0], (0, 3 * (32 + H)));
        assert_ne!(arena.free.branches & (1 << Branch::MergeBoth as u8), 0);
    }

    #[test]
    fn release_null_is_a_no_op() {
        let (_memory, mut arena) = arena(256);

        unsafe { arena.release(std::ptr::null_mut()) };

        assert_eq!(free_layout(&arena), vec![(0, 256)]);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "is not an allocated chunk")]
    fn double_release_is_fatal_in_debug() {
        let (_memory, mut arena) = arena(256);
        let buffer = arena.acquire(16).unwrap();

        unsafe {
            arena.release(buffer.as_ptr());
            arena.release(buffer.as_ptr());
        }
    }

    #[test]
    fn stats_track_largest_allocation() {
        let (_memory, mut arena) = arena(1024);

        let small = arena.acquire(8).unwrap();
        let large = arena.acquire(200).unwrap();
        release(&mut arena, large);
        release(&mut arena, small);

        let stats = arena.stats();
        assert_eq!(stats.max_allocated, 200 + H);
        assert_eq!(stats.allocated, 0);
        assert_eq!(stats.allocated_chunks, 0);
        assert_eq!(stats.free_chunks, 1);
        assert_eq!(stats.allocated + stats.free, stats.total);
    }

    #[test]
    fn verify_detects_unmerged_free_chunks() {
        let (_memory, mut arena) = arena(1024);

        let a = arena.acquire(32).unwrap();
        let b = arena.acquire(32).unwrap();
        let _rest = arena.acquire(arena.capacity()).unwrap();
        release(&mut arena, a);

        // Hand `b` back without coalescing it into `a`.
        unsafe {
            let node = chunk::from_payload(b);
            arena.allocated.remove(node);
            arena.free.chunks.insert_after(arena.free.chunks.first(), node);
        }

        assert!(matches!(
            arena.verify(),
            Err(InvariantError::Unmerged { .. })
        ));
    }

    /// Fills `buffer` with a pattern unique to `slot`.
    fn fill(buffer: NonNull<u8>, len: usize, slot: usize) {
        let bytes = unsafe { std::slice::from_raw_parts_mut(buffer.as_ptr(), len) };

        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (slot * 31 + i) as u8;
        }
    }

    fn check(buffer: NonNull<u8>, len: usize, slot: usize) {
        let bytes = unsafe { std::slice::from_raw_parts(buffer.as_ptr(), len) };

        for (i, &byte) in bytes.iter().enumerate() {
            assert_eq!(byte, (slot * 31 + i) as u8, "slot {slot} corrupted at byte {i}");
        }
    }

    #[test]
    fn random_slots_reach_every_branch() {
        const SLOTS: usize = 10;
        const LEN: usize = 4096;
        const ALL_BRANCHES: u8 = 0xff;

        let (_memory, mut arena) = arena(LEN);
        // Bootstrap seeds the free list through the empty-list insert. Only
        // count what the random operations reach.
        arena.free.branches = 0;
        let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
        let mut slots: [Option<(NonNull<u8>, usize)>; SLOTS] = [None; SLOTS];

        for _ in 0..1_000_000 {
            if arena.free.branches == ALL_BRANCHES {
                break;
            }

            let slot = rng.random_range(0..SLOTS);

            match slots[slot].take() {
                Some((buffer, len)) => {
                    check(buffer, len, slot);
                    release(&mut arena, buffer);
                }
                None => {
                    let size = rng.random_range(1..=LEN);

                    match arena.acquire(size) {
                        Ok(buffer) => {
                            fill(buffer, size, slot);
                            slots[slot] = Some((buffer, size));
                        }
                        Err(Error::Busy { .. } | Error::InvalidSize { .. }) => {}
                        Err(err) => panic!("unexpected {err}"),
                    }
                }
            }

            arena.verify().unwrap();
        }

        assert_eq!(arena.free.branches, ALL_BRANCHES, "{:08b}", arena.free.branches);

        for (slot, held) in slots.iter().enumerate() {
            if let Some((buffer, len)) = *held {
                check(buffer, len, slot);
                release(&mut arena, buffer);
            }
        }

        assert_eq!(free_layout(&arena), vec![(0, LEN)]);
    }

    proptest! {
        #[test]
        fn chunks_always_partition_the_arena(
            ops in prop::collection::vec(
                (any::<bool>(), 1usize..700, any::<prop::sample::Index>()),
                1..200,
            ),
        ) {
            let (_memory, mut arena) = arena(4096);
            let mut held: Vec<NonNull<u8>> = Vec::new();

            for (acquire, size, index) in ops {
                if acquire || held.is_empty() {
                    if let Ok(buffer) = arena.acquire(size) {
                        held.push(buffer);
                    }
                } else {
                    let buffer = held.swap_remove(index.index(held.len()));
                    unsafe { arena.release(buffer.as_ptr()) };
                }

                prop_assert_eq!(arena.verify(), Ok(()));

                let stats = arena.stats();
                prop_assert_eq!(stats.allocated + stats.free, 4096);
                prop_assert_eq!(stats.allocated_chunks, held.len());
            }

            for buffer in held {
                unsafe { arena.release(buffer.as_ptr()) };
            }

            prop_assert_eq!(free_layout(&arena), vec![(0, 4096)]);
        }

        #[test]
        fn release_undoes_acquire(
            warmup in prop::collection::vec(1usize..300, 0..8),
            size in 1usize..1024,
        ) {
            let (_memory, mut arena) = arena(8192);

            for size in warmup {
                let _ = arena.acquire(size);
            }

            let before = free_layout(&arena);

            if let Ok(buffer) = arena.acquire(size) {
                unsafe { arena.release(buffer.as_ptr()) };
            }

            prop_assert_eq!(free_layout(&arena), before);
        }
    }
}
