use std::ptr::NonNull;

use log::trace;

use crate::{
    chunk::{self, CHUNK_HEADER_SIZE, Chunk, ChunkNode},
    list::{Link, List},
};

/// Every decision point of the allocation and release paths. The test suite
/// records which ones ran so the fuzzer can tell when it has seen them all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Branch {
    /// Released chunk became the whole free list.
    EmptyInsert,
    /// Released chunk linked in front of a non-touching head.
    HeadInsert,
    /// Released chunk folded into its lower neighbor only.
    MergeDown,
    /// Upper neighbor folded into the released chunk only.
    MergeUp,
    /// Released chunk closed the gap between two free chunks.
    MergeBoth,
    /// Released chunk linked after some free chunk without touching either
    /// neighbor.
    NoMerge,
    /// Chosen chunk was carved in two.
    Split,
    /// Chosen chunk was handed out whole.
    NoSplit,
}

/// Address-ordered list of free chunks.
///
/// The free list links the chunk headers themselves, so a free chunk costs
/// nothing beyond its header. Chunks are kept sorted by address and two
/// chunks in the list never touch: whenever a release would leave two free
/// chunks back to back they are merged into one.
///
/// ```text
///   Arena
///
///   +------+-------+------+-------+-------+------+
///   | Free | Alloc | Free | Alloc | Alloc | Free |
///   +------+-------+------+-------+-------+------+
///      |              ^ |                    ^
///      +--------------+ +--------------------+
///                  Free list
/// ```
pub(crate) struct FreeList {
    /// Free chunks sorted by address.
    pub chunks: List<Chunk>,
    /// Bit `n` is set once the branch with discriminant `n` has run.
    #[cfg(test)]
    pub branches: u8,
}

impl FreeList {
    /// Creates a new empty list.
    pub const fn new() -> Self {
        Self {
            chunks: List::new(),
            #[cfg(test)]
            branches: 0,
        }
    }

    /// It tells whether there is any free chunk at all.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[inline]
    fn record(&mut self, branch: Branch) {
        #[cfg(test)]
        {
            self.branches |= 1 << branch as u8;
        }

        trace!("free list branch: {branch:?}");
    }

    /// Size of the largest free chunk, header included.
    pub fn largest(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.size).max().unwrap_or(0)
    }

    /// Sum of every free chunk, headers included.
    pub fn total(&self) -> usize {
        self.chunks.iter().map(|chunk| chunk.size).sum()
    }

    /// Returns the free chunk that fits `required` bytes with the least
    /// headroom, along with that headroom.
    ///
    /// The whole list is scanned. Ties keep the first candidate seen, which
    /// is the one with the lowest address.
    pub fn best_fit(&self, required: usize) -> Option<(NonNull<ChunkNode>, usize)> {
        let mut best: Option<(NonNull<ChunkNode>, usize)> = None;

        for node in self.chunks.nodes() {
            let size = unsafe { node.as_ref().data.size };

            if size < required {
                continue;
            }

            let headroom = size - required;

            if best.is_none_or(|(_, smallest)| headroom < smallest) {
                best = Some((node, headroom));
            }
        }

        best
    }

    /// Takes `required` bytes out of `node`, which must come from
    /// [`FreeList::best_fit`] with the same `required`.
    ///
    /// If what is left over could not hold more than a header, the whole
    /// chunk leaves the free list and the slack goes with it. Otherwise the
    /// tail becomes a new free chunk in the exact list position `node` had.
    ///
    /// The returned node is unlinked and sized for its new owner.
    ///
    /// **SAFETY**: `node` must be linked in this list and be at least
    /// `required` bytes long.
    pub unsafe fn take(
        &mut self,
        mut node: NonNull<ChunkNode>,
        required: usize,
    ) -> NonNull<ChunkNode> {
        let headroom = unsafe { node.as_ref().data.size } - required;

        if headroom <= CHUNK_HEADER_SIZE {
            trace!(
                "handing out whole chunk at {:#x} ({} bytes of slack)",
                chunk::start(node),
                headroom
            );

            unsafe { self.chunks.remove(node) };
            self.record(Branch::NoSplit);

            return node;
        }

        let rest = unsafe {
            let rest = List::write(Chunk { size: headroom }, node.cast::<u8>().add(required));

            node.as_mut().data.size = required;
            self.chunks.replace(node, rest);

            node.as_mut().next = None;
            node.as_mut().prev = None;

            rest
        };

        trace!(
            "split chunk at {:#x}: {} bytes taken, {} bytes left at {:#x}",
            chunk::start(node),
            required,
            headroom,
            chunk::start(rest)
        );

        self.record(Branch::Split);

        node
    }

    /// Gives `node` back to the free list, merging it with whichever address
    /// neighbors it touches.
    ///
    /// **SAFETY**: `node` must be a valid, unlinked chunk that overlaps no
    /// chunk of this list.
    pub unsafe fn insert(&mut self, mut node: NonNull<ChunkNode>) {
        if self.is_empty() {
            unsafe { self.chunks.push_front(node) };
            self.record(Branch::EmptyInsert);

            return;
        }

        // Find the first free chunk above `node`. Everything before it is
        // below, so the last one we skip is the lower neighbor.
        let mut lower: Link<ChunkNode> = None;
        let mut upper = self.chunks.first();

        while let Some(current) = upper {
            if chunk::start(current) > chunk::start(node) {
                break;
            }

            lower = Some(current);
            upper = unsafe { current.as_ref().next };
        }

        let touches_down = lower.is_some_and(|lower| chunk::end(lower) == chunk::start(node));
        let touches_up = upper.is_some_and(|upper| chunk::end(node) == chunk::start(upper));

        unsafe {
            match (lower, upper) {
                (Some(mut lower), Some(upper)) if touches_down && touches_up => {
                    trace!(
                        "chunk at {:#x} closes the gap between {:#x} and {:#x}",
                        chunk::start(node),
                        chunk::start(lower),
                        chunk::start(upper)
                    );

                    lower.as_mut().data.size += node.as_ref().data.size + upper.as_ref().data.size;
                    self.chunks.remove(upper);
                    self.record(Branch::MergeBoth);
                }
                (Some(mut lower), _) if touches_down => {
                    trace!(
                        "chunk at {:#x} merged into {:#x}",
                        chunk::start(node),
                        chunk::start(lower)
                    );

                    lower.as_mut().data.size += node.as_ref().data.size;
                    self.record(Branch::MergeDown);
                }
                (_, Some(upper)) if touches_up => {
                    trace!(
                        "chunk at {:#x} absorbs {:#x}",
                        chunk::start(node),
                        chunk::start(upper)
                    );

                    node.as_mut().data.size += upper.as_ref().data.size;
                    self.chunks.replace(upper, node);
                    self.record(Branch::MergeUp);
                }
                (None, _) => {
                    self.chunks.push_front(node);
                    self.record(Branch::HeadInsert);
                }
                (lower, _) => {
                    self.chunks.insert_after(lower, node);
                    self.record(Branch::NoMerge);
                }
            }
        }
    }
}
