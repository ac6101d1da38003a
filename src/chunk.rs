use std::{mem, ptr::NonNull};

use crate::list::Node;

/// A chunk header always travels wrapped in a [`Node`], so the overhead of a
/// chunk is the whole node: both links plus the size.
pub const CHUNK_HEADER_SIZE: usize = mem::size_of::<Node<Chunk>>();

/// Chunk header as it sits in the arena, links included.
pub(crate) type ChunkNode = Node<Chunk>;

/// This is the metadata of a chunk. Free and allocated chunks share the same
/// layout, the only difference is which list the node is linked into.
///
/// The following diagram represents a chunk inside the arena, including the
/// [`Node`] links that wrap it:
///
/// ```text
/// +---------------------+ <------+ chunk address
/// |        next         |        |
/// +---------------------+        |
/// |        prev         |        | -> Header (CHUNK_HEADER_SIZE)
/// +---------------------+        |
/// |        size         |        |
/// +---------------------+ <------+ buffer handed to the caller
/// |       Payload       |        |
/// |         ...         |        | -> size - CHUNK_HEADER_SIZE bytes
/// |         ...         |        |
/// +---------------------+ <------+ chunk address + size
/// ```
///
/// `size` counts the header too, so the chunk that follows in memory starts
/// exactly at `chunk address + size`. Coalescing relies on that.
pub(crate) struct Chunk {
    /// Total bytes the chunk occupies, header included.
    pub size: usize,
}

/// Address of the first byte of the chunk header.
#[inline]
pub(crate) fn start(node: NonNull<ChunkNode>) -> usize {
    node.as_ptr() as usize
}

/// Address one past the last byte of the chunk.
#[inline]
pub(crate) fn end(node: NonNull<ChunkNode>) -> usize {
    start(node) + unsafe { node.as_ref().data.size }
}

/// Buffer handed out to the caller for this chunk.
#[inline]
pub(crate) fn payload(node: NonNull<ChunkNode>) -> NonNull<u8> {
    unsafe { node.cast::<u8>().add(CHUNK_HEADER_SIZE) }
}

/// Recovers the chunk header from a buffer returned by [`payload`].
///
/// **SAFETY**: `buffer` must have been produced by [`payload`].
#[inline]
pub(crate) unsafe fn from_payload(buffer: NonNull<u8>) -> NonNull<ChunkNode> {
    unsafe { buffer.sub(CHUNK_HEADER_SIZE).cast() }
}
