//! Snapshot of the arena for the shmem console command and telemetry.

use std::fmt;

/// Byte counts include chunk headers, so `allocated + free == total` holds
/// for every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Arena length.
    pub total: usize,
    /// Bytes held by allocated chunks.
    pub allocated: usize,
    /// Bytes held by free chunks.
    pub free: usize,
    /// Size of the largest free chunk.
    pub largest_free: usize,
    /// Largest chunk ever handed out since bootstrap.
    pub max_allocated: usize,
    pub free_chunks: usize,
    pub allocated_chunks: usize,
}

impl Stats {
    /// Free bytes that are unusable for a request as large as the largest
    /// free chunk because they sit in smaller chunks.
    pub fn fragmented(&self) -> usize {
        self.free - self.largest_free
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total:         {:6}", self.total)?;
        writeln!(f, "Allocated:     {:6}", self.allocated)?;
        writeln!(f, "Free:          {:6}", self.free)?;
        writeln!(f, "Max free buf:  {:6}", self.largest_free)?;
        write!(f, "Max allocated: {:6}", self.max_allocated)
    }
}
