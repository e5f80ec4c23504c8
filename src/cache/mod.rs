mod buffer_pool;
mod clock;

pub const DEFAULT_BUFFER_POOL_SIZE: usize = 1024;

pub type FrameId = usize;

/// Eviction policy over unpinned frames.
///
/// The buffer pool calls these while holding its frame table lock, so the
/// candidate set and the page table always change together.
pub trait Replacer: Send {
    /// Removes and returns the next candidate in policy order.
    fn victim(&mut self) -> Option<FrameId>;
    /// Drops `frame_id` from the candidate set. Idempotent.
    fn pin(&mut self, frame_id: FrameId);
    /// Adds `frame_id` to the candidate set. Idempotent.
    fn unpin(&mut self, frame_id: FrameId);
    /// Number of candidates.
    fn size(&self) -> usize;
}

pub use buffer_pool::{BufferPool, BufferPoolError, PageRef, PageRefMut};
pub use clock::ClockReplacer;
