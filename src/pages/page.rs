use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use zerocopy::little_endian::U32;
use zerocopy_derive::*;

pub const PAGE_SIZE: usize = 4096;
/// Sentinel for a frame that currently holds no page.
pub const PAGE_INVALID: PageId = PageId(U32::new(u32::MAX));

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
pub struct PageId(U32);

impl PageId {
    pub fn new(page_id: u32) -> Self {
        Self(U32::new(page_id))
    }

    pub fn get(&self) -> u32 {
        self.0.get()
    }

    pub fn set(&mut self, page_id: u32) {
        self.0.set(page_id);
    }

    pub fn is_valid(&self) -> bool {
        *self != PAGE_INVALID
    }
}

/// the actual data read from/written to disk
pub struct Page {
    pub data: [u8; PAGE_SIZE],
}

impl Default for Page {
    fn default() -> Self {
        Self {
            data: [0; PAGE_SIZE],
        }
    }
}

impl Page {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.data.fill(0);
    }
}

/// Bookkeeping for one buffer pool frame.
///
/// The pin counter and dirty flag are atomic so page guards can release
/// their reservation without exclusive access to the metadata. The page id
/// is only rewritten while the frame is unpinned and the frame table is
/// locked.
pub struct FrameMetadata {
    pub page_id: PageId,
    dirty: AtomicBool,
    counter: AtomicUsize,
}

impl FrameMetadata {
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            dirty: AtomicBool::new(false),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn reset(&mut self) {
        self.page_id = PAGE_INVALID;
        self.dirty = AtomicBool::new(false);
        self.counter = AtomicUsize::new(0);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn get_pin_counter(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }

    /// Returns the previous pin count.
    pub fn pin(&self) -> usize {
        self.counter.fetch_add(1, Ordering::AcqRel)
    }

    /// Returns the previous pin count.
    pub fn unpin(&self) -> usize {
        let old = self.counter.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old > 0, "unpinned a frame with no pins");
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_unpin_balance() {
        let metadata = FrameMetadata::new(PageId::new(42));
        assert_eq!(metadata.get_pin_counter(), 0);
        metadata.pin();
        metadata.pin();
        assert_eq!(metadata.get_pin_counter(), 2);
        metadata.unpin();
        metadata.unpin();
        assert_eq!(metadata.get_pin_counter(), 0);
    }

    #[test]
    fn dirty_is_sticky_until_cleared() {
        let metadata = FrameMetadata::new(PageId::new(0));
        assert!(!metadata.is_dirty());
        metadata.set_dirty();
        metadata.set_dirty();
        assert!(metadata.is_dirty());
        metadata.clear_dirty();
        assert!(!metadata.is_dirty());
    }

    #[test]
    fn invalid_page_id() {
        assert!(!PAGE_INVALID.is_valid());
        assert!(PageId::new(0).is_valid());
    }
}
