use crate::pages::{PAGE_INVALID, PAGE_SIZE, Page, PageId};

use zerocopy::little_endian::{U32, U64};
use zerocopy_derive::*;

const HEADER_FIXED_SIZE: usize = 24;
/// Block page ids that fit after the fixed header fields.
pub const HEADER_BLOCK_IDS: usize =
    (PAGE_SIZE - HEADER_FIXED_SIZE) / std::mem::size_of::<PageId>();

/// Directory page of a linear probing hash table.
///
/// Holds the table size in logical slots and the append-only list of block
/// page ids. `next_ind` is the write cursor into that list: ids below it are
/// valid, ids at or above it are stale leftovers from before a reshard.
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct HashHeaderPage {
    page_id: PageId,
    lsn: U32,
    size: U64,
    next_ind: U64,
    block_page_ids: [PageId; HEADER_BLOCK_IDS],
}

const _: () = assert!(std::mem::size_of::<HashHeaderPage>() == PAGE_SIZE);

impl HashHeaderPage {
    pub fn init(&mut self, page_id: PageId) {
        self.page_id = page_id;
        self.lsn = U32::new(0);
        self.size = U64::new(0);
        self.next_ind = U64::new(0);
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn set_page_id(&mut self, page_id: PageId) {
        self.page_id = page_id;
    }

    pub fn lsn(&self) -> u32 {
        self.lsn.get()
    }

    pub fn set_lsn(&mut self, lsn: u32) {
        self.lsn.set(lsn);
    }

    /// Table size in logical slots.
    pub fn size(&self) -> usize {
        self.size.get() as usize
    }

    pub fn set_size(&mut self, size: usize) {
        self.size.set(size as u64);
    }

    pub fn num_blocks(&self) -> usize {
        self.next_ind.get() as usize
    }

    /// Returns the block page id at `index`, or the invalid sentinel when
    /// `index` is past the write cursor.
    pub fn block_page_id(&self, index: usize) -> PageId {
        if index < self.num_blocks() {
            self.block_page_ids[index]
        } else {
            PAGE_INVALID
        }
    }

    pub fn add_block_page_id(&mut self, page_id: PageId) {
        let next_ind = self.num_blocks();
        debug_assert!(next_ind < HEADER_BLOCK_IDS, "header block list is full");
        self.block_page_ids[next_ind] = page_id;
        self.next_ind.set(next_ind as u64 + 1);
    }

    /// Rewinds the write cursor. The old ids stay in place until overwritten.
    pub fn reset_block_index(&mut self) {
        self.next_ind.set(0);
    }
}

impl<'a> From<&'a Page> for &'a HashHeaderPage {
    fn from(page: &'a Page) -> &'a HashHeaderPage {
        unsafe { &*(page.data.as_ptr() as *const HashHeaderPage) }
    }
}

impl<'a> From<&'a mut Page> for &'a mut HashHeaderPage {
    fn from(page: &mut Page) -> &mut HashHeaderPage {
        unsafe { &mut *(page.data.as_mut_ptr() as *mut HashHeaderPage) }
    }
}
