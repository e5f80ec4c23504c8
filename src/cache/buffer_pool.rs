use crate::cache::{ClockReplacer, FrameId, Replacer};
use crate::config::CONFIG;
use crate::pages::{FrameMetadata, PAGE_INVALID, Page, PageId};
use crate::storage::{DiskManager, StorageError};
use crate::wal::LogManager;

use std::cell::UnsafeCell;
use std::collections::{HashMap, VecDeque};
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::debug;

// UnsafeCell<Page> has the same in-memory layout as Page.
// We could use RwLock<Page> but RwLock metadata would be stored
// next to Page data. This way we make sure pages are contiguous
// in-memory and no RwLock metadata is prepended or appended.
struct UnsafePage(UnsafeCell<Page>);
// SAFETY:
// Shared and exclusive access are handled with a separate RwLock stored
// in PageLatch plus the pin discipline: the pool only touches a frame's
// bytes directly while its pin count is zero, and a latch is only held by
// a guard, whose existence implies a non-zero pin count.
unsafe impl Sync for UnsafePage {}

impl Default for UnsafePage {
    fn default() -> Self {
        Self(UnsafeCell::new(Page::new()))
    }
}

struct UnsafeFrameMetadata(UnsafeCell<FrameMetadata>);
// SAFETY: see UnsafePage. Exclusive references are only created while the
// frame table is locked and the frame is unpinned; guards hold shared
// references and go through the atomic pin counter and dirty flag.
unsafe impl Sync for UnsafeFrameMetadata {}

impl Default for UnsafeFrameMetadata {
    fn default() -> Self {
        Self(UnsafeCell::new(FrameMetadata::new(PAGE_INVALID)))
    }
}

struct PageLatch {
    latch: RwLock<()>,
}

impl Default for PageLatch {
    fn default() -> Self {
        Self {
            latch: RwLock::new(()),
        }
    }
}

/// Page table, free list and replacer, guarded by one mutex so victim
/// selection and mapping updates are a single critical section.
struct FrameTable {
    map: HashMap<PageId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: Box<dyn Replacer>,
}

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("all frames are pinned")]
    OutOfFrames,
    #[error("storage")]
    Storage(#[from] StorageError),
}

/// A fixed-capacity cache of pages backed by a disk manager.
///
/// The `BufferPool` is responsible for:
/// - Fetching pages from the disk and pinning them into frames.
/// - Evicting unpinned pages when every frame is taken, free frames first.
/// - Writing dirty frames back to the disk before they are reused.
///
/// Fetching returns a [`PageRef`]/[`PageRefMut`] guard that holds the
/// frame's byte latch and a pin; dropping the guard unpins the frame and
/// makes it eligible for eviction again, so a fetch can never leak a pin.
pub struct BufferPool {
    frames: Box<[UnsafePage]>,
    frames_metadata: Box<[UnsafeFrameMetadata]>,
    frames_latch: Box<[PageLatch]>,
    frame_table: Mutex<FrameTable>,
    storage: Mutex<Box<dyn DiskManager>>,
    log_manager: Option<Arc<LogManager>>,
}

impl BufferPool {
    pub fn new(storage: Box<dyn DiskManager>, pool_size: usize) -> Self {
        assert!(pool_size > 0, "buffer pool needs at least one frame");
        let frames = std::iter::repeat_with(UnsafePage::default).take(pool_size);
        let frames_metadata = std::iter::repeat_with(UnsafeFrameMetadata::default).take(pool_size);
        let frames_latch = std::iter::repeat_with(PageLatch::default).take(pool_size);
        Self {
            frames: Box::from_iter(frames),
            frames_metadata: Box::from_iter(frames_metadata),
            frames_latch: Box::from_iter(frames_latch),
            frame_table: Mutex::new(FrameTable {
                map: HashMap::new(),
                free_list: VecDeque::from_iter(0..pool_size),
                replacer: Box::new(ClockReplacer::new(pool_size)),
            }),
            storage: Mutex::new(storage),
            log_manager: None,
        }
    }

    pub fn with_default_capacity(storage: Box<dyn DiskManager>) -> Self {
        Self::new(storage, CONFIG.BUFFER_POOL_SIZE)
    }

    pub fn with_log_manager(mut self, log_manager: Arc<LogManager>) -> Self {
        self.log_manager = Some(log_manager);
        self
    }

    /// The write point carried for recovery integration. The pool itself
    /// never interprets it.
    pub fn log_manager(&self) -> Option<&Arc<LogManager>> {
        self.log_manager.as_ref()
    }

    unsafe fn get_page_ref(&self, frame_id: FrameId) -> &Page {
        unsafe { &*(self.frames[frame_id].0.get()) }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn get_page_ref_mut(&self, frame_id: FrameId) -> &mut Page {
        unsafe { &mut *(self.frames[frame_id].0.get()) }
    }

    unsafe fn get_metadata_ref(&self, frame_id: FrameId) -> &FrameMetadata {
        unsafe { &*(self.frames_metadata[frame_id].0.get()) }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn get_metadata_ref_mut(&self, frame_id: FrameId) -> &mut FrameMetadata {
        unsafe { &mut *(self.frames_metadata[frame_id].0.get()) }
    }

    /// Retrieves a read-only reference to a page.
    ///
    /// If the page is not resident it is fetched from the disk, evicting
    /// another page if no frame is free.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PageRef<'_>, BufferPoolError> {
        let frame_id = self.pin_frame(page_id)?;

        // The latch is taken after the frame table lock is released: a
        // guard holder may block here, but never while holding the lock.
        let latch = self.frames_latch[frame_id].latch.read().unwrap();
        // SAFETY: the frame is pinned, so it cannot be evicted; the read
        // latch excludes writers.
        let page = unsafe { self.get_page_ref(frame_id) };
        let metadata = unsafe { self.get_metadata_ref(frame_id) };

        Ok(PageRef {
            pool: self,
            frame_id,
            latch: ManuallyDrop::new(latch),
            page,
            metadata,
        })
    }

    /// Retrieves a mutable reference to a page.
    ///
    /// Blocks until every other guard on the page is dropped.
    pub fn fetch_page_mut(&self, page_id: PageId) -> Result<PageRefMut<'_>, BufferPoolError> {
        let frame_id = self.pin_frame(page_id)?;

        let latch = self.frames_latch[frame_id].latch.write().unwrap();
        // SAFETY: pinned frame, write latch held.
        let page = unsafe { self.get_page_ref_mut(frame_id) };
        let metadata = unsafe { self.get_metadata_ref(frame_id) };

        Ok(PageRefMut {
            pool: self,
            frame_id,
            latch: ManuallyDrop::new(latch),
            page,
            metadata,
            dirty: false,
        })
    }

    /// Allocates a new page on disk and pins it into a zeroed frame.
    ///
    /// The new page is not dirty until the caller marks the guard so.
    pub fn new_page(&self) -> Result<PageRefMut<'_>, BufferPoolError> {
        let mut frame_table = self.frame_table.lock().unwrap();
        let frame_id = self.take_victim(&mut frame_table)?;

        let page_id = self.storage.lock().unwrap().allocate_page();
        // SAFETY: the frame came off the free list or was victimized with a
        // zero pin count, so no reference to it exists.
        let page = unsafe { self.get_page_ref_mut(frame_id) };
        page.reset();
        let metadata = unsafe { self.get_metadata_ref_mut(frame_id) };
        *metadata = FrameMetadata::new(page_id);
        metadata.pin();
        frame_table.map.insert(page_id, frame_id);
        drop(frame_table);

        let latch = self.frames_latch[frame_id].latch.write().unwrap();
        let page = unsafe { self.get_page_ref_mut(frame_id) };
        let metadata = unsafe { self.get_metadata_ref(frame_id) };

        Ok(PageRefMut {
            pool: self,
            frame_id,
            latch: ManuallyDrop::new(latch),
            page,
            metadata,
            dirty: false,
        })
    }

    /// Writes a page's bytes to disk and clears its dirty flag, whether or
    /// not it was dirty. Returns false when the page is not resident.
    pub fn flush_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        if self.pin_count(page_id).is_none() {
            return Ok(false);
        }

        // Pinning through a plain fetch keeps the frame from being evicted
        // out from under the write without holding the frame table lock
        // across the latch acquisition.
        let page_ref = self.fetch_page(page_id)?;
        self.storage
            .lock()
            .unwrap()
            .write_page(page_ref.page(), page_id)?;
        page_ref.metadata().clear_dirty();
        Ok(true)
    }

    /// Writes every resident page to disk, clearing dirty flags.
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let page_ids: Vec<PageId> = {
            let frame_table = self.frame_table.lock().unwrap();
            frame_table.map.keys().copied().collect()
        };

        for page_id in page_ids {
            // a page may have been evicted since the snapshot; that already
            // wrote it out
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Drops a page from the pool and deallocates it on disk.
    ///
    /// Returns false while the page is pinned; returns true when the page
    /// was deleted or was not resident to begin with.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut frame_table = self.frame_table.lock().unwrap();
        let Some(&frame_id) = frame_table.map.get(&page_id) else {
            return Ok(true);
        };

        // SAFETY: frame table locked; exclusive access is only taken once
        // the pin count is seen to be zero.
        if unsafe { self.get_metadata_ref(frame_id) }.get_pin_counter() > 0 {
            return Ok(false);
        }

        frame_table.map.remove(&page_id);
        frame_table.replacer.pin(frame_id);
        let metadata = unsafe { self.get_metadata_ref_mut(frame_id) };
        metadata.reset();
        frame_table.free_list.push_back(frame_id);
        self.storage.lock().unwrap().deallocate_page(page_id);
        debug!(page_id = page_id.get(), frame_id, "deleted page");
        Ok(true)
    }

    /// Pin count of a resident page, `None` otherwise.
    pub fn pin_count(&self, page_id: PageId) -> Option<usize> {
        let frame_table = self.frame_table.lock().unwrap();
        let &frame_id = frame_table.map.get(&page_id)?;
        // SAFETY: frame table locked, shared access only.
        Some(unsafe { self.get_metadata_ref(frame_id) }.get_pin_counter())
    }

    /// Dirty flag of a resident page, `None` otherwise.
    pub fn is_page_dirty(&self, page_id: PageId) -> Option<bool> {
        let frame_table = self.frame_table.lock().unwrap();
        let &frame_id = frame_table.map.get(&page_id)?;
        Some(unsafe { self.get_metadata_ref(frame_id) }.is_dirty())
    }

    /// Pins the frame holding `page_id`, reading the page in from disk if
    /// it is not resident.
    fn pin_frame(&self, page_id: PageId) -> Result<FrameId, BufferPoolError> {
        let mut frame_table = self.frame_table.lock().unwrap();

        if let Some(&frame_id) = frame_table.map.get(&page_id) {
            // SAFETY: frame table locked, shared access only.
            unsafe { self.get_metadata_ref(frame_id) }.pin();
            frame_table.replacer.pin(frame_id);
            return Ok(frame_id);
        }

        let frame_id = self.take_victim(&mut frame_table)?;
        {
            let storage = self.storage.lock().unwrap();
            // SAFETY: unpinned, unmapped frame; no reference to it exists.
            let page = unsafe { self.get_page_ref_mut(frame_id) };
            page.reset();
            if let Err(e) = storage.read_page(page_id, page) {
                unsafe { self.get_metadata_ref_mut(frame_id) }.reset();
                frame_table.free_list.push_front(frame_id);
                return Err(e.into());
            }
        }
        let metadata = unsafe { self.get_metadata_ref_mut(frame_id) };
        *metadata = FrameMetadata::new(page_id);
        metadata.pin();
        frame_table.map.insert(page_id, frame_id);
        Ok(frame_id)
    }

    /// Takes a reusable frame, preferring the free list over eviction: a
    /// free frame is already clean and unmapped. A dirty victim is written
    /// back before its mapping is dropped.
    fn take_victim(&self, frame_table: &mut FrameTable) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = frame_table.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = frame_table
            .replacer
            .victim()
            .ok_or(BufferPoolError::OutOfFrames)?;
        // SAFETY: candidates have a zero pin count, so no guard references
        // this frame and its bytes and metadata are ours to touch.
        let metadata = unsafe { self.get_metadata_ref(frame_id) };
        debug_assert_eq!(metadata.get_pin_counter(), 0, "victimized a pinned frame");

        if metadata.is_dirty() {
            debug!(
                page_id = metadata.page_id.get(),
                frame_id, "writing back dirty victim"
            );
            let page = unsafe { self.get_page_ref(frame_id) };
            if let Err(e) = self.storage.lock().unwrap().write_page(page, metadata.page_id) {
                frame_table.replacer.unpin(frame_id);
                return Err(e.into());
            }
            metadata.clear_dirty();
        }
        frame_table.map.remove(&metadata.page_id);
        Ok(frame_id)
    }

    /// Releases one pin. Called from guard drops, after the byte latch has
    /// been released.
    fn unpin(&self, frame_id: FrameId, is_dirty: bool) {
        let mut frame_table = self.frame_table.lock().unwrap();
        // SAFETY: frame table locked, shared access only.
        let metadata = unsafe { self.get_metadata_ref(frame_id) };
        if is_dirty {
            metadata.set_dirty();
        }
        metadata.unpin();
        if metadata.get_pin_counter() == 0 {
            frame_table.replacer.unpin(frame_id);
        }
    }
}

/// Shared, pinned reference to a resident page.
pub struct PageRef<'page> {
    pool: &'page BufferPool,
    frame_id: FrameId,
    latch: ManuallyDrop<RwLockReadGuard<'page, ()>>,
    page: &'page Page,
    metadata: &'page FrameMetadata,
}

impl PageRef<'_> {
    pub fn page(&self) -> &Page {
        self.page
    }

    pub fn page_id(&self) -> PageId {
        self.metadata.page_id
    }

    pub fn metadata(&self) -> &FrameMetadata {
        self.metadata
    }
}

impl Deref for PageRef<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        self.page
    }
}

impl Drop for PageRef<'_> {
    fn drop(&mut self) {
        // Release the latch before the unpin: once the pin count hits zero
        // the frame may be victimized, and eviction assumes no latch holder
        // remains.
        // SAFETY: the latch guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.latch) };
        self.pool.unpin(self.frame_id, false);
    }
}

/// Exclusive, pinned reference to a resident page.
///
/// Dirtiness is recorded on the guard with [`PageRefMut::set_dirty`] and
/// folded into the frame when the guard is dropped; it stays set until the
/// page is flushed.
pub struct PageRefMut<'page> {
    pool: &'page BufferPool,
    frame_id: FrameId,
    latch: ManuallyDrop<RwLockWriteGuard<'page, ()>>,
    page: &'page mut Page,
    metadata: &'page FrameMetadata,
    dirty: bool,
}

impl PageRefMut<'_> {
    pub fn page(&self) -> &Page {
        self.page
    }

    pub fn page_mut(&mut self) -> &mut Page {
        self.page
    }

    pub fn page_id(&self) -> PageId {
        self.metadata.page_id
    }

    pub fn metadata(&self) -> &FrameMetadata {
        self.metadata
    }

    pub fn set_dirty(&mut self) {
        self.dirty = true;
    }
}

impl Deref for PageRefMut<'_> {
    type Target = Page;

    fn deref(&self) -> &Self::Target {
        self.page
    }
}

impl DerefMut for PageRefMut<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.page
    }
}

impl Drop for PageRefMut<'_> {
    fn drop(&mut self) {
        // SAFETY: see PageRef::drop.
        unsafe { ManuallyDrop::drop(&mut self.latch) };
        self.pool.unpin(self.frame_id, self.dirty);
    }
}
