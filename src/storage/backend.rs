use crate::pages::{PAGE_SIZE, Page, PageId};

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("io error")]
    Io(#[from] std::io::Error),
}

/// The block device the buffer pool sits on: a page-addressed store with
/// fixed-size pages.
pub trait DiskManager: Sync + Send {
    /// Extends the store by one zeroed page and returns its id.
    fn allocate_page(&self) -> PageId;
    /// Gives a page back to the store.
    fn deallocate_page(&self, page_id: PageId);
    fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), StorageError>;
    fn write_page(&self, page: &Page, page_id: PageId) -> Result<(), StorageError>;
    fn fsync(&self);
}

/// Manages the on-disk storage of pages.
///
/// The `FileStorage` struct is responsible for reading from and writing to
/// the database file. Page `n` lives at byte offset `n * PAGE_SIZE`.
pub struct FileStorage {
    file: File,
}

impl FileStorage {
    /// Creates a new storage file, truncating any previous content.
    ///
    /// Returns a `Result` containing the `FileStorage` instance if successful, or a `StorageError` on failure.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(StorageError::Io)?;

        Ok(Self { file })
    }

    /// Opens an existing storage file.
    ///
    /// Returns a `Result` containing the `FileStorage` instance if successful, or a `StorageError` on failure.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(false)
            .truncate(false)
            .open(path)
            .map_err(StorageError::Io)?;

        Ok(Self { file })
    }
}

impl DiskManager for FileStorage {
    /// Appends a zeroed page to the database file and returns its id.
    fn allocate_page(&self) -> PageId {
        let offset = self.file.metadata().unwrap().len();
        self.file.write_all_at(&[0; PAGE_SIZE], offset).unwrap();
        PageId::new((offset / PAGE_SIZE as u64) as u32)
    }

    fn deallocate_page(&self, _page_id: PageId) {
        // TODO: track deallocated pages in a free-page map so allocate_page
        // can hand them out again instead of growing the file
    }

    /// Reads a page from the database file.
    ///
    /// Returns an empty `Result` if successful, or a `StorageError` on failure.
    fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), StorageError> {
        let offset = page_id.get() as u64 * PAGE_SIZE as u64;

        self.file
            .read_exact_at(page.data.as_mut_slice(), offset)
            .map_err(StorageError::Io)?;

        Ok(())
    }

    /// Writes a page to the database file.
    ///
    /// Returns an empty `Result` if successful, or a `StorageError` on failure.
    fn write_page(&self, page: &Page, page_id: PageId) -> Result<(), StorageError> {
        let offset = page_id.get() as u64 * PAGE_SIZE as u64;

        self.file
            .write_all_at(page.data.as_slice(), offset)
            .map_err(StorageError::Io)?;

        Ok(())
    }

    /// Attempts to sync file data and metadata to the disk.
    ///
    /// # Panics
    ///
    /// Panics if the underlying `File::sync_all` operation fails.
    fn fsync(&self) {
        let result = self.file.sync_all();
        if result.is_err() {
            // if fsync fails, we can't make sure data is flushed to disk
            // ref: https://wiki.postgresql.org/wiki/Fsync_Errors
            panic!("flush (fsync) failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::NamedTempFile;

    #[test]
    fn allocate_pages_sequentially() {
        let path = NamedTempFile::new().unwrap();
        let storage = FileStorage::create(path.path()).unwrap();

        assert_eq!(storage.allocate_page(), PageId::new(0));
        assert_eq!(storage.allocate_page(), PageId::new(1));
        assert_eq!(storage.allocate_page(), PageId::new(2));
    }

    #[test]
    fn write_read_round_trip() {
        let path = NamedTempFile::new().unwrap();
        let storage = FileStorage::create(path.path()).unwrap();

        let page_id = storage.allocate_page();
        let mut page = Page::new();
        page.data[0..4].copy_from_slice(b"abcd");
        storage.write_page(&page, page_id).unwrap();
        storage.fsync();

        let reopened = FileStorage::open(path.path()).unwrap();
        let mut page = Page::new();
        reopened.read_page(page_id, &mut page).unwrap();
        assert_eq!(&page.data[0..4], b"abcd");
    }

    #[test]
    fn read_of_unallocated_page_fails() {
        let path = NamedTempFile::new().unwrap();
        let storage = FileStorage::create(path.path()).unwrap();

        let mut page = Page::new();
        assert!(storage.read_page(PageId::new(7), &mut page).is_err());
    }
}
