use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

struct DiskState {
    file: File,
    /// Next id to hand out; ids in 1..next_page_id are allocated
    next_page_id: PageId,
    /// File length in pages. Allocated pages past this point have never been
    /// written and read back as zeroes.
    pages_on_disk: PageId,
}

/// DiskManager maps page ids onto a single page-aligned file.
///
/// Allocation is a counter bump, not a file write: a page materializes on
/// disk the first time it is flushed, and the file grows (sparsely, holes
/// reading as zeroes) to cover it. The allocation counter is recovered from
/// the file length on open, so ids never collide with pages already on disk.
pub struct DiskManager {
    state: Mutex<DiskState>,
}

impl DiskManager {
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        let pages_on_disk = (file.metadata()?.len() / PAGE_SIZE as u64) as PageId;
        // Page 1 always exists, even in a fresh file: it holds the index
        // header record
        let next_page_id = pages_on_disk.max(1) + 1;

        Ok(Self {
            state: Mutex::new(DiskState {
                file,
                next_page_id,
                pages_on_disk,
            }),
        })
    }

    /// Read an allocated page. Pages that were allocated but never flushed
    /// come back zeroed.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        let mut state = self.state.lock();
        if page_id == INVALID_PAGE_ID || page_id >= state.next_page_id {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        if page_id > state.pages_on_disk {
            page.data.fill(0);
        } else {
            state
                .file
                .seek(SeekFrom::Start((page_id as u64 - 1) * PAGE_SIZE as u64))?;
            state.file.read_exact(&mut page.data)?;
        }
        page.page_id = page_id;

        Ok(())
    }

    /// Flush a page, growing the file if this page has never been written
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        let mut state = self.state.lock();
        if page.page_id == INVALID_PAGE_ID || page.page_id >= state.next_page_id {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        state
            .file
            .seek(SeekFrom::Start((page.page_id as u64 - 1) * PAGE_SIZE as u64))?;
        state.file.write_all(&page.data)?;
        state.file.flush()?;

        // Any hole this write opened reads back as zeroes
        if page.page_id > state.pages_on_disk {
            state.pages_on_disk = page.page_id;
        }

        Ok(())
    }

    /// Hand out the next page id. Nothing touches the file until the page is
    /// first written.
    pub fn allocate_page(&self) -> Result<PageId, DiskManagerError> {
        let mut state = self.state.lock();
        let page_id = state.next_page_id;
        state.next_page_id += 1;
        Ok(page_id)
    }
}
