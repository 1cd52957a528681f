use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use log::debug;
use parking_lot::RwLock;

use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

/// Default number of access samples kept per frame by the replacer
const DEFAULT_LRU_K: usize = 2;

/// Buffer pool manager: a fixed set of frames caching disk pages.
///
/// Frames are pinned while a caller holds a fetched page and become eviction
/// candidates only when their pin count drops to zero. Victim selection is
/// delegated to the LRU-K replacer.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FramePtr>,
    page_table: RwLock<HashMap<PageId, FrameId>>,
    free_list: RwLock<VecDeque<FrameId>>,
    replacer: LruKReplacer,
    disk_manager: Arc<DiskManager>,
}

impl BufferPoolManager {
    pub fn new(pool_size: usize, db_path: impl AsRef<Path>) -> Result<Self, BufferPoolError> {
        Self::with_k(pool_size, DEFAULT_LRU_K, db_path)
    }

    pub fn with_k(
        pool_size: usize,
        k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(db_path)?);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for i in 0..pool_size {
            let frame_id = i as FrameId;
            let frame = Frame::new(frame_id, Arc::new(RwLock::new(Page::new(INVALID_PAGE_ID))));
            frames.push(Arc::new(RwLock::new(frame)));
            free_list.push_back(frame_id);
        }

        Ok(Self {
            pool_size,
            frames,
            page_table: RwLock::new(HashMap::new()),
            free_list: RwLock::new(free_list),
            replacer: LruKReplacer::new(pool_size, k),
            disk_manager,
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Fetch a page from the buffer pool or disk. The page comes back pinned;
    /// every fetch must be paired with exactly one unpin.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "Cannot fetch invalid page ID".to_string(),
            ));
        }

        // Serialize page-table lookups against frame allocation so two
        // fetches of the same absent page cannot both load it
        let mut page_table = self.page_table.write();

        if let Some(&frame_id) = page_table.get(&page_id) {
            let frame = &self.frames[frame_id as usize];
            let mut frame_guard = frame.write();
            frame_guard.pin_count += 1;

            // Replacer updates stay under the frame lock so a concurrent
            // unpin cannot mark a pinned frame evictable
            self.replacer.record_access(frame_id);
            self.replacer.set_evictable(frame_id, false);

            return Ok(frame_guard.page.clone());
        }

        // Page not resident: allocate a frame and read from disk
        let frame_id = self.allocate_frame(&mut page_table)?;

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        {
            let mut page_guard = frame_guard.page.write();
            self.disk_manager.read_page(page_id, &mut page_guard)?;
        }

        frame_guard.pin_count = 1;
        frame_guard.is_dirty = false;

        page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok(frame_guard.page.clone())
    }

    /// Create a new page, returning it pinned together with its ID
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let page_id = self.disk_manager.allocate_page()?;

        let mut page_table = self.page_table.write();
        let frame_id = self.allocate_frame(&mut page_table)?;
        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        {
            let mut page_guard = frame_guard.page.write();
            *page_guard = Page::new(page_id);
        }

        frame_guard.pin_count = 1;
        frame_guard.is_dirty = true;

        page_table.insert(page_id, frame_id);
        self.replacer.record_access(frame_id);
        self.replacer.set_evictable(frame_id, false);

        Ok((frame_guard.page.clone(), page_id))
    }

    /// Unpin a page, optionally marking it dirty. When the pin count reaches
    /// zero the frame becomes an eviction candidate.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "Cannot unpin invalid page ID".to_string(),
            ));
        }

        let frame_id = {
            let page_table = self.page_table.read();
            match page_table.get(&page_id) {
                Some(&id) => id,
                None => return Err(BufferPoolError::PageNotFound(page_id)),
            }
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        if frame_guard.pin_count > 0 {
            frame_guard.pin_count -= 1;
        }
        if is_dirty {
            frame_guard.is_dirty = true;
        }

        if frame_guard.pin_count == 0 {
            self.replacer.set_evictable(frame_id, true);
        }

        Ok(())
    }

    /// Flush a specific page to disk
    pub fn flush_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "Cannot flush invalid page ID".to_string(),
            ));
        }

        let frame_id = {
            let page_table = self.page_table.read();
            match page_table.get(&page_id) {
                Some(&id) => id,
                None => return Err(BufferPoolError::PageNotFound(page_id)),
            }
        };

        let frame = &self.frames[frame_id as usize];
        let needs_flush;
        let page_copy;

        {
            let frame_guard = frame.read();
            needs_flush = frame_guard.is_dirty;
            if needs_flush {
                page_copy = frame_guard.page.read().clone();
            } else {
                page_copy = Page::new(INVALID_PAGE_ID);
            }
        }

        if needs_flush {
            self.disk_manager.write_page(&page_copy)?;

            let mut frame_guard = frame.write();
            frame_guard.is_dirty = false;
        }

        Ok(())
    }

    /// Flush all pages in the buffer pool to disk
    pub fn flush_all_pages(&self) -> Result<(), BufferPoolError> {
        let page_ids: Vec<PageId> = self.page_table.read().keys().copied().collect();

        for page_id in page_ids {
            self.flush_page(page_id)?;
        }

        Ok(())
    }

    /// Drop a page from the buffer pool. Fails if the page is still pinned.
    pub fn delete_page(&self, page_id: PageId) -> Result<(), BufferPoolError> {
        if page_id == INVALID_PAGE_ID {
            return Err(BufferPoolError::InvalidOperation(
                "Cannot delete invalid page ID".to_string(),
            ));
        }

        let mut page_table = self.page_table.write();

        let Some(&frame_id) = page_table.get(&page_id) else {
            // Not resident: nothing to drop
            return Ok(());
        };

        let frame = &self.frames[frame_id as usize];
        let mut frame_guard = frame.write();

        if frame_guard.pin_count > 0 {
            return Err(BufferPoolError::PagePinned(page_id));
        }

        page_table.remove(&page_id);

        {
            let mut page_guard = frame_guard.page.write();
            *page_guard = Page::new(INVALID_PAGE_ID);
        }
        frame_guard.is_dirty = false;
        frame_guard.pin_count = 0;

        drop(frame_guard);
        self.replacer.remove(frame_id);
        self.free_list.write().push_back(frame_id);

        Ok(())
    }

    /// Allocate a frame from the free list, or evict a victim.
    ///
    /// The caller must hold the page-table write lock; the victim's mapping
    /// is removed here before the frame is handed out.
    fn allocate_frame(
        &self,
        page_table: &mut HashMap<PageId, FrameId>,
    ) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = self.free_list.write().pop_front() {
            return Ok(frame_id);
        }

        let Some(victim_id) = self.replacer.evict() else {
            return Err(BufferPoolError::NoFreeFrames);
        };

        let frame = &self.frames[victim_id as usize];

        // Write back the victim's contents before reuse
        let (victim_page_id, dirty_copy) = {
            let frame_guard = frame.read();
            assert_eq!(frame_guard.pin_count, 0, "evicted a pinned frame");

            let page_guard = frame_guard.page.read();
            let copy = if frame_guard.is_dirty {
                Some(page_guard.clone())
            } else {
                None
            };
            (page_guard.page_id, copy)
        };

        if let Some(page) = dirty_copy {
            self.disk_manager.write_page(&page)?;
        }

        if victim_page_id != INVALID_PAGE_ID {
            debug!("evicting page {} from frame {}", victim_page_id, victim_id);
            page_table.remove(&victim_page_id);
        }

        Ok(victim_id)
    }
}
