use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use log::debug;
use parking_lot::Mutex;

use crate::common::types::{
    PageId, PagePtr, PageReadGuard, PageWriteGuard, Rid, INVALID_PAGE_ID,
};
use crate::index::btree::error::BTreeError;
use crate::index::btree::page::codec;
use crate::index::btree::page::header;
use crate::index::btree::page::node::{LeafNode, TreeNode};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};

/// Write operations that descend with latch crabbing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteOp {
    Insert,
    Delete,
}

/// What a read traversal descends towards
pub(crate) enum ReadTarget<'a, K> {
    Key(&'a K),
    Leftmost,
}

/// One write-latched, pinned page on the traversal path
pub(crate) struct WriteFrame {
    pub page_id: PageId,
    pub guard: PageWriteGuard,
    // Keeps the frame's Arc alive alongside the owned guard
    _page: PagePtr,
}

/// The latch stack accumulated by a write traversal: every still-latched
/// ancestor plus the current page, root end first.
///
/// Dropping the path releases every remaining latch, unpins the pages, and
/// reclaims pages marked for deletion.
pub(crate) struct WritePath {
    buffer_pool: Arc<BufferPoolManager>,
    pub frames: Vec<WriteFrame>,
    pub deleted: Vec<PageId>,
}

impl WritePath {
    fn new(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            frames: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn push(&mut self, page_id: PageId, page: PagePtr, guard: PageWriteGuard) {
        self.frames.push(WriteFrame {
            page_id,
            guard,
            _page: page,
        });
    }

    pub fn top_page_id(&self) -> PageId {
        self.frames.last().expect("empty write path").page_id
    }

    /// Unlatch and unpin the current page, exposing its parent as the top
    pub fn pop_release(&mut self) {
        let frame = self.frames.pop().expect("empty write path");
        let page_id = frame.page_id;
        drop(frame.guard);
        let _ = self.buffer_pool.unpin_page(page_id, true);
    }

    /// The crab step: once the current page is safe, every ancestor above it
    /// can unlatch
    pub fn release_ancestors(&mut self) {
        let keep_from = self.frames.len() - 1;
        for frame in self.frames.drain(..keep_from) {
            let page_id = frame.page_id;
            drop(frame.guard);
            let _ = self.buffer_pool.unpin_page(page_id, true);
        }
    }

    fn release_all(&mut self) {
        while !self.frames.is_empty() {
            self.pop_release();
        }
    }
}

impl Drop for WritePath {
    fn drop(&mut self) {
        self.release_all();
        for page_id in self.deleted.drain(..) {
            // Deletion can fail if a lagging iterator still pins the page;
            // the page is then simply left allocated
            if let Err(e) = self.buffer_pool.delete_page(page_id) {
                debug!("deferred page {} not reclaimed: {}", page_id, e);
            }
        }
    }
}

/// One read-latched, pinned page; unpins itself on drop
pub(crate) struct ReadFrame {
    buffer_pool: Arc<BufferPoolManager>,
    pub page_id: PageId,
    guard: Option<PageReadGuard>,
    _page: PagePtr,
}

impl ReadFrame {
    fn new(
        buffer_pool: Arc<BufferPoolManager>,
        page_id: PageId,
        page: PagePtr,
        guard: PageReadGuard,
    ) -> Self {
        Self {
            buffer_pool,
            page_id,
            guard: Some(guard),
            _page: page,
        }
    }

    pub fn guard(&self) -> &PageReadGuard {
        self.guard.as_ref().expect("read frame already released")
    }

    /// Hand the latch and pin over to the caller (used to seed an iterator);
    /// the frame's own drop no longer unpins
    pub fn into_parts(mut self) -> (PageId, PagePtr, PageReadGuard) {
        let guard = self.guard.take().expect("read frame already released");
        (self.page_id, self._page.clone(), guard)
    }
}

impl Drop for ReadFrame {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            let _ = self.buffer_pool.unpin_page(self.page_id, false);
        }
    }
}

/// Concurrent B+Tree index over the buffer pool.
///
/// Pages reference each other by page id only; the buffer pool owns all
/// memory and the tree holds transient pinned handles. Thread safety comes
/// from latch crabbing: a traversal latches a child before releasing its
/// ancestors, and a writer keeps every ancestor that a split or merge might
/// still touch.
pub struct BPlusTree<K> {
    index_name: String,
    pub(crate) buffer_pool: Arc<BufferPoolManager>,
    // Sampled under the tree latch at the start of each traversal; replaced
    // atomically so a writer finishing a root split never waits on traversal
    root_page_id: AtomicU32,
    tree_latch: Mutex<()>,
    pub(crate) leaf_max_size: usize,
    pub(crate) internal_max_size: usize,
    _marker: PhantomData<fn() -> K>,
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
{
    /// Open (or create) the index named `index_name`. The root page id is
    /// recovered from the header page record.
    pub fn new(
        index_name: impl Into<String>,
        buffer_pool: Arc<BufferPoolManager>,
        leaf_max_size: usize,
        internal_max_size: usize,
    ) -> Result<Self, BTreeError> {
        assert!(leaf_max_size >= 3, "leaf pages need at least three slots");
        assert!(
            internal_max_size >= 3,
            "internal pages need at least three slots"
        );

        let index_name = index_name.into();
        let root_page_id = header::root_of(&buffer_pool, &index_name)?;

        Ok(Self {
            index_name,
            buffer_pool,
            root_page_id: AtomicU32::new(root_page_id),
            tree_latch: Mutex::new(()),
            leaf_max_size,
            internal_max_size,
            _marker: PhantomData,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.root_page_id.load(Ordering::SeqCst) == INVALID_PAGE_ID
    }

    pub fn root_page_id(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    /// Point lookup
    pub fn get(&self, key: &K) -> Result<Option<Rid>, BTreeError> {
        let Some((_frame, leaf)) = self.find_leaf_read(ReadTarget::Key(key))? else {
            return Ok(None);
        };
        Ok(leaf.get(key))
    }

    pub(crate) fn load_root(&self) -> PageId {
        self.root_page_id.load(Ordering::SeqCst)
    }

    pub(crate) fn store_root(&self, page_id: PageId) -> Result<(), BTreeError> {
        self.root_page_id.store(page_id, Ordering::SeqCst);
        header::set_root(&self.buffer_pool, &self.index_name, page_id)
    }

    pub(crate) fn tree_latch(&self) -> &Mutex<()> {
        &self.tree_latch
    }

    /// Fetch with a short retry loop: a full pool is transient while other
    /// traversals still hold pins
    pub(crate) fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BTreeError> {
        const RETRIES: usize = 16;
        let mut attempt = 0;
        loop {
            match self.buffer_pool.fetch_page(page_id) {
                Err(BufferPoolError::NoFreeFrames) if attempt < RETRIES => {
                    attempt += 1;
                    std::thread::yield_now();
                }
                other => return Ok(other?),
            }
        }
    }

    pub(crate) fn new_page(&self) -> Result<(PagePtr, PageId), BTreeError> {
        const RETRIES: usize = 16;
        let mut attempt = 0;
        loop {
            match self.buffer_pool.new_page() {
                Err(BufferPoolError::NoFreeFrames) if attempt < RETRIES => {
                    attempt += 1;
                    std::thread::yield_now();
                }
                other => return Ok(other?),
            }
        }
    }

    /// Rewrite a page's parent pointer under a short write latch
    pub(crate) fn reparent(&self, page_id: PageId, parent: PageId) -> Result<(), BTreeError> {
        let page = self.fetch_page(page_id)?;
        {
            let mut guard = page.write();
            codec::set_parent_page_id(&mut guard, parent);
        }
        self.buffer_pool.unpin_page(page_id, true)?;
        Ok(())
    }

    /// Whether a just-latched child lets the traversal release its ancestors
    fn is_safe(node: &TreeNode<K>, op: WriteOp) -> bool {
        match op {
            // Inserting one more entry must not reach the split threshold
            WriteOp::Insert => {
                if node.is_leaf() {
                    node.size() < node.max_size() - 1
                } else {
                    node.size() < node.max_size()
                }
            }
            // Removing one entry must not underflow
            WriteOp::Delete => node.size() > node.min_size(),
        }
    }

    /// Descend to the leaf covering `key`, write-latching pages top-down and
    /// releasing ancestors as soon as the current child is safe.
    ///
    /// Returns `None` when the tree is empty. Otherwise the returned path
    /// ends at the leaf and retains exactly the ancestors a split or merge
    /// may still need.
    pub(crate) fn find_leaf_write(
        &self,
        key: &K,
        op: WriteOp,
    ) -> Result<Option<WritePath>, BTreeError> {
        let mut tree_guard = Some(self.tree_latch.lock());
        let mut path = WritePath::new(self.buffer_pool.clone());

        // Latch the root; restart if another writer replaced it in between
        loop {
            let root_id = self.load_root();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let page = self.fetch_page(root_id)?;
            let guard = page.write_arc();
            if self.load_root() != root_id {
                drop(guard);
                self.buffer_pool.unpin_page(root_id, false)?;
                continue;
            }
            path.push(root_id, page, guard);
            break;
        }

        let mut node = codec::decode_node::<K>(&path.frames.last().unwrap().guard)?;
        loop {
            let internal = match &node {
                TreeNode::Leaf(_) => break,
                TreeNode::Internal(internal) => internal,
            };
            let child_id = internal.lookup(key);

            let child_page = self.fetch_page(child_id)?;
            let child_guard = child_page.write_arc();
            path.push(child_id, child_page, child_guard);

            let child_node = codec::decode_node::<K>(&path.frames.last().unwrap().guard)?;
            if Self::is_safe(&child_node, op) {
                path.release_ancestors();
                tree_guard.take();
            }
            node = child_node;
        }

        drop(tree_guard);
        Ok(Some(path))
    }

    /// Descend to a leaf with read latches, releasing each parent as soon as
    /// the child latch is held. Returns the latched leaf frame and its
    /// decoded contents, or `None` on an empty tree.
    pub(crate) fn find_leaf_read(
        &self,
        target: ReadTarget<'_, K>,
    ) -> Result<Option<(ReadFrame, LeafNode<K>)>, BTreeError> {
        let mut tree_guard = Some(self.tree_latch.lock());

        let (mut frame, mut node) = loop {
            let root_id = self.load_root();
            if root_id == INVALID_PAGE_ID {
                return Ok(None);
            }
            let page = self.fetch_page(root_id)?;
            let guard = page.read_arc();
            if self.load_root() != root_id {
                drop(guard);
                self.buffer_pool.unpin_page(root_id, false)?;
                continue;
            }
            let node = codec::decode_node::<K>(&guard)?;
            break (
                ReadFrame::new(self.buffer_pool.clone(), root_id, page, guard),
                node,
            );
        };

        loop {
            match node {
                TreeNode::Leaf(leaf) => {
                    drop(tree_guard);
                    return Ok(Some((frame, leaf)));
                }
                TreeNode::Internal(internal) => {
                    let child_id = match &target {
                        ReadTarget::Key(key) => internal.lookup(*key),
                        ReadTarget::Leftmost => internal.children[0],
                    };

                    let child_page = self.fetch_page(child_id)?;
                    let child_guard = child_page.read_arc();
                    // The parent unlatches only now that the child is held
                    frame = ReadFrame::new(
                        self.buffer_pool.clone(),
                        child_id,
                        child_page,
                        child_guard,
                    );
                    tree_guard.take();
                    node = codec::decode_node::<K>(frame.guard())?;
                }
            }
        }
    }
}
