use std::sync::Arc;
use log::warn;

use crate::common::types::{PageId, PagePtr, PageReadGuard, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::page::codec;
use crate::index::btree::page::node::{LeafNode, TreeNode};
use crate::storage::buffer::BufferPoolManager;
use super::base::{BPlusTree, ReadTarget};

struct LeafCursor<K> {
    page_id: PageId,
    // The read latch pins the leaf's contents while the cursor sits on it
    guard: Option<PageReadGuard>,
    _page: PagePtr,
    node: LeafNode<K>,
    index: usize,
}

/// Forward-only, non-restartable key-order iterator.
///
/// Holds at most one leaf latch at a time: advancing past the last slot
/// releases the current leaf before the next one is latched, so entries
/// inserted ahead of or deleted behind the cursor by concurrent writers may
/// or may not be observed. An exhausted iterator holds nothing.
pub struct BPlusTreeIter<K> {
    buffer_pool: Arc<BufferPoolManager>,
    cursor: Option<LeafCursor<K>>,
}

impl<K> BPlusTreeIter<K>
where
    K: Clone + Ord + serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
{
    fn exhausted(buffer_pool: Arc<BufferPoolManager>) -> Self {
        Self {
            buffer_pool,
            cursor: None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.cursor.is_none()
    }

    /// Latch the next leaf in the chain and position at its first slot
    fn hop_to(&mut self, page_id: PageId) -> Result<(), BTreeError> {
        let page = self.buffer_pool.fetch_page(page_id)?;
        let guard = page.read_arc();
        let node = match codec::decode_node::<K>(&guard)? {
            TreeNode::Leaf(leaf) => leaf,
            TreeNode::Internal(_) => return Err(BTreeError::InvalidPageFormat),
        };
        self.cursor = Some(LeafCursor {
            page_id,
            guard: Some(guard),
            _page: page,
            node,
            index: 0,
        });
        Ok(())
    }
}

impl<K> Iterator for BPlusTreeIter<K>
where
    K: Clone + Ord + serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
{
    type Item = (K, Rid);

    fn next(&mut self) -> Option<(K, Rid)> {
        loop {
            let cursor = self.cursor.as_mut()?;

            if cursor.index < cursor.node.entries.len() {
                let entry = cursor.node.entries[cursor.index].clone();
                cursor.index += 1;
                return Some(entry);
            }

            // Leaf exhausted: unlatch it, then follow the chain
            let next_id = cursor.node.next_page_id;
            let page_id = cursor.page_id;
            cursor.guard.take();
            let _ = self.buffer_pool.unpin_page(page_id, false);
            self.cursor = None;

            if next_id == INVALID_PAGE_ID {
                return None;
            }
            if let Err(e) = self.hop_to(next_id) {
                warn!("iterator stopped at page {}: {}", next_id, e);
                return None;
            }
        }
    }
}

impl<K> Drop for BPlusTreeIter<K> {
    fn drop(&mut self) {
        if let Some(mut cursor) = self.cursor.take() {
            if cursor.guard.take().is_some() {
                let _ = self.buffer_pool.unpin_page(cursor.page_id, false);
            }
        }
    }
}

impl<K> BPlusTree<K>
where
    K: Clone + Ord + serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
{
    /// Iterate from the first key of the index
    pub fn iter(&self) -> Result<BPlusTreeIter<K>, BTreeError> {
        match self.find_leaf_read(ReadTarget::Leftmost)? {
            Some((frame, node)) => self.cursor_at(frame, node, 0),
            None => Ok(BPlusTreeIter::exhausted(self.buffer_pool.clone())),
        }
    }

    /// Iterate starting at `key`. Without an exact match the iterator starts
    /// exhausted.
    pub fn iter_from(&self, key: &K) -> Result<BPlusTreeIter<K>, BTreeError> {
        match self.find_leaf_read(ReadTarget::Key(key))? {
            Some((frame, node)) => {
                match node.entries.binary_search_by(|(k, _)| k.cmp(key)) {
                    Ok(index) => self.cursor_at(frame, node, index),
                    Err(_) => Ok(BPlusTreeIter::exhausted(self.buffer_pool.clone())),
                }
            }
            None => Ok(BPlusTreeIter::exhausted(self.buffer_pool.clone())),
        }
    }

    fn cursor_at(
        &self,
        frame: super::base::ReadFrame,
        node: LeafNode<K>,
        index: usize,
    ) -> Result<BPlusTreeIter<K>, BTreeError> {
        let (page_id, page, guard) = frame.into_parts();
        Ok(BPlusTreeIter {
            buffer_pool: self.buffer_pool.clone(),
            cursor: Some(LeafCursor {
                page_id,
                guard: Some(guard),
                _page: page,
                node,
                index,
            }),
        })
    }
}
