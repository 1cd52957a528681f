use log::debug;

use crate::common::types::{PageId, PageWriteGuard, Rid, INVALID_PAGE_ID};
use crate::index::btree::error::BTreeError;
use crate::index::btree::page::codec;
use crate::index::btree::page::node::{InternalNode, LeafNode, TreeNode};
use super::base::{BPlusTree, WriteOp, WritePath};

impl<K> BPlusTree<K>
where
    K: Clone + Ord + serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
{
    /// Insert a key/record pair. Returns `false` when the key already exists.
    pub fn insert(&self, key: K, rid: Rid) -> Result<bool, BTreeError> {
        loop {
            match self.find_leaf_write(&key, WriteOp::Insert)? {
                Some(path) => return self.insert_into_leaf(path, key, rid),
                // Empty tree: plant a leaf root, then descend again
                None => self.start_new_tree()?,
            }
        }
    }

    fn start_new_tree(&self) -> Result<(), BTreeError> {
        let _tree_guard = self.tree_latch().lock();

        // Another writer may have planted the root while we waited
        if self.load_root() != INVALID_PAGE_ID {
            return Ok(());
        }

        let (page, page_id) = self.new_page()?;
        {
            let mut guard = page.write();
            let root: LeafNode<K> = LeafNode::new(self.leaf_max_size);
            codec::encode_node(&TreeNode::Leaf(root), &mut guard)?;
        }
        self.buffer_pool.unpin_page(page_id, true)?;
        self.store_root(page_id)?;
        debug!("new leaf root {}", page_id);
        Ok(())
    }

    fn insert_into_leaf(
        &self,
        mut path: WritePath,
        key: K,
        rid: Rid,
    ) -> Result<bool, BTreeError> {
        let top = path.frames.last_mut().expect("empty path at leaf");
        let mut leaf = match codec::decode_node::<K>(&top.guard)? {
            TreeNode::Leaf(leaf) => leaf,
            TreeNode::Internal(_) => return Err(BTreeError::InvalidPageFormat),
        };

        if !leaf.insert(key, rid) {
            return Ok(false);
        }

        if leaf.size() == leaf.max_size {
            // Overflowed: move the upper half to a fresh sibling and hand the
            // separator to the parent
            let (sibling_page, sibling_id) = self.new_page()?;
            let mut sibling_guard = sibling_page.write_arc();

            let sibling = leaf.split(sibling_id);
            let separator = sibling.first_key().clone();

            let top = path.frames.last_mut().expect("empty path at leaf");
            codec::encode_node(&TreeNode::Leaf(leaf), &mut top.guard)?;
            codec::encode_node(&TreeNode::Leaf(sibling), &mut sibling_guard)?;
            debug!("leaf {} split, new sibling {}", top.page_id, sibling_id);

            self.insert_in_parent(&mut path, separator, sibling_id, sibling_guard)?;
        } else {
            let top = path.frames.last_mut().expect("empty path at leaf");
            codec::encode_node(&TreeNode::Leaf(leaf), &mut top.guard)?;
        }

        Ok(true)
    }

    /// Link a freshly split-off right page into the tree. The path's top
    /// frame is the left half, already encoded; `right_guard` keeps the new
    /// sibling latched until its parent pointer is settled.
    fn insert_in_parent(
        &self,
        path: &mut WritePath,
        separator: K,
        right_id: PageId,
        mut right_guard: PageWriteGuard,
    ) -> Result<(), BTreeError> {
        let left_id = path.top_page_id();

        if left_id == self.load_root() {
            // The root itself split: grow the tree by one level
            let (root_page, root_id) = self.new_page()?;
            let mut root_guard = root_page.write_arc();

            let mut new_root = InternalNode::new(self.internal_max_size);
            new_root.keys.push(separator);
            new_root.children.push(left_id);
            new_root.children.push(right_id);
            codec::encode_node(&TreeNode::Internal(new_root), &mut root_guard)?;

            let left_frame = path.frames.last_mut().expect("empty path");
            codec::set_parent_page_id(&mut left_frame.guard, root_id);
            codec::set_parent_page_id(&mut right_guard, root_id);

            self.store_root(root_id)?;
            debug!("root split, new root {}", root_id);

            path.pop_release();
            drop(right_guard);
            self.buffer_pool.unpin_page(right_id, true)?;
            drop(root_guard);
            self.buffer_pool.unpin_page(root_id, true)?;
            return Ok(());
        }

        // The parent is the next-latched ancestor on the path
        assert!(path.frames.len() >= 2, "split page has no latched parent");
        let parent_idx = path.frames.len() - 2;
        let parent_id = path.frames[parent_idx].page_id;

        let mut parent = match codec::decode_node::<K>(&path.frames[parent_idx].guard)? {
            TreeNode::Internal(internal) => internal,
            TreeNode::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
        };

        if parent.size() < parent.max_size {
            parent.insert(separator, right_id);
            codec::encode_node(&TreeNode::Internal(parent), &mut path.frames[parent_idx].guard)?;
            codec::set_parent_page_id(&mut right_guard, parent_id);

            drop(right_guard);
            self.buffer_pool.unpin_page(right_id, true)?;
            path.pop_release();
            return Ok(());
        }

        // Parent is full too: split it through a scratch copy and recurse
        let (psibling_page, psibling_id) = self.new_page()?;
        let mut psibling_guard = psibling_page.write_arc();

        let (parent_separator, psibling) = parent.split_insert(separator, right_id);

        // Children that moved to the new sibling need their parent pointer
        // rewired; the split-off right page is still latched here, so it is
        // patched through its guard rather than refetched
        let right_home = if psibling.children.contains(&right_id) {
            psibling_id
        } else {
            parent_id
        };
        codec::set_parent_page_id(&mut right_guard, right_home);
        for &child in &psibling.children {
            if child != right_id {
                self.reparent(child, psibling_id)?;
            }
        }

        codec::encode_node(&TreeNode::Internal(parent), &mut path.frames[parent_idx].guard)?;
        codec::encode_node(&TreeNode::Internal(psibling), &mut psibling_guard)?;
        debug!("internal {} split, new sibling {}", parent_id, psibling_id);

        drop(right_guard);
        self.buffer_pool.unpin_page(right_id, true)?;
        path.pop_release();

        self.insert_in_parent(path, parent_separator, psibling_id, psibling_guard)
    }
}
