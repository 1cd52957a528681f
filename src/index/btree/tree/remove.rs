use log::debug;

use crate::common::types::INVALID_PAGE_ID;
use crate::index::btree::error::BTreeError;
use crate::index::btree::page::codec;
use crate::index::btree::page::node::TreeNode;
use super::base::{BPlusTree, WriteOp, WritePath};

impl<K> BPlusTree<K>
where
    K: Clone + Ord + serde::Serialize + for<'de> serde::Deserialize<'de> + Send + Sync + 'static,
{
    /// Remove a key. Absent keys are ignored.
    pub fn remove(&self, key: &K) -> Result<(), BTreeError> {
        let Some(mut path) = self.find_leaf_write(key, WriteOp::Delete)? else {
            return Ok(());
        };
        self.delete_entry(&mut path, key.clone())
    }

    /// Delete `key` from the page on top of the path, then rebalance
    /// bottom-up. For a leaf the key is a record key; recursive calls delete
    /// separator keys out of internal pages after a coalesce.
    fn delete_entry(&self, path: &mut WritePath, key: K) -> Result<(), BTreeError> {
        let top_idx = path.frames.len() - 1;
        let top_id = path.frames[top_idx].page_id;

        let mut node = codec::decode_node::<K>(&path.frames[top_idx].guard)?;
        let removed = match &mut node {
            TreeNode::Leaf(leaf) => leaf.delete(&key),
            TreeNode::Internal(internal) => internal.delete(&key),
        };
        if !removed {
            return Ok(());
        }

        if top_id == self.load_root() {
            return self.adjust_root(path, node);
        }

        codec::encode_node(&node, &mut path.frames[top_idx].guard)?;
        if node.size() >= node.min_size() {
            return Ok(());
        }

        // Underflow: rebalance against a sibling through the latched parent
        assert!(path.frames.len() >= 2, "underflowed page has no latched parent");
        let parent_idx = top_idx - 1;
        let mut parent = match codec::decode_node::<K>(&path.frames[parent_idx].guard)? {
            TreeNode::Internal(internal) => internal,
            TreeNode::Leaf(_) => return Err(BTreeError::InvalidPageFormat),
        };

        let (sibling_id, separator, sibling_is_pred) = parent.sibling_of(top_id);
        let sibling_page = self.fetch_page(sibling_id)?;
        let mut sibling_guard = sibling_page.write_arc();
        let mut sibling = codec::decode_node::<K>(&sibling_guard)?;

        if sibling.size() + node.size() <= node.merge_capacity() {
            // Coalesce into the left page of the pair; the right page dies
            if sibling_is_pred {
                match (&mut sibling, node) {
                    (TreeNode::Leaf(left), TreeNode::Leaf(right)) => left.merge_right(right),
                    (TreeNode::Internal(left), TreeNode::Internal(right)) => {
                        let moved = left.merge_right(separator.clone(), right);
                        for child in moved {
                            self.reparent(child, sibling_id)?;
                        }
                    }
                    _ => return Err(BTreeError::InvalidPageFormat),
                }
                codec::encode_node(&sibling, &mut sibling_guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                path.pop_release();
                path.deleted.push(top_id);
                debug!("page {} coalesced into {}", top_id, sibling_id);
            } else {
                match (&mut node, sibling) {
                    (TreeNode::Leaf(left), TreeNode::Leaf(right)) => left.merge_right(right),
                    (TreeNode::Internal(left), TreeNode::Internal(right)) => {
                        let moved = left.merge_right(separator.clone(), right);
                        for child in moved {
                            self.reparent(child, top_id)?;
                        }
                    }
                    _ => return Err(BTreeError::InvalidPageFormat),
                }
                codec::encode_node(&node, &mut path.frames[top_idx].guard)?;
                drop(sibling_guard);
                self.buffer_pool.unpin_page(sibling_id, true)?;
                path.deleted.push(sibling_id);
                path.pop_release();
                debug!("page {} coalesced into {}", sibling_id, top_id);
            }

            // The separator between the merged pair leaves the parent
            return self.delete_entry(path, separator);
        }

        // Redistribute: borrow one entry across the boundary and rewrite the
        // parent separator to the new split point
        match (&mut node, &mut sibling) {
            (TreeNode::Leaf(leaf), TreeNode::Leaf(sib)) => {
                let new_separator;
                if sibling_is_pred {
                    let (k, v) = sib.pop_last();
                    new_separator = k.clone();
                    leaf.push_front((k, v));
                } else {
                    let entry = sib.pop_first();
                    leaf.push_back(entry);
                    new_separator = sib.first_key().clone();
                }
                parent.set_separator(&separator, new_separator);
            }
            (TreeNode::Internal(internal), TreeNode::Internal(sib)) => {
                let moved_child;
                let new_separator;
                if sibling_is_pred {
                    let (k, c) = sib.pop_last();
                    internal.push_front(separator.clone(), c);
                    moved_child = c;
                    new_separator = k;
                } else {
                    let (k, c) = sib.pop_first();
                    internal.push_back(separator.clone(), c);
                    moved_child = c;
                    new_separator = k;
                }
                self.reparent(moved_child, top_id)?;
                parent.set_separator(&separator, new_separator);
            }
            _ => return Err(BTreeError::InvalidPageFormat),
        }

        codec::encode_node(&TreeNode::Internal(parent), &mut path.frames[parent_idx].guard)?;
        codec::encode_node(&node, &mut path.frames[top_idx].guard)?;
        codec::encode_node(&sibling, &mut sibling_guard)?;
        drop(sibling_guard);
        self.buffer_pool.unpin_page(sibling_id, true)?;
        path.pop_release();

        Ok(())
    }

    /// Shrink the tree when the root itself lost an entry
    fn adjust_root(&self, path: &mut WritePath, node: TreeNode<K>) -> Result<(), BTreeError> {
        let top_idx = path.frames.len() - 1;
        let top_id = path.frames[top_idx].page_id;

        match &node {
            // Last key gone: the tree is empty again
            TreeNode::Leaf(leaf) if leaf.size() == 0 => {
                self.store_root(INVALID_PAGE_ID)?;
                path.pop_release();
                path.deleted.push(top_id);
                debug!("tree emptied, root {} dropped", top_id);
            }
            // A single child left: it becomes the root
            TreeNode::Internal(internal) if internal.size() == 1 => {
                let new_root = internal.children[0];
                self.store_root(new_root)?;
                self.reparent(new_root, INVALID_PAGE_ID)?;
                path.pop_release();
                path.deleted.push(top_id);
                debug!("root collapsed, {} promoted", new_root);
            }
            _ => {
                codec::encode_node(&node, &mut path.frames[top_idx].guard)?;
            }
        }
        Ok(())
    }
}
