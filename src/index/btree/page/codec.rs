use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::common::types::{Page, PageId, Rid, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::index::btree::page::node::{InternalNode, LeafNode, TreeNode};

// Fixed page header, so parent/next rewires touch four bytes instead of
// re-encoding the payload:
// - [0]      page kind tag
// - [1..3]   size (leaf: entry count; internal: child count)
// - [3..5]   max size
// - [5..9]   parent page id
// - [9..13]  next page id (leaves; zero otherwise)
// - [13..15] payload length
// - [15..]   bincode payload
const TAG_LEAF: u8 = 1;
const TAG_INTERNAL: u8 = 2;

const OFFSET_SIZE: usize = 1;
const OFFSET_MAX_SIZE: usize = 3;
const OFFSET_PARENT: usize = 5;
const OFFSET_NEXT: usize = 9;
const OFFSET_PAYLOAD_LEN: usize = 13;
const HEADER_SIZE: usize = 15;

/// Serialize a tree node into a page
pub fn encode_node<K>(node: &TreeNode<K>, page: &mut Page) -> Result<(), BTreeError>
where
    K: Clone + Ord + Serialize,
{
    let (tag, size, max_size, parent, next, payload) = match node {
        TreeNode::Leaf(leaf) => {
            let payload = bincode::serialize(&leaf.entries)
                .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
            (
                TAG_LEAF,
                leaf.size(),
                leaf.max_size,
                leaf.parent_page_id,
                leaf.next_page_id,
                payload,
            )
        }
        TreeNode::Internal(internal) => {
            let payload = bincode::serialize(&(&internal.keys, &internal.children))
                .map_err(|e| BTreeError::SerializationError(e.to_string()))?;
            (
                TAG_INTERNAL,
                internal.size(),
                internal.max_size,
                internal.parent_page_id,
                0,
                payload,
            )
        }
    };

    if HEADER_SIZE + payload.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }

    page.data.fill(0);
    page.data[0] = tag;
    LittleEndian::write_u16(&mut page.data[OFFSET_SIZE..OFFSET_MAX_SIZE], size as u16);
    LittleEndian::write_u16(
        &mut page.data[OFFSET_MAX_SIZE..OFFSET_PARENT],
        max_size as u16,
    );
    LittleEndian::write_u32(&mut page.data[OFFSET_PARENT..OFFSET_NEXT], parent);
    LittleEndian::write_u32(&mut page.data[OFFSET_NEXT..OFFSET_PAYLOAD_LEN], next);
    LittleEndian::write_u16(
        &mut page.data[OFFSET_PAYLOAD_LEN..HEADER_SIZE],
        payload.len() as u16,
    );
    page.data[HEADER_SIZE..HEADER_SIZE + payload.len()].copy_from_slice(&payload);

    Ok(())
}

/// Deserialize a tree node from a page
pub fn decode_node<K>(page: &Page) -> Result<TreeNode<K>, BTreeError>
where
    K: Clone + Ord + DeserializeOwned,
{
    let tag = page.data[0];
    let size = LittleEndian::read_u16(&page.data[OFFSET_SIZE..OFFSET_MAX_SIZE]) as usize;
    let max_size = LittleEndian::read_u16(&page.data[OFFSET_MAX_SIZE..OFFSET_PARENT]) as usize;
    let parent = LittleEndian::read_u32(&page.data[OFFSET_PARENT..OFFSET_NEXT]);
    let next = LittleEndian::read_u32(&page.data[OFFSET_NEXT..OFFSET_PAYLOAD_LEN]);
    let payload_len = LittleEndian::read_u16(&page.data[OFFSET_PAYLOAD_LEN..HEADER_SIZE]) as usize;

    if HEADER_SIZE + payload_len > PAGE_SIZE {
        return Err(BTreeError::InvalidPageFormat);
    }
    let payload = &page.data[HEADER_SIZE..HEADER_SIZE + payload_len];

    match tag {
        TAG_LEAF => {
            let entries: Vec<(K, Rid)> = bincode::deserialize(payload)
                .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
            debug_assert_eq!(entries.len(), size);
            Ok(TreeNode::Leaf(LeafNode {
                parent_page_id: parent,
                next_page_id: next,
                max_size,
                entries,
            }))
        }
        TAG_INTERNAL => {
            let (keys, children): (Vec<K>, Vec<PageId>) = bincode::deserialize(payload)
                .map_err(|e| BTreeError::DeserializationError(e.to_string()))?;
            debug_assert_eq!(children.len(), size);
            Ok(TreeNode::Internal(InternalNode {
                parent_page_id: parent,
                max_size,
                keys,
                children,
            }))
        }
        _ => Err(BTreeError::InvalidPageFormat),
    }
}

/// Rewrite only the parent pointer of an already-encoded node
pub fn set_parent_page_id(page: &mut Page, parent: PageId) {
    LittleEndian::write_u32(&mut page.data[OFFSET_PARENT..OFFSET_NEXT], parent);
}
