pub mod node;
pub mod codec;
pub mod header;

pub use node::{InternalNode, LeafNode, TreeNode};
