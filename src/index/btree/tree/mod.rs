pub mod base;
pub mod insert;
pub mod remove;
pub mod iterator;

pub use base::BPlusTree;
