use std::collections::HashMap;
use std::sync::Arc;

use crate::common::types::{PageId, INVALID_PAGE_ID, PAGE_SIZE};
use crate::index::btree::error::BTreeError;
use crate::storage::buffer::BufferPoolManager;

/// Fixed well-known page holding the persistent `{index name -> root page}`
/// record. The disk manager reserves this page when the file is created.
pub const HEADER_PAGE_ID: PageId = 1;

type RootRecord = HashMap<String, PageId>;

/// Read the root page id recorded for `index_name`, or `INVALID_PAGE_ID`
/// when the index has no record yet
pub fn root_of(
    buffer_pool: &Arc<BufferPoolManager>,
    index_name: &str,
) -> Result<PageId, BTreeError> {
    let page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
    let record = {
        let guard = page.read();
        decode_record(&guard.data)
    };
    buffer_pool.unpin_page(HEADER_PAGE_ID, false)?;

    Ok(record?.get(index_name).copied().unwrap_or(INVALID_PAGE_ID))
}

/// Insert or update the root record for `index_name`
pub fn set_root(
    buffer_pool: &Arc<BufferPoolManager>,
    index_name: &str,
    root_page_id: PageId,
) -> Result<(), BTreeError> {
    let page = buffer_pool.fetch_page(HEADER_PAGE_ID)?;
    let result = {
        let mut guard = page.write();
        write_record(&mut guard.data, index_name, root_page_id)
    };
    buffer_pool.unpin_page(HEADER_PAGE_ID, result.is_ok())?;

    result
}

fn write_record(data: &mut [u8], index_name: &str, root_page_id: PageId) -> Result<(), BTreeError> {
    let mut record = decode_record(data)?;
    record.insert(index_name.to_string(), root_page_id);

    let bytes =
        bincode::serialize(&record).map_err(|e| BTreeError::SerializationError(e.to_string()))?;
    if bytes.len() > PAGE_SIZE {
        return Err(BTreeError::NodeTooLarge);
    }
    data.fill(0);
    data[..bytes.len()].copy_from_slice(&bytes);
    Ok(())
}

// A freshly zeroed header page decodes as an empty record
fn decode_record(data: &[u8]) -> Result<RootRecord, BTreeError> {
    bincode::deserialize(data).map_err(|e| BTreeError::DeserializationError(e.to_string()))
}
