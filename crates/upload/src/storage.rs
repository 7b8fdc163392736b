//! Destination storage contract.
//!
//! `PageStorage` is implemented by each backend. Using a trait keeps the
//! session logic decoupled from any particular service and testable with
//! in-memory or fault-injecting stores.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use pagesync_transfer::{ByteRange, DEFAULT_PAGE_SIZE, RangeSet};

use crate::error::StorageError;

/// Future returned by [`PageStorage`] operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// State of the destination object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectProperties {
    pub size: u64,
    pub metadata: HashMap<String, String>,
    /// Final content hash, set only after a completed upload.
    pub content_hash: Option<String>,
}

/// One page of an existing-range listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangePage {
    pub ranges: Vec<ByteRange>,
    /// Continuation marker; `None` on the last page.
    pub next_marker: Option<String>,
}

/// A single page-addressed destination object.
pub trait PageStorage: Send + Sync {
    /// Smallest writable unit.
    fn page_size(&self) -> u64 {
        DEFAULT_PAGE_SIZE
    }

    /// Returns the object's properties, or `None` if it does not exist.
    fn properties(&self) -> StorageFuture<'_, Option<ObjectProperties>>;

    /// Creates a zero-filled object of `size` bytes, replacing any existing one.
    fn create_object(&self, size: u64, metadata: HashMap<String, String>)
    -> StorageFuture<'_, ()>;

    /// Lists ranges already written, one page at a time.
    fn list_existing_ranges(&self, marker: Option<String>) -> StorageFuture<'_, RangePage>;

    /// Writes `data` at `range`. Resolves only once the write is durable.
    fn write_pages<'a>(&'a self, range: ByteRange, data: &'a [u8]) -> StorageFuture<'a, ()>;

    /// Records the final content hash of a completed upload.
    fn set_content_hash(&self, hash: String) -> StorageFuture<'_, ()>;
}

/// Follows continuation markers until the listing is exhausted.
pub async fn list_all_ranges(storage: &dyn PageStorage) -> Result<RangeSet, StorageError> {
    let mut ranges = RangeSet::new();
    let mut marker = None;
    loop {
        let page = storage.list_existing_ranges(marker.take()).await?;
        for range in page.ranges {
            ranges.insert(range);
        }
        match page.next_marker {
            Some(next) if !next.is_empty() => marker = Some(next),
            _ => return Ok(ranges),
        }
    }
}

/// Checks a page write against the object's geometry.
pub(crate) fn check_write(
    range: &ByteRange,
    data: &[u8],
    page_size: u64,
    object_size: u64,
) -> Result<(), StorageError> {
    if !range.is_aligned(page_size) {
        return Err(StorageError::Unaligned {
            range: *range,
            page_size,
        });
    }
    if range.end() >= object_size {
        return Err(StorageError::OutOfBounds {
            range: *range,
            size: object_size,
        });
    }
    if data.len() as u64 != range.length() {
        return Err(StorageError::Rejected(format!(
            "payload of {} bytes does not match range {range}",
            data.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> ByteRange {
        ByteRange::new(start, end).unwrap()
    }

    #[test]
    fn write_checks() {
        let page = vec![0u8; 512];
        assert!(check_write(&r(0, 511), &page, 512, 1024).is_ok());
        assert!(matches!(
            check_write(&r(1, 512), &page, 512, 1024),
            Err(StorageError::Unaligned { .. })
        ));
        assert!(matches!(
            check_write(&r(1024, 1535), &page, 512, 1024),
            Err(StorageError::OutOfBounds { size: 1024, .. })
        ));
        assert!(matches!(
            check_write(&r(0, 1023), &page, 512, 2048),
            Err(StorageError::Rejected(_))
        ));
    }
}
