//! In-memory page store.

use std::collections::HashMap;

use pagesync_transfer::{ByteRange, DEFAULT_PAGE_SIZE, RangeSet};
use tokio::sync::Mutex;

use crate::error::StorageError;
use crate::storage::{ObjectProperties, PageStorage, RangePage, StorageFuture, check_write};

/// Number of ranges returned per listing page by default.
const DEFAULT_LISTING_LEN: usize = 1000;

#[derive(Debug)]
struct MemoryObject {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    content_hash: Option<String>,
    written: RangeSet,
}

/// A single page object held in memory.
#[derive(Debug)]
pub struct MemoryPageStore {
    page_size: u64,
    listing_len: usize,
    object: Mutex<Option<MemoryObject>>,
}

impl Default for MemoryPageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPageStore {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            listing_len: DEFAULT_LISTING_LEN,
            object: Mutex::new(None),
        }
    }

    /// Sets the write granularity (at least one byte).
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Limits how many ranges one listing page returns (at least one).
    pub fn with_listing_len(mut self, len: usize) -> Self {
        self.listing_len = len.max(1);
        self
    }

    /// Copy of the object's bytes, if it exists.
    pub async fn contents(&self) -> Option<Vec<u8>> {
        self.object.lock().await.as_ref().map(|o| o.data.clone())
    }

    /// Ranges written so far.
    pub async fn written_ranges(&self) -> RangeSet {
        self.object
            .lock()
            .await
            .as_ref()
            .map(|o| o.written.clone())
            .unwrap_or_default()
    }
}

impl PageStorage for MemoryPageStore {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn properties(&self) -> StorageFuture<'_, Option<ObjectProperties>> {
        Box::pin(async move {
            let object = self.object.lock().await;
            Ok(object.as_ref().map(|o| ObjectProperties {
                size: o.data.len() as u64,
                metadata: o.metadata.clone(),
                content_hash: o.content_hash.clone(),
            }))
        })
    }

    fn create_object(
        &self,
        size: u64,
        metadata: HashMap<String, String>,
    ) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            if size % self.page_size != 0 {
                return Err(StorageError::Rejected(format!(
                    "object size {size} is not a multiple of {}",
                    self.page_size
                )));
            }
            let len = usize::try_from(size)
                .map_err(|_| StorageError::Rejected(format!("object size {size} too large")))?;
            *self.object.lock().await = Some(MemoryObject {
                data: vec![0; len],
                metadata,
                content_hash: None,
                written: RangeSet::new(),
            });
            Ok(())
        })
    }

    fn list_existing_ranges(&self, marker: Option<String>) -> StorageFuture<'_, RangePage> {
        Box::pin(async move {
            let object = self.object.lock().await;
            let object = object.as_ref().ok_or(StorageError::NotFound)?;
            let offset = match marker.as_deref() {
                None | Some("") => 0,
                Some(m) => m
                    .parse::<usize>()
                    .map_err(|_| StorageError::Rejected(format!("invalid marker {m:?}")))?,
            };
            let all = object.written.as_slice();
            let end = (offset + self.listing_len).min(all.len());
            let ranges = all.get(offset..end).unwrap_or_default().to_vec();
            let next_marker = (end < all.len()).then(|| end.to_string());
            Ok(RangePage {
                ranges,
                next_marker,
            })
        })
    }

    fn write_pages<'a>(&'a self, range: ByteRange, data: &'a [u8]) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let mut object = self.object.lock().await;
            let object = object.as_mut().ok_or(StorageError::NotFound)?;
            check_write(&range, data, self.page_size, object.data.len() as u64)?;
            let start = range.start() as usize;
            object.data[start..start + data.len()].copy_from_slice(data);
            object.written.insert(range);
            Ok(())
        })
    }

    fn set_content_hash(&self, hash: String) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let mut object = self.object.lock().await;
            let object = object.as_mut().ok_or(StorageError::NotFound)?;
            object.content_hash = Some(hash);
            Ok(())
        })
    }
}
