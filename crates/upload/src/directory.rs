//! Local-directory page store.
//!
//! The object is a sparse file named after the object; a JSON sidecar next to
//! it records metadata, the final content hash and every written range, so a
//! later process can resume where this one stopped.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use pagesync_transfer::{ByteRange, DEFAULT_PAGE_SIZE, RangeSet};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::storage::{ObjectProperties, PageStorage, RangePage, StorageFuture, check_write};

const SIDECAR_SUFFIX: &str = ".pagesync.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Sidecar {
    size: u64,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    content_hash: Option<String>,
    #[serde(default)]
    written: RangeSet,
}

/// Page object stored as a file inside a local directory.
#[derive(Debug)]
pub struct DirectoryPageStore {
    data_path: PathBuf,
    sidecar_path: PathBuf,
    page_size: u64,
    state: Mutex<Option<Sidecar>>,
}

impl DirectoryPageStore {
    /// Opens object `name` inside `dir`, loading its sidecar if present.
    pub async fn open(dir: &Path, name: &str) -> Result<Self, StorageError> {
        let data_path = dir.join(name);
        let sidecar_path = dir.join(format!("{name}{SIDECAR_SUFFIX}"));

        let state = match tokio::fs::read(&sidecar_path).await {
            Ok(bytes) => {
                let sidecar: Sidecar = serde_json::from_slice(&bytes)?;
                if tokio::fs::try_exists(&data_path).await? {
                    Some(sidecar)
                } else {
                    debug!(path = %sidecar_path.display(), "sidecar without data file, ignoring");
                    None
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            data_path,
            sidecar_path,
            page_size: DEFAULT_PAGE_SIZE,
            state: Mutex::new(state),
        })
    }

    /// Sets the write granularity (at least one byte).
    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Path of the object's data file.
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    async fn persist(&self, sidecar: &Sidecar) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(sidecar)?;
        let tmp = self.sidecar_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.sidecar_path).await?;
        Ok(())
    }
}

impl PageStorage for DirectoryPageStore {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn properties(&self) -> StorageFuture<'_, Option<ObjectProperties>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.as_ref().map(|s| ObjectProperties {
                size: s.size,
                metadata: s.metadata.clone(),
                content_hash: s.content_hash.clone(),
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
            let mut state = self.state.lock().await;
            if let Some(parent) = self.data_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let file = tokio::fs::File::create(&self.data_path).await?;
            file.set_len(size).await?;
            file.sync_all().await?;

            let sidecar = Sidecar {
                size,
                metadata,
                content_hash: None,
                written: RangeSet::new(),
            };
            self.persist(&sidecar).await?;
            *state = Some(sidecar);
            debug!(path = %self.data_path.display(), size, "object created");
            Ok(())
        })
    }

    fn list_existing_ranges(&self, _marker: Option<String>) -> StorageFuture<'_, RangePage> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let sidecar = state.as_ref().ok_or(StorageError::NotFound)?;
            Ok(RangePage {
                ranges: sidecar.written.iter().copied().collect(),
                next_marker: None,
            })
        })
    }

    fn write_pages<'a>(&'a self, range: ByteRange, data: &'a [u8]) -> StorageFuture<'a, ()> {
        Box::pin(async move {
            let size = {
                let state = self.state.lock().await;
                state.as_ref().ok_or(StorageError::NotFound)?.size
            };
            check_write(&range, data, self.page_size, size)?;

            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .open(&self.data_path)
                .await?;
            file.seek(SeekFrom::Start(range.start())).await?;
            file.write_all(data).await?;
            file.sync_data().await?;

            // The range is recorded only after the data is on disk.
            let mut state = self.state.lock().await;
            let sidecar = state.as_mut().ok_or(StorageError::NotFound)?;
            sidecar.written.insert(range);
            self.persist(sidecar).await
        })
    }

    fn set_content_hash(&self, hash: String) -> StorageFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let sidecar = state.as_mut().ok_or(StorageError::NotFound)?;
            sidecar.content_hash = Some(hash);
            self.persist(sidecar).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(start: u64, end: u64) -> ByteRange {
        ByteRange::new(start, end).unwrap()
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let metadata = HashMap::from([("k".to_string(), "v".to_string())]);

        let store = DirectoryPageStore::open(dir.path(), "disk.img").await.unwrap();
        assert_eq!(store.properties().await.unwrap(), None);
        store.create_object(4096, metadata.clone()).await.unwrap();
        store.write_pages(r(1024, 2047), &[5; 1024]).await.unwrap();
        drop(store);

        let reopened = DirectoryPageStore::open(dir.path(), "disk.img").await.unwrap();
        let props = reopened.properties().await.unwrap().unwrap();
        assert_eq!(props.size, 4096);
        assert_eq!(props.metadata, metadata);
        let page = reopened.list_existing_ranges(None).await.unwrap();
        assert_eq!(page.ranges, vec![r(1024, 2047)]);
        assert_eq!(page.next_marker, None);

        let data = std::fs::read(reopened.data_path()).unwrap();
        assert_eq!(data.len(), 4096);
        assert!(data[1024..2048].iter().all(|&b| b == 5));
        assert!(data[..1024].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn content_hash_is_persisted() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = DirectoryPageStore::open(dir.path(), "disk.img").await.unwrap();
        store.create_object(512, HashMap::new()).await.unwrap();
        store.set_content_hash("deadbeef".into()).await.unwrap();

        let reopened = DirectoryPageStore::open(dir.path(), "disk.img").await.unwrap();
        let props = reopened.properties().await.unwrap().unwrap();
        assert_eq!(props.content_hash.as_deref(), Some("deadbeef"));
    }

    #[tokio::test]
    async fn configured_page_size_governs_layout_and_writes() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = DirectoryPageStore::open(dir.path(), "disk.img")
            .await
            .unwrap()
            .with_page_size(4096);
        assert_eq!(store.page_size(), 4096);

        assert!(store.create_object(6144, HashMap::new()).await.is_err());
        store.create_object(8192, HashMap::new()).await.unwrap();
        let err = store.write_pages(r(512, 1023), &[1; 512]).await.unwrap_err();
        assert!(matches!(err, StorageError::Unaligned { page_size: 4096, .. }));
        store.write_pages(r(4096, 8191), &[2; 4096]).await.unwrap();
    }

    #[tokio::test]
    async fn rejects_unaligned_write() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = DirectoryPageStore::open(dir.path(), "disk.img").await.unwrap();
        store.create_object(2048, HashMap::new()).await.unwrap();
        let err = store.write_pages(r(100, 611), &[1; 512]).await.unwrap_err();
        assert!(matches!(err, StorageError::Unaligned { .. }));
    }
}
