//! Resumable upload sessions to page-addressed storage.
//!
//! [`ImageUploader`] validates or creates the destination object, then hands
//! the image to the [`UploadOrchestrator`], which reconciles the work list,
//! streams chunks and spreads page writes across a worker pool. Backends
//! implement [`PageStorage`]; [`MemoryPageStore`] and [`DirectoryPageStore`]
//! ship with the crate.

pub mod error;
pub mod metadata;
pub mod storage;
pub mod types;

mod directory;
mod memory;
mod orchestrator;
mod session;

pub use directory::DirectoryPageStore;
pub use error::{StorageError, UploadError};
pub use memory::MemoryPageStore;
pub use metadata::{ImageMetadata, MetadataMismatch, compare_metadata};
pub use orchestrator::{UploadContext, UploadOrchestrator};
pub use session::{ImageUploader, SessionStart};
pub use storage::{ObjectProperties, PageStorage, RangePage, StorageFuture, list_all_ranges};
pub use types::{FailedRange, SessionOutcome, SessionResult, UploadEvent, UploadOptions};
