//! Upload error types.

use pagesync_transfer::{ByteRange, TransferError};

use crate::metadata::MetadataMismatch;

/// Errors returned by a [`PageStorage`](crate::PageStorage) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("object not found")]
    NotFound,

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("write {range} is not aligned to {page_size} byte pages")]
    Unaligned { range: ByteRange, page_size: u64 },

    #[error("write {range} exceeds object size {size}")]
    OutOfBounds { range: ByteRange, size: u64 },

    #[error("invalid object metadata: {0}")]
    InvalidMetadata(String),
}

impl StorageError {
    /// Whether a failed write may succeed if sent again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Rejected(_))
    }
}

/// Errors that end an upload session.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("source read failed: {0}")]
    SourceRead(#[source] TransferError),

    #[error("transfer error: {0}")]
    Transfer(TransferError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(
        "destination metadata does not match the local image ({}); use overwrite to upload from scratch",
        join_mismatches(.0)
    )]
    Precheck(Vec<MetadataMismatch>),

    #[error("destination already holds a completed upload; use overwrite to replace it")]
    AlreadyUploaded,

    #[error("destination exists without upload metadata; use overwrite to replace it")]
    MissingResumeMetadata,

    #[error(
        "upload incomplete: {} range(s) failed; re-run to upload the remaining ranges",
        .failed.len()
    )]
    Incomplete { failed: Vec<String> },

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<TransferError> for UploadError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::SourceRead { .. } | TransferError::Io(_) => Self::SourceRead(e),
            other => Self::Transfer(other),
        }
    }
}

fn join_mismatches(mismatches: &[MetadataMismatch]) -> String {
    mismatches
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
