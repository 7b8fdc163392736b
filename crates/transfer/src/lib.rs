//! Resumable page-aligned transfer primitives.
//!
//! - [`ByteRange`] / [`RangeSet`]: inclusive offset algebra
//! - [`reconcile`]: compute the work list from image size, skip set and content
//! - [`stream_chunks`]: sequential range reader feeding the upload pipeline
//! - [`ProgressEstimator`]: moving-average throughput and ETA ticker

mod buffer;
mod chunked;
mod progress;
mod range;
mod reconcile;
mod types;

pub use chunked::{ChunkStream, FileImage, ImageSource, stream_chunks};
pub use progress::{
    EstimatorConfig, ProgressEstimator, ProgressRecord, ProgressReporter, SpeedCalculator,
};
pub use range::{ByteRange, RangeSet};
pub use reconcile::{
    ReconcileOptions, UploadPlan, detect_empty_ranges, locate_uploadable_ranges, partition,
    reconcile,
};
pub use types::Chunk;

/// Default destination page size: 512 bytes.
pub const DEFAULT_PAGE_SIZE: u64 = 512;

/// Default chunk granularity: 4 MiB.
///
/// Matches the largest single page write most block stores accept.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source read failed at offset {offset}: {source}")]
    SourceRead {
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid range: start {start} > end {end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("invalid layout: {0}")]
    InvalidLayout(String),
}
