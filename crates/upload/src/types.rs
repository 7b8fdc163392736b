use std::num::NonZeroUsize;

use pagesync_balancer::RetryPolicy;
use pagesync_transfer::{ByteRange, EstimatorConfig, ProgressRecord, ReconcileOptions};

use crate::error::UploadError;

/// Tunables for one upload session.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadOptions {
    /// Number of concurrent upload workers.
    pub parallelism: usize,
    /// Request queue depth between the chunk reader and the workers.
    pub queue_capacity: usize,
    pub reconcile: ReconcileOptions,
    pub retry: RetryPolicy,
    pub estimator: EstimatorConfig,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            queue_capacity: 0,
            reconcile: ReconcileOptions::default(),
            retry: RetryPolicy::default(),
            estimator: EstimatorConfig::default(),
        }
    }
}

/// Eight workers per available CPU.
pub fn default_parallelism() -> usize {
    8 * std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

/// A range that could not be written after all attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRange {
    pub range: ByteRange,
    pub attempts: u32,
    pub error: String,
}

/// Outcome of an upload session that ran to the end.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub success: bool,
    pub failed: Vec<FailedRange>,
    /// Bytes written to the destination during this session.
    pub bytes_transferred: u64,
    /// Progress snapshot taken when the session stopped.
    pub progress: ProgressRecord,
}

impl SessionResult {
    /// Converts a session with failed ranges into [`UploadError::Incomplete`].
    pub fn into_result(self) -> Result<Self, UploadError> {
        if self.success {
            Ok(self)
        } else {
            Err(UploadError::Incomplete {
                failed: self.failed.iter().map(|f| f.range.id()).collect(),
            })
        }
    }
}

/// Events emitted during a session.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    /// Work list computed; nothing has been sent yet.
    Planned {
        image_size: u64,
        effective_bytes: u64,
        ranges: usize,
    },
    Progress(ProgressRecord),
    RangeFailed(FailedRange),
    Finished {
        outcome: SessionOutcome,
        bytes_transferred: u64,
        /// Percent of the image present at the destination when the session
        /// stopped.
        percent_complete: f64,
    },
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    /// Some ranges were not written; re-running sends them.
    Incomplete { failed: usize },
    /// Reading the source image failed and the session was aborted.
    SourceFailed,
}

impl SessionOutcome {
    pub fn is_success(self) -> bool {
        self == Self::Completed
    }
}
