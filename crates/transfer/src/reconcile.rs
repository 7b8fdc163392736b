//! Work-list computation.
//!
//! `reconcile` runs two stages:
//! 1. **Locate**: partition `[0, image_size)` on the chunk grid and carve out
//!    the skip set (ranges already present at the destination).
//! 2. **Detect empty**: read every candidate and drop the all-zero ones.

use std::io::{Read, Seek, SeekFrom};

use tracing::debug;

use crate::types::is_zeroed;
use crate::{ByteRange, DEFAULT_CHUNK_SIZE, DEFAULT_PAGE_SIZE, RangeSet, TransferError};

/// Page and chunk geometry for reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Smallest writable unit of the destination.
    pub page_size: u64,
    /// Upper bound on a single work item; rounded up to a page multiple.
    pub chunk_size: u64,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ReconcileOptions {
    /// Validates the geometry against `image_size` and returns the effective
    /// chunk granularity.
    fn granularity(&self, image_size: u64) -> Result<u64, TransferError> {
        if self.page_size == 0 {
            return Err(TransferError::InvalidLayout("page size must be > 0".into()));
        }
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidLayout("chunk size must be > 0".into()));
        }
        if image_size % self.page_size != 0 {
            return Err(TransferError::InvalidLayout(format!(
                "image size {image_size} is not a multiple of the {} byte page size",
                self.page_size
            )));
        }
        Ok(self.chunk_size.div_ceil(self.page_size) * self.page_size)
    }
}

/// The reconciled work list for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPlan {
    image_size: u64,
    ranges: Vec<ByteRange>,
}

impl UploadPlan {
    /// Logical size of the source image.
    pub fn image_size(&self) -> u64 {
        self.image_size
    }

    /// Ranges to transmit, ascending by start offset.
    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    /// Bytes actually scheduled for transfer.
    pub fn effective_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::length).sum()
    }

    /// Bytes that need no transfer: already present remotely or all zero.
    pub fn already_processed(&self) -> u64 {
        self.image_size.saturating_sub(self.effective_bytes())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

/// Splits `[0, image_size)` into consecutive page-aligned chunks.
pub fn partition(
    image_size: u64,
    options: &ReconcileOptions,
) -> Result<Vec<ByteRange>, TransferError> {
    let granularity = options.granularity(image_size)?;
    let mut chunks = Vec::with_capacity(image_size.div_ceil(granularity) as usize);
    let mut start = 0;
    while start < image_size {
        let len = granularity.min(image_size - start);
        chunks.push(ByteRange::with_length(start, len)?);
        start += len;
    }
    Ok(chunks)
}

/// Partitions the image and removes every byte covered by `skip`.
///
/// Pieces left over inside a chunk are widened to page boundaries (never past
/// the chunk) and merged, so every returned range is page-aligned and no
/// larger than the chunk granularity.
pub fn locate_uploadable_ranges(
    image_size: u64,
    skip: &RangeSet,
    options: &ReconcileOptions,
) -> Result<Vec<ByteRange>, TransferError> {
    let mut out = Vec::new();
    let mut pieces = Vec::new();
    for cell in partition(image_size, options)? {
        pieces.clear();
        skip.carve(cell, &mut pieces);
        let aligned = pieces
            .iter()
            .map(|p| p.align_within(options.page_size, &cell))
            .collect::<RangeSet>();
        out.extend(aligned.iter().copied());
    }
    Ok(out)
}

/// Reads each candidate range and drops those whose bytes are all zero.
///
/// Any seek or read failure aborts the pass.
pub fn detect_empty_ranges<S: Read + Seek>(
    source: &mut S,
    ranges: Vec<ByteRange>,
) -> Result<Vec<ByteRange>, TransferError> {
    let mut buf = Vec::new();
    let mut kept = Vec::with_capacity(ranges.len());
    for range in ranges {
        buf.resize(range.length() as usize, 0);
        read_range(source, &range, &mut buf)?;
        if is_zeroed(&buf) {
            debug!(range = %range, "skipping empty range");
        } else {
            kept.push(range);
        }
    }
    Ok(kept)
}

/// Computes the minimal page-aligned work list for one session.
pub fn reconcile<S: Read + Seek>(
    source: &mut S,
    image_size: u64,
    skip: &RangeSet,
    options: &ReconcileOptions,
) -> Result<UploadPlan, TransferError> {
    let candidates = locate_uploadable_ranges(image_size, skip, options)?;
    let candidate_count = candidates.len();
    let ranges = detect_empty_ranges(source, candidates)?;
    debug!(
        image_size,
        skipped = skip.total_length(),
        candidates = candidate_count,
        uploadable = ranges.len(),
        "reconciled upload ranges"
    );
    Ok(UploadPlan { image_size, ranges })
}

/// Seeks to `range.start()` and fills `buf` (sized to the range).
pub(crate) fn read_range<S: Read + Seek>(
    source: &mut S,
    range: &ByteRange,
    buf: &mut [u8],
) -> Result<(), TransferError> {
    let offset = range.start();
    source
        .seek(SeekFrom::Start(offset))
        .map_err(|source| TransferError::SourceRead { offset, source })?;
    source
        .read_exact(buf)
        .map_err(|source| TransferError::SourceRead { offset, source })
}
