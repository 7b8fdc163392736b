use std::fmt;

use serde::{Deserialize, Serialize};

use crate::TransferError;

/// An inclusive `[start, end]` byte range into the logical image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct ByteRange {
    start: u64,
    end: u64,
}

#[derive(Deserialize)]
struct RawRange {
    start: u64,
    end: u64,
}

impl TryFrom<RawRange> for ByteRange {
    type Error = TransferError;

    fn try_from(raw: RawRange) -> Result<Self, Self::Error> {
        ByteRange::new(raw.start, raw.end)
    }
}

impl ByteRange {
    /// Creates a range covering `start..=end`.
    pub fn new(start: u64, end: u64) -> Result<Self, TransferError> {
        if start > end {
            return Err(TransferError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// Creates a range of `length` bytes beginning at `start`.
    pub fn with_length(start: u64, length: u64) -> Result<Self, TransferError> {
        let end = length
            .checked_sub(1)
            .and_then(|l| start.checked_add(l))
            .ok_or(TransferError::InvalidRange {
                start,
                end: start.wrapping_add(length).wrapping_sub(1),
            })?;
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered (`end - start + 1`).
    pub fn length(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Returns `true` if both ranges share at least one byte.
    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Returns `true` if the ranges overlap or sit back to back.
    pub fn touches(&self, other: &ByteRange) -> bool {
        self.overlaps(other)
            || self.end.checked_add(1) == Some(other.start)
            || other.end.checked_add(1) == Some(self.start)
    }

    /// Returns `true` if `other` lies entirely within this range.
    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Returns `true` if the range starts and ends on `page_size` boundaries.
    pub fn is_aligned(&self, page_size: u64) -> bool {
        page_size > 0
            && self.start % page_size == 0
            && self.end.wrapping_add(1) % page_size == 0
    }

    /// Widens the range to the enclosing `page_size` boundaries, clamped to `bounds`.
    pub(crate) fn align_within(&self, page_size: u64, bounds: &ByteRange) -> ByteRange {
        let start = (self.start / page_size) * page_size;
        let end = (self.end / page_size)
            .saturating_add(1)
            .saturating_mul(page_size)
            .saturating_sub(1);
        ByteRange {
            start: start.max(bounds.start),
            end: end.min(bounds.end),
        }
    }

    /// Identifier used for request IDs and log fields.
    pub fn id(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

// ---------------------------------------------------------------------------
// RangeSet
// ---------------------------------------------------------------------------

/// Ordered, non-overlapping, coalesced sequence of [`ByteRange`]s.
///
/// Construction sorts its input and merges every pair of ranges that overlap
/// or touch, so two stored ranges always have a gap of at least one byte.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<ByteRange>", into = "Vec<ByteRange>")]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a normalized set from arbitrary (possibly overlapping) ranges.
    pub fn from_ranges<I: IntoIterator<Item = ByteRange>>(ranges: I) -> Self {
        let mut sorted: Vec<ByteRange> = ranges.into_iter().collect();
        sorted.sort_unstable();

        let mut merged: Vec<ByteRange> = Vec::with_capacity(sorted.len());
        for r in sorted {
            match merged.last_mut() {
                Some(last) if last.touches(&r) => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        Self { ranges: merged }
    }

    /// Adds a range, coalescing it with its neighbours.
    pub fn insert(&mut self, range: ByteRange) {
        let idx = self.ranges.partition_point(|r| r.end < range.start);
        let mut merged = range;
        let mut last = idx;
        while last < self.ranges.len() && self.ranges[last].touches(&merged) {
            merged.start = merged.start.min(self.ranges[last].start);
            merged.end = merged.end.max(self.ranges[last].end);
            last += 1;
        }
        // A left neighbour ending exactly at `range.start - 1` touches too.
        let first = if idx > 0 && self.ranges[idx - 1].touches(&merged) {
            merged.start = merged.start.min(self.ranges[idx - 1].start);
            idx - 1
        } else {
            idx
        };
        self.ranges.splice(first..last, std::iter::once(merged));
    }

    /// Returns the union of both sets.
    pub fn union(&self, other: &RangeSet) -> RangeSet {
        RangeSet::from_ranges(self.ranges.iter().chain(other.ranges.iter()).copied())
    }

    /// Returns every byte of `self` not covered by `other`.
    pub fn subtract(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::with_capacity(self.ranges.len());
        for r in &self.ranges {
            other.carve(*r, &mut out);
        }
        RangeSet { ranges: out }
    }

    /// Pushes the parts of `range` not covered by this set onto `out`, in order.
    pub(crate) fn carve(&self, range: ByteRange, out: &mut Vec<ByteRange>) {
        let mut cursor = range.start;
        let first = self.ranges.partition_point(|s| s.end < range.start);
        for s in &self.ranges[first..] {
            if s.start > range.end {
                break;
            }
            if s.start > cursor {
                out.push(ByteRange {
                    start: cursor,
                    end: s.start - 1,
                });
            }
            match s.end.checked_add(1) {
                Some(next) if next <= range.end => cursor = next,
                _ => return,
            }
        }
        out.push(ByteRange {
            start: cursor,
            end: range.end,
        });
    }

    /// Returns `true` if every byte of `range` is in the set.
    pub fn covers(&self, range: &ByteRange) -> bool {
        let idx = self.ranges.partition_point(|r| r.end < range.start);
        self.ranges.get(idx).is_some_and(|r| r.contains(range))
    }

    /// Sum of all range lengths.
    pub fn total_length(&self) -> u64 {
        self.ranges.iter().map(ByteRange::length).sum()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ByteRange> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[ByteRange] {
        &self.ranges
    }
}

impl From<Vec<ByteRange>> for RangeSet {
    fn from(ranges: Vec<ByteRange>) -> Self {
        RangeSet::from_ranges(ranges)
    }
}

impl From<RangeSet> for Vec<ByteRange> {
    fn from(set: RangeSet) -> Self {
        set.ranges
    }
}

impl FromIterator<ByteRange> for RangeSet {
    fn from_iter<I: IntoIterator<Item = ByteRange>>(iter: I) -> Self {
        RangeSet::from_ranges(iter)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = &'a ByteRange;
    type IntoIter = std::slice::Iter<'a, ByteRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}
