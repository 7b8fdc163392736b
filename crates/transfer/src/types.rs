use crate::ByteRange;

/// A range of the source image together with its bytes.
///
/// Produced by [`stream_chunks`](crate::stream_chunks) and handed off whole to
/// the single upload request built from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Source range the data was read from.
    pub range: ByteRange,
    /// Exactly `range.length()` bytes.
    pub data: Vec<u8>,
}

/// Returns `true` if `data` contains only zero bytes.
pub(crate) fn is_zeroed(data: &[u8]) -> bool {
    data.iter().all(|&b| b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_detection() {
        assert!(is_zeroed(&[0; 4]));
        assert!(is_zeroed(&[]));
        assert!(!is_zeroed(&[0, 0, 0, 1]));
    }
}
