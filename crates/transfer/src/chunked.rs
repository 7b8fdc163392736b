use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::reconcile::read_range;
use crate::types::Chunk;
use crate::{ByteRange, TransferError};

/// Seekable byte source exposing its logical size.
pub trait ImageSource: Read + Seek + Send + 'static {
    /// Total logical size of the image in bytes.
    fn size(&self) -> u64;
}

impl ImageSource for Cursor<Vec<u8>> {
    fn size(&self) -> u64 {
        self.get_ref().len() as u64
    }
}

// ---------------------------------------------------------------------------
// FileImage
// ---------------------------------------------------------------------------

/// A raw image file read as-is.
#[derive(Debug)]
pub struct FileImage {
    file: File,
    size: u64,
}

impl FileImage {
    /// Opens `path` for reading.
    pub fn open(path: &Path) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl Read for FileImage {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for FileImage {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl ImageSource for FileImage {
    fn size(&self) -> u64 {
        self.size
    }
}

// ---------------------------------------------------------------------------
// stream_chunks
// ---------------------------------------------------------------------------

/// The two outcome channels of [`stream_chunks`].
///
/// `chunks` closes after the last range or after a failure. A failure is
/// delivered on `errors` before `chunks` closes; if `errors` resolves to a
/// `RecvError` the producer finished cleanly.
#[derive(Debug)]
pub struct ChunkStream {
    pub chunks: mpsc::Receiver<Chunk>,
    pub errors: oneshot::Receiver<TransferError>,
}

/// Reads `ranges` from `source` in order on a blocking thread.
///
/// At most one chunk is buffered ahead of the consumer, so memory use is
/// bounded by how fast the receiver drains. The producer stops at the first
/// seek or read failure without emitting a partial chunk, and exits early if
/// the receiver is dropped.
///
/// Must be called from within a tokio runtime.
pub fn stream_chunks<S: ImageSource>(mut source: S, ranges: Vec<ByteRange>) -> ChunkStream {
    let (chunk_tx, chunk_rx) = mpsc::channel(1);
    let (err_tx, err_rx) = oneshot::channel();

    tokio::task::spawn_blocking(move || {
        let total = ranges.len();
        for (index, range) in ranges.into_iter().enumerate() {
            let mut data = vec![0u8; range.length() as usize];
            if let Err(e) = read_range(&mut source, &range, &mut data) {
                warn!(range = %range, error = %e, "source read failed");
                let _ = err_tx.send(e);
                return;
            }
            if chunk_tx.blocking_send(Chunk { range, data }).is_err() {
                debug!(sent = index, total, "chunk receiver dropped, stopping reader");
                return;
            }
        }
        debug!(total, "all chunks read");
    });

    ChunkStream {
        chunks: chunk_rx,
        errors: err_rx,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn r(start: u64, end: u64) -> ByteRange {
        ByteRange::new(start, end).unwrap()
    }

    /// Fails every read past `limit`.
    struct Truncated {
        inner: Cursor<Vec<u8>>,
        limit: u64,
    }

    impl Read for Truncated {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.inner.position() >= self.limit {
                return Err(io::Error::other("device error"));
            }
            self.inner.read(buf)
        }
    }

    impl Seek for Truncated {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    impl ImageSource for Truncated {
        fn size(&self) -> u64 {
            self.inner.get_ref().len() as u64
        }
    }

    #[test]
    fn file_image_reports_size() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[1u8; 2048])
            .unwrap();

        let image = FileImage::open(&path).unwrap();
        assert_eq!(image.size(), 2048);
    }

    #[tokio::test]
    async fn chunks_follow_range_order() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let source = Cursor::new(data.clone());
        let ranges = vec![r(2048, 3071), r(0, 511), r(3584, 4095)];

        let mut stream = stream_chunks(source, ranges.clone());
        let mut seen = Vec::new();
        while let Some(chunk) = stream.chunks.recv().await {
            let start = chunk.range.start() as usize;
            assert_eq!(chunk.data, &data[start..start + chunk.data.len()]);
            seen.push(chunk.range);
        }
        assert_eq!(seen, ranges);
        assert!(stream.errors.await.is_err(), "clean finish must not report an error");
    }

    #[tokio::test]
    async fn read_failure_stops_stream_without_partial_chunk() {
        let source = Truncated {
            inner: Cursor::new(vec![9u8; 4096]),
            limit: 1024,
        };
        let ranges = vec![r(0, 1023), r(1024, 2047), r(2048, 3071)];

        let mut stream = stream_chunks(source, ranges);
        let mut seen = Vec::new();
        while let Some(chunk) = stream.chunks.recv().await {
            seen.push(chunk.range);
        }
        assert_eq!(seen, vec![r(0, 1023)]);
        let err = stream.errors.await.unwrap();
        assert!(matches!(err, TransferError::SourceRead { offset: 1024, .. }));
    }

    #[tokio::test]
    async fn dropping_receiver_stops_producer() {
        let source = Cursor::new(vec![1u8; 64 * 1024]);
        let ranges = (0..64).map(|i| r(i * 1024, i * 1024 + 1023)).collect();

        let mut stream = stream_chunks(source, ranges);
        let first = stream.chunks.recv().await.unwrap();
        assert_eq!(first.range, r(0, 1023));
        drop(stream.chunks);
        // Producer exits without error once it notices the closed channel.
        assert!(stream.errors.await.is_err());
    }
}
