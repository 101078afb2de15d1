//! Write-once response pipe
//!
//! Response status and content type can only be committed once, so a
//! retrieval that fails *after* its first byte was written cannot be
//! retyped into an error response. Handlers check
//! [`WriterPipe::has_written`] on failure: if bytes already went out, the
//! error is logged silently and the live transfer is left truncated.

use std::io::{self, Write};

use hyper::body::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Largest slice sent to the response body per write, so the live
/// connection receives data as the copy progresses
pub const STREAM_FRAME_SIZE: usize = 64 * 1024;

/// A writer wrapper that remembers whether any bytes have passed through
/// it.
pub struct WriterPipe<W> {
    inner: W,
    has_written: bool,
}

impl<W> WriterPipe<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            has_written: false,
        }
    }

    /// Whether any write has been attempted through this pipe.
    pub fn has_written(&self) -> bool {
        self.has_written
    }

    /// Unwrap the underlying writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for WriterPipe<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.has_written = true;
        self.inner.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Streams bytes written to it into an HTTP response body channel.
///
/// Writes are cut into [`STREAM_FRAME_SIZE`] frames so each one reaches
/// the connection while the copy is still in progress. Once the
/// receiving side is gone, writes fail with `BrokenPipe`, which surfaces
/// to the retrieval as an ordinary write error.
///
/// Sends block the calling thread; use only from a blocking task.
pub struct BodySender {
    tx: mpsc::Sender<Result<Bytes>>,
}

impl BodySender {
    /// Wrap the sending half of a response body channel.
    pub fn new(tx: mpsc::Sender<Result<Bytes>>) -> Self {
        Self { tx }
    }

    /// Recover the channel sender, e.g. to report an error that occurred
    /// before any byte was written.
    pub fn into_sender(self) -> mpsc::Sender<Result<Bytes>> {
        self.tx
    }
}

impl Write for BodySender {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }

        let n = data.len().min(STREAM_FRAME_SIZE);
        self.tx
            .blocking_send(Ok(Bytes::copy_from_slice(&data[..n])))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "response consumer gone"))?;

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
