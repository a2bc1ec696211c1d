//! Bounded in-memory byte pipe with error propagation.
//!
//! A thin layer over [`tokio::io::duplex`]: writes block once `capacity`
//! bytes are in flight, so a producer can never run ahead of its consumer.
//! On top of that the writer must explicitly [`finish`](PipeWriter::finish)
//! the stream. If it [`fail`](PipeWriter::fail)s or is dropped first, the
//! reader reports an error instead of a clean end of stream, so a
//! half-transferred payload is never mistaken for a complete one.
//!
//! Dropping the reader makes further writes fail with `BrokenPipe`, which
//! unblocks a producer whose consumer went away.

use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

/// Default pipe capacity used by sync transfers.
pub const DEFAULT_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
enum Completion {
    #[default]
    Open,
    Finished,
    Failed(String),
}

type Shared = Arc<Mutex<Completion>>;

fn set(shared: &Shared, value: Completion) {
    let mut guard = shared.lock().unwrap_or_else(PoisonError::into_inner);
    if matches!(*guard, Completion::Open) {
        *guard = value;
    }
}

/// Create a pipe holding at most `capacity` bytes in flight.
#[must_use]
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = tokio::io::duplex(capacity.max(1));
    let shared = Shared::default();
    (
        PipeWriter {
            inner: tx,
            shared: Arc::clone(&shared),
        },
        PipeReader { inner: rx, shared },
    )
}

/// Write half of a [`pipe`].
#[derive(Debug)]
pub struct PipeWriter {
    inner: DuplexStream,
    shared: Shared,
}

impl PipeWriter {
    /// Mark the stream complete and close it. The reader then sees a clean
    /// end of stream once it has drained the buffer.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of the final shutdown.
    pub async fn finish(mut self) -> io::Result<()> {
        set(&self.shared, Completion::Finished);
        self.inner.shutdown().await
    }

    /// Close the stream with an error. The reader reports `reason` after
    /// draining whatever was already written.
    pub fn fail(self, reason: impl Into<String>) {
        set(&self.shared, Completion::Failed(reason.into()));
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read half of a [`pipe`].
#[derive(Debug)]
pub struct PipeReader {
    inner: DuplexStream,
    shared: Shared,
}

impl AsyncRead for PipeReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        ready!(Pin::new(&mut self.inner).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let state = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            Completion::Finished => Poll::Ready(Ok(())),
            Completion::Failed(reason) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                reason.clone(),
            ))),
            Completion::Open => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pipe writer closed before finishing",
            ))),
        }
    }
}
