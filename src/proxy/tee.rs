// Tee pipe - duplicates the upstream body into the client stream and an observer
//
// The client-facing `TeeBody` pulls a chunk from upstream, hands a copy to the
// observer through a bounded channel, and only then yields the chunk to the
// client. A full channel parks the client read (backpressure); a vanished
// observer never stalls the client, the tee just stops copying.
//
//   upstream ──► TeeBody ──► client
//                   │
//                   └──► PipeWriter ═══► PipeReader ──► StreamObserver

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::PollSender;

use super::types::BodyStream;

/// Default pipe depth, in chunks
pub const DEFAULT_PIPE_CAPACITY: usize = 32;

/// Create a connected pipe holding at most `capacity` chunks in flight
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        PipeWriter {
            tx: Some(PollSender::new(tx)),
        },
        PipeReader {
            inner: ReceiverStream::new(rx),
        },
    )
}

/// The reading side went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeClosed;

// ─────────────────────────────────────────────────────────────────────────────
// Pipe ends
// ─────────────────────────────────────────────────────────────────────────────

/// Write end of the pipe, owned by the tee
pub struct PipeWriter {
    tx: Option<PollSender<Bytes>>,
}

impl PipeWriter {
    /// Deliver one chunk, parking the task while the pipe is full
    pub fn poll_write(&mut self, cx: &mut Context<'_>, chunk: &Bytes) -> Poll<Result<(), PipeClosed>> {
        let delivered = match self.tx.as_mut() {
            None => return Poll::Ready(Err(PipeClosed)),
            Some(tx) => match ready!(tx.poll_reserve(cx)) {
                Ok(()) => tx.send_item(chunk.clone()).is_ok(),
                Err(_) => false,
            },
        };

        if delivered {
            Poll::Ready(Ok(()))
        } else {
            self.tx = None;
            Poll::Ready(Err(PipeClosed))
        }
    }

    pub fn is_open(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Signal end-of-data to the reader. Safe to call repeatedly.
    pub fn close(&mut self) {
        if let Some(mut tx) = self.tx.take() {
            tx.close();
        }
    }
}

/// Read end of the pipe, owned by the observer task
pub struct PipeReader {
    inner: ReceiverStream<Bytes>,
}

impl PipeReader {
    /// Stop accepting chunks; the writer sees `PipeClosed` on its next write
    pub fn close(&mut self) {
        self.inner.close();
    }
}

impl Stream for PipeReader {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TeeBody
// ─────────────────────────────────────────────────────────────────────────────

/// What the client side saw, reported once when the tee closes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeeSummary {
    pub bytes: u64,
    pub reached_eof: bool,
}

type CloseCallback = Box<dyn FnOnce(TeeSummary) + Send>;

/// Client-facing body that mirrors every chunk into a pipe
pub struct TeeBody {
    upstream: BodyStream,
    writer: PipeWriter,
    /// Chunk read from upstream, waiting for pipe capacity
    pending: Option<Bytes>,
    relayed: u64,
    reached_eof: bool,
    /// Upstream failed; a later end-of-stream is not a clean EOF
    errored: bool,
    closed: bool,
    on_close: Option<CloseCallback>,
}

impl TeeBody {
    pub fn new(upstream: BodyStream, writer: PipeWriter) -> Self {
        Self {
            upstream,
            writer,
            pending: None,
            relayed: 0,
            reached_eof: false,
            errored: false,
            closed: false,
            on_close: None,
        }
    }

    /// Run `callback` exactly once when the body is closed or dropped
    pub fn on_close(mut self, callback: impl FnOnce(TeeSummary) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(callback));
        self
    }

    /// Close the pipe, report the summary and release upstream.
    ///
    /// Idempotent; also runs on drop, so a client hanging up mid-stream still
    /// terminates the observer.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.writer.close();
        self.pending = None;
        self.upstream = stream::empty().boxed();

        if let Some(callback) = self.on_close.take() {
            callback(TeeSummary {
                bytes: self.relayed,
                reached_eof: self.reached_eof,
            });
        }
    }

    fn emit(&mut self, chunk: Bytes) -> Poll<Option<io::Result<Bytes>>> {
        self.relayed += chunk.len() as u64;
        Poll::Ready(Some(Ok(chunk)))
    }
}

impl Stream for TeeBody {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(None);
        }

        if let Some(chunk) = this.pending.as_ref() {
            if this.writer.is_open() {
                if let Err(PipeClosed) = ready!(this.writer.poll_write(cx, chunk)) {
                    tracing::debug!("Observer released the pipe, relaying without capture");
                }
            }
            let Some(chunk) = this.pending.take() else {
                return Poll::Ready(None);
            };
            return this.emit(chunk);
        }

        match ready!(this.upstream.poll_next_unpin(cx)) {
            Some(Ok(chunk)) if chunk.is_empty() || !this.writer.is_open() => this.emit(chunk),
            Some(Ok(chunk)) => {
                this.pending = Some(chunk);
                // Re-enter to push the chunk into the pipe
                Pin::new(this).poll_next(cx)
            }
            Some(Err(e)) => {
                tracing::warn!(bytes = this.relayed, "Upstream body failed mid-stream: {}", e);
                // Observer must not wait forever on a dead upstream
                this.errored = true;
                this.writer.close();
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.reached_eof = !this.errored;
                this.close();
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TeeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeBody")
            .field("relayed", &self.relayed)
            .field("reached_eof", &self.reached_eof)
            .field("errored", &self.errored)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
