//! Duplex, ordered, framed channel between the host and one worker.
//!
//! An [`Endpoint`] owns both halves of a connection. It can be split so that a
//! reader task drains incoming frames while the owner keeps the write half.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{CodecError, JsonCodec};
use super::protocol::{HostFrame, WorkerFrame};

pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Buffer size of the in-memory pipe backing [`duplex`].
const DUPLEX_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },

    #[error("channel i/o error: {0}")]
    Io(String),
}

impl From<CodecError> for ChannelError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Oversized { len, max } => ChannelError::Oversized { len, max },
            CodecError::Malformed(reason) => ChannelError::Malformed(reason),
            CodecError::Io(reason) => ChannelError::Io(reason),
        }
    }
}

/// Receiving half. Ends (`None`) exactly when the peer closes the connection.
pub struct ChannelReceiver<In> {
    inner: FramedRead<BoxedReader, JsonCodec<In>>,
    done: bool,
}

impl<In: serde::de::DeserializeOwned> ChannelReceiver<In> {
    pub fn new(reader: BoxedReader, max_frame_bytes: usize) -> Self {
        Self {
            inner: FramedRead::new(reader, JsonCodec::with_max_frame_bytes(max_frame_bytes)),
            done: false,
        }
    }

    /// Next message, or `ChannelError::Closed` once the stream has ended.
    pub async fn recv(&mut self) -> Result<In, ChannelError> {
        self.next().await.unwrap_or(Err(ChannelError::Closed))
    }
}

impl<In: serde::de::DeserializeOwned> Stream for ChannelReceiver<In> {
    type Item = Result<In, ChannelError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(Ok(msg)))) => Poll::Ready(Some(Ok(msg))),
            Poll::Ready(Some(Ok(Err(frame_err)))) => Poll::Ready(Some(Err(frame_err.into()))),
            // Stream-level error (torn frame at EOF, broken pipe). FramedRead
            // ends after this, so the channel is closed.
            Poll::Ready(Some(Err(e))) => {
                tracing::debug!(error = %e, "Channel read failed, treating as closed");
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}

/// Sending half.
pub struct ChannelSender<Out> {
    inner: FramedWrite<BoxedWriter, JsonCodec<Out>>,
    closed: bool,
}

impl<Out: serde::Serialize> ChannelSender<Out> {
    pub fn new(writer: BoxedWriter, max_frame_bytes: usize) -> Self {
        Self {
            inner: FramedWrite::new(writer, JsonCodec::with_max_frame_bytes(max_frame_bytes)),
            closed: false,
        }
    }

    /// Send one message and flush it.
    pub async fn send(&mut self, msg: Out) -> Result<(), ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        match self.inner.send(msg).await {
            Ok(()) => Ok(()),
            Err(CodecError::Io(reason)) => {
                tracing::debug!(%reason, "Channel write failed, peer gone");
                self.closed = true;
                Err(ChannelError::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Flush and shut down the write half. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = SinkExt::<Out>::close(&mut self.inner).await {
            tracing::trace!(error = %e, "Error closing channel writer");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Both halves of one connection.
pub struct Endpoint<In, Out> {
    pub receiver: ChannelReceiver<In>,
    pub sender: ChannelSender<Out>,
}

/// Host side: receives worker frames, sends host frames.
pub type HostEndpoint = Endpoint<WorkerFrame, HostFrame>;
/// Worker side: receives host frames, sends worker frames.
pub type WorkerEndpoint = Endpoint<HostFrame, WorkerFrame>;

impl<In, Out> Endpoint<In, Out>
where
    In: serde::de::DeserializeOwned,
    Out: serde::Serialize,
{
    pub fn new(reader: BoxedReader, writer: BoxedWriter, max_frame_bytes: usize) -> Self {
        Self {
            receiver: ChannelReceiver::new(reader, max_frame_bytes),
            sender: ChannelSender::new(writer, max_frame_bytes),
        }
    }

    /// Build an endpoint over any reader/writer pair (child stdio, sockets).
    pub fn from_io<R, W>(reader: R, writer: W, max_frame_bytes: usize) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self::new(Box::pin(reader), Box::pin(writer), max_frame_bytes)
    }

    pub async fn send(&mut self, msg: Out) -> Result<(), ChannelError> {
        self.sender.send(msg).await
    }

    pub async fn recv(&mut self) -> Result<In, ChannelError> {
        self.receiver.recv().await
    }

    pub async fn close(&mut self) {
        self.sender.close().await;
    }

    pub fn split(self) -> (ChannelSender<Out>, ChannelReceiver<In>) {
        (self.sender, self.receiver)
    }
}

/// In-memory connected pair for running a worker on the host's runtime.
pub fn duplex(max_frame_bytes: usize) -> (HostEndpoint, WorkerEndpoint) {
    let (host_io, worker_io) = tokio::io::duplex(DUPLEX_BUFFER_BYTES);
    let (host_read, host_write) = tokio::io::split(host_io);
    let (worker_read, worker_write) = tokio::io::split(worker_io);
    (
        Endpoint::from_io(host_read, host_write, max_frame_bytes),
        Endpoint::from_io(worker_read, worker_write, max_frame_bytes),
    )
}
