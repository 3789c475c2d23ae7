//! Request and response body streams.
//!
//! A [`BodyStream`] is a sequential byte source that may be rewound to its
//! start. Only streams over data the process still holds can rewind; streams
//! over readers or sockets fail with [`Error::RewindFailed`] so a retry never
//! resends a truncated body.

use crate::context::Context;
use crate::error::TransportErrorKind;
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK: usize = 8 * 1024;

/// A sequential, possibly rewindable, byte source.
#[async_trait]
pub trait BodyStream: Send + fmt::Debug {
    /// Reads up to `buf.len()` bytes, returning `0` at end of stream.
    ///
    /// Implementations must give up with [`Error::Cancelled`] when `ctx` is
    /// cancelled while waiting for data.
    async fn read(&mut self, ctx: &Context, buf: &mut [u8]) -> Result<usize>;

    /// Total length in bytes, if known up front.
    fn length(&self) -> Option<u64>;

    /// Resets the stream to its first byte.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RewindFailed`] if the stream cannot be re-read.
    fn rewind(&mut self) -> Result<()>;
}

/// Reads `stream` until end of stream.
pub async fn read_to_end(stream: &mut dyn BodyStream, ctx: &Context) -> Result<Bytes> {
    let capacity = stream
        .length()
        .and_then(|len| usize::try_from(len).ok())
        .unwrap_or(READ_CHUNK);
    let mut out = BytesMut::with_capacity(capacity);
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        ctx.check_cancelled()?;
        let n = stream.read(ctx, &mut buf).await?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out.freeze())
}

/// A body held in memory. Always rewindable.
#[derive(Debug, Clone)]
pub struct MemoryBodyStream {
    data: Bytes,
    offset: usize,
}

impl MemoryBodyStream {
    /// Creates a stream over `data`.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
        }
    }

    /// The full content, independent of the read position.
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

#[async_trait]
impl BodyStream for MemoryBodyStream {
    async fn read(&mut self, ctx: &Context, buf: &mut [u8]) -> Result<usize> {
        ctx.check_cancelled()?;
        let remaining = &self.data[self.offset..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.offset += n;
        Ok(n)
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn rewind(&mut self) -> Result<()> {
        self.offset = 0;
        Ok(())
    }
}

/// A body read from an [`AsyncRead`] source such as a file or a pipe.
///
/// The source is consumed as it is read, so the stream cannot rewind.
pub struct ReaderBodyStream<R> {
    reader: R,
    length: Option<u64>,
    consumed: bool,
}

impl<R> ReaderBodyStream<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Wraps `reader`. Pass `length` when the size is known so transports can
    /// send a `Content-Length`.
    pub fn new(reader: R, length: Option<u64>) -> Self {
        Self {
            reader,
            length,
            consumed: false,
        }
    }
}

impl<R> fmt::Debug for ReaderBodyStream<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderBodyStream")
            .field("length", &self.length)
            .field("consumed", &self.consumed)
            .finish()
    }
}

#[async_trait]
impl<R> BodyStream for ReaderBodyStream<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read(&mut self, ctx: &Context, buf: &mut [u8]) -> Result<usize> {
        self.consumed = true;
        tokio::select! {
            read = self.reader.read(buf) => read.map_err(|e| Error::Transport {
                kind: TransportErrorKind::Read,
                message: format!("Failed to read request body: {}", e),
                source: Some(Box::new(e)),
            }),
            _ = ctx.cancelled() => Err(Error::Cancelled),
        }
    }

    fn length(&self) -> Option<u64> {
        self.length
    }

    fn rewind(&mut self) -> Result<()> {
        Err(Error::RewindFailed(
            "reader-backed body stream is not seekable".to_string(),
        ))
    }
}
