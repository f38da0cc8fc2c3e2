//! Frame transport over any async byte stream: an incremental reader and a writer.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};

use crate::protocol::Message;
use crate::session::SessionError;
use crate::wire::{decode_frame, encode_frame, FrameDecodeError, HEADER_SIZE};

const READ_CHUNK: usize = 16 * 1024;

/// Reads whole frames. Partial input stays in the reader between calls, so
/// `next_message` can be dropped mid-frame (e.g. losing a `select!`) without
/// desynchronizing the stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    body_timeout: Option<Duration>,
    /// Set once the current frame's header is in; cleared when the frame completes.
    body_deadline: Option<Instant>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            body_timeout: None,
            body_deadline: None,
        }
    }

    /// Limit the time between a frame header and the end of its body. `None` or zero disables.
    pub fn with_body_timeout(mut self, limit: Option<Duration>) -> Self {
        self.body_timeout = limit.filter(|d| !d.is_zero());
        self
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Next message, or `None` on a clean end of stream between frames.
    pub async fn next_message(&mut self) -> Result<Option<Message>, SessionError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match decode_frame(&self.buf) {
                Ok((msg, used)) => {
                    self.buf.drain(..used);
                    self.body_deadline = None;
                    return Ok(Some(msg));
                }
                Err(FrameDecodeError::NeedMore) => {}
                Err(e) => return Err(e.into()),
            }
            if self.buf.len() >= HEADER_SIZE && self.body_deadline.is_none() {
                self.body_deadline = self.body_timeout.map(|t| Instant::now() + t);
            }
            let n = match self.body_deadline {
                Some(deadline) => timeout_at(deadline, self.inner.read(&mut chunk))
                    .await
                    .map_err(|_| SessionError::Timeout)??,
                None => self.inner.read(&mut chunk).await?,
            };
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed {} bytes into a frame", self.buf.len()),
                )
                .into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Encode and write one message, then flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &Message,
) -> Result<(), SessionError> {
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
