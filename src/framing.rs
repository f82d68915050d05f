//! Native-messaging framing: a native-endian `u32` length prefix followed by
//! that many bytes of UTF-8 JSON, in both directions.

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LENGTH_PREFIX_BYTES: usize = 4;

#[derive(Debug, thiserror::Error)]
pub(crate) enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream ended inside a frame ({read} of {expected} bytes)")]
    Truncated { read: usize, expected: usize },
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the u32 length prefix")]
    TooLarge(usize),
}

pub(crate) struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Returns `Ok(None)` when the peer closed the stream before a new frame.
    ///
    /// A `FrameError::Json` leaves the stream aligned on the next frame, so the
    /// caller can report it and keep reading.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Value>, FrameError> {
        let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
        let read = fill(&mut self.reader, &mut prefix).await?;
        if read == 0 {
            return Ok(None);
        }
        if read < LENGTH_PREFIX_BYTES {
            return Err(FrameError::Truncated {
                read,
                expected: LENGTH_PREFIX_BYTES,
            });
        }

        // Grow with the bytes that actually arrive, not with what the prefix claims.
        let length = u32::from_ne_bytes(prefix) as usize;
        let mut payload = Vec::new();
        let read = (&mut self.reader)
            .take(length as u64)
            .read_to_end(&mut payload)
            .await?;
        if read < length {
            return Err(FrameError::Truncated {
                read,
                expected: length,
            });
        }

        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

pub(crate) struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one compact JSON frame and flushes, since the peer reads
    /// frame by frame.
    pub(crate) async fn write_frame(&mut self, value: &Value) -> Result<(), FrameError> {
        let payload = serde_json::to_vec(value)?;
        let length =
            u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge(payload.len()))?;

        self.writer.write_all(&length.to_ne_bytes()).await?;
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn into_inner(self) -> W {
        self.writer
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
async fn fill<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
