//! Length-prefixed framing for the controller/worker channel and the remote
//! client connection.
//!
//! Each frame is a 4-byte big-endian payload length followed by that many
//! bytes. [`FrameReader`] and [`FrameWriter`] work over any tokio byte stream;
//! the `*_json` helpers carry one JSON document per frame.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16 MiB) to prevent unbounded memory allocation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds maximum {MAX_FRAME_BYTES}")]
    Oversized(usize),
    #[error("unexpected EOF inside a frame")]
    Truncated,
    #[error("frame I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct FrameReader<R> {
    reader: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` on EOF at a frame boundary (clean shutdown).
    /// EOF inside the length prefix or the body is [`CodecError::Truncated`].
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = self.reader.read(&mut prefix[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(CodecError::Truncated);
            }
            filled += n;
        }

        let len = u32::from_be_bytes(prefix) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(len));
        }

        let mut body = vec![0u8; len];
        match self.reader.read_exact(&mut body).await {
            Ok(_) => Ok(Some(body)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::Truncated),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the next frame and parse it as JSON.
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, CodecError> {
        match self.read_frame().await? {
            Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
            None => Ok(None),
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), CodecError> {
        if body.len() > MAX_FRAME_BYTES {
            return Err(CodecError::Oversized(body.len()));
        }
        let len = u32::try_from(body.len()).map_err(|_| CodecError::Oversized(body.len()))?;
        self.writer.write_all(&len.to_be_bytes()).await?;
        self.writer.write_all(body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub async fn write_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let body = serde_json::to_vec(value)?;
        self.write_frame(&body).await
    }
}
