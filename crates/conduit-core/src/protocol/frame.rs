//! Length-prefixed framing.
//!
//! ```text
//! [u32 BE: len][UTF-8 JSON bytes of len]
//! ```
//!
//! Byte streams (unix sockets, TCP, byte-mode pipes) do not preserve write
//! boundaries, so every message is prefixed with its length.

use super::message::Message;
use crate::{IpcError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Smallest buffer size a configuration may use.
pub const MIN_FRAME_SIZE: usize = 256;

/// Encode `message` into a complete frame, header included.
///
/// Fails with `PayloadTooLarge` when the body would exceed `max_body`.
pub fn encode_frame(message: &Message, max_body: usize) -> Result<Bytes> {
    let body = message.encode()?;
    if body.len() > max_body {
        return Err(IpcError::PayloadTooLarge {
            size: body.len(),
            max: max_body,
        });
    }

    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Read one frame body from an async reader.
///
/// Returns `None` on EOF at a frame boundary (peer closed the connection).
/// EOF anywhere inside a frame, header included, is an I/O error.
/// A frame larger than `max_body` is drained from the stream so the next
/// frame stays aligned, then reported as `FrameTooLarge`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_body: usize,
) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    let filled = reader.read(&mut len_buf).await?;
    if filled == 0 {
        return Ok(None);
    }
    if filled < FRAME_HEADER_LEN {
        match reader.read_exact(&mut len_buf[filled..]).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed inside a frame header",
                )
                .into())
            }
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_body {
        let drained =
            tokio::io::copy(&mut (&mut *reader).take(len as u64), &mut tokio::io::sink()).await?;
        if drained < len as u64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed inside an oversized frame",
            )
            .into());
        }
        return Err(IpcError::FrameTooLarge {
            size: len,
            max: max_body,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a pre-encoded frame (see [`encode_frame`]) and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}
