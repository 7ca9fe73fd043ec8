//! TCP framing: 4-byte big-endian length prefix + UTF-8 JSON payload.
//!
//! There is no delimiter between frames; the length prefix is the only
//! boundary. An oversized length terminates the connection immediately.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single frame payload (10 MB).
pub const MAX_FRAME_BYTES: usize = 10_000_000;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame too large: {got} bytes (max {max})")]
    TooLarge { got: usize, max: usize },
}

/// Read one length-prefixed frame payload.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary; EOF in the middle
/// of a frame is an io error.
pub async fn read_frame<R>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_bytes {
        return Err(FrameError::TooLarge {
            got: len,
            max: max_bytes,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

/// Prepend the 4-byte big-endian length header to a payload.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Write one framed payload to the stream.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    Ok(())
}
