//! Wire Framing
//!
//! Every message on the lobby connection travels as a length-prefixed frame:
//! a 4-byte big-endian payload size followed by exactly that many bytes of
//! UTF-8 JSON encoding one message. The framing is symmetric for both
//! directions.
//!
//! `read_frame` suspends until a complete frame is available. A stream that
//! closes mid-frame, an oversized size field, or an undecodable payload all
//! fail with [`ProtocolError`]; no partial message is ever handed to upper
//! layers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame's payload, both directions.
///
/// Lobby traffic is small structured messages; anything larger is a broken
/// or hostile peer.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Framing and message decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Peer closed the stream at a frame boundary.
    #[error("connection closed")]
    Closed,

    /// Peer closed the stream in the middle of a frame.
    #[error("stream closed mid-frame")]
    Truncated,

    /// Size field exceeds [`MAX_FRAME_SIZE`].
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    /// Payload was not a valid message.
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Underlying socket error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// True when the peer simply went away at a frame boundary.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, ProtocolError::Closed)
    }
}

/// Read one complete frame, suspending until it is fully available.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut len_buf).await {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Closed
        } else {
            ProtocolError::Io(e)
        });
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut payload = vec![0u8; len];
    if let Err(e) = reader.read_exact(&mut payload).await {
        return Err(if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ProtocolError::Truncated
        } else {
            ProtocolError::Io(e)
        });
    }

    Ok(payload)
}

/// Write one frame: size prefix, payload, flush.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read and decode the next message on the stream.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_frame(reader).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Encode and write one message as a single frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    write_frame(writer, &payload).await
}

// =============================================================================
// TESTS
// =============================================================================
