//! Length-prefixed framing.
//!
//! A frame is a 4-byte big-endian payload length followed by the
//! postcard-encoded [`RepairMessage`]. Payloads above [`MAX_MESSAGE_SIZE`]
//! are rejected on both ends.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::NetError;
use crate::message::RepairMessage;

/// Largest accepted payload.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

const PREFIX_LEN: usize = 4;

/// Encode a message into one frame.
pub fn encode(message: &RepairMessage) -> Result<Bytes, NetError> {
    let payload =
        postcard::to_allocvec(message).map_err(|e| NetError::Serialization(e.to_string()))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(NetError::FrameTooLarge {
            len: payload.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(&payload);
    Ok(buf.freeze())
}

/// Decode exactly one frame.
pub fn decode(frame: &[u8]) -> Result<RepairMessage, NetError> {
    if frame.len() < PREFIX_LEN {
        return Err(NetError::Truncated {
            expected: PREFIX_LEN,
            actual: frame.len(),
        });
    }
    let mut len_buf = [0u8; PREFIX_LEN];
    len_buf.copy_from_slice(&frame[..PREFIX_LEN]);
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(NetError::FrameTooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if frame.len() != PREFIX_LEN + len {
        return Err(NetError::Truncated {
            expected: PREFIX_LEN + len,
            actual: frame.len(),
        });
    }

    postcard::from_bytes(&frame[PREFIX_LEN..]).map_err(|e| NetError::Serialization(e.to_string()))
}

/// Write one frame to a stream.
pub async fn write_frame<W>(writer: &mut W, message: &RepairMessage) -> Result<(), NetError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame from a stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<RepairMessage, NetError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; PREFIX_LEN];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(NetError::FrameTooLarge {
            len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    postcard::from_bytes(&payload).map_err(|e| NetError::Serialization(e.to_string()))
}
