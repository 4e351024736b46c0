//! Length-prefixed CBOR framing for the control stream.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`. One frame
//! carries one control message. Frames larger than [`MAX_FRAME_LEN`] are
//! rejected as corrupt rather than buffered.

use crate::error::{BurrowError, BurrowResult};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single control frame. Control messages are small;
/// anything beyond this is a desynchronized or hostile stream.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn encode_frame<T: serde::Serialize>(value: &T) -> BurrowResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let len = payload.len() as u32;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode one CBOR payload (without length prefix) into a typed value.
pub fn decode_payload<T: serde::de::DeserializeOwned>(data: &[u8]) -> BurrowResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Write one framed message to an async stream and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> BurrowResult<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = encode_frame(value)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from an async stream.
///
/// Returns `Ok(None)` on clean EOF at a frame boundary; EOF in the middle
/// of a frame is an error.
pub async fn read_frame<R, T>(reader: &mut R) -> BurrowResult<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(BurrowError::Codec(format!(
            "frame length {len} exceeds limit {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(decode_payload(&payload)?))
}

/// Incremental frame decoder: accumulates bytes and yields complete messages.
///
/// Used where the stream is consumed in arbitrary chunks rather than one
/// awaited frame at a time.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return all messages completed by them.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> BurrowResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        loop {
            if self.buffer.len() < 4 {
                break;
            }
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(BurrowError::Codec(format!(
                    "frame length {len} exceeds limit {MAX_FRAME_LEN}"
                )));
            }
            if self.buffer.len() < 4 + len {
                break;
            }

            messages.push(decode_payload(&self.buffer[4..4 + len])?);
            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
