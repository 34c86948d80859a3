//! Wire framing
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes of
//! JSON. Used by both the listener and the client.

use bytes::{Buf, Bytes, BytesMut};
use emberq_types::{Error, Result};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame payload
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const LEN_PREFIX: usize = 4;
const INITIAL_BUFFER_SIZE: usize = 8 * 1024;

/// Append one frame carrying `value` to `buf`
pub fn encode_frame<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_LEN}",
            payload.len()
        )));
    }

    buf.reserve(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(())
}

/// Split one complete frame payload off the front of `buf`
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>> {
    if buf.len() < LEN_PREFIX {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}"
        )));
    }
    if buf.len() < LEN_PREFIX + len {
        buf.reserve(LEN_PREFIX + len - buf.len());
        return Ok(None);
    }

    buf.advance(LEN_PREFIX);
    Ok(Some(buf.split_to(len).freeze()))
}

/// A byte stream carrying length-prefixed frames
pub struct FramedStream<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            write_buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}

impl<S> FramedStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Read the next frame payload; `Ok(None)` on a clean end of stream
    ///
    /// Cancel safe: partially read frames stay buffered.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(frame) = try_decode_frame(&mut self.read_buf)? {
                return Ok(Some(frame));
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return if self.read_buf.is_empty() {
                    Ok(None)
                } else {
                    Err(Error::Protocol("connection closed mid-frame".into()))
                };
            }
        }
    }
}

impl<S> FramedStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Encode `value` as one frame and flush it
    pub async fn write_frame<T: Serialize>(&mut self, value: &T) -> Result<()> {
        encode_frame(value, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();
        self.stream.flush().await?;
        Ok(())
    }
}
