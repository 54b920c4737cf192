//! Length-prefixed frame layout shared by both wire protocols.
//!
//! A message is a sequence of frames inside one length-delimited envelope;
//! each frame is a little-endian `u32` length followed by that many bytes.
//! The first frame always carries the opcode.

use bytes::{Buf, BufMut, Bytes, BytesMut};

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("message truncated while reading {0}")]
    Truncated(&'static str),
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Builds the frame sequence of one outgoing message.
#[derive(Default)]
pub struct FrameWriter {
    buf: BytesMut,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_frame(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32_le(data.len() as u32);
        self.buf.put_slice(data);
        self
    }

    pub fn put_u8_frame(&mut self, v: u8) -> &mut Self {
        self.put_frame(&[v])
    }

    pub fn put_u32_frame(&mut self, v: u32) -> &mut Self {
        self.put_frame(&v.to_le_bytes())
    }

    pub fn put_i32_frame(&mut self, v: i32) -> &mut Self {
        self.put_frame(&v.to_le_bytes())
    }

    pub fn put_u64_frame(&mut self, v: u64) -> &mut Self {
        self.put_frame(&v.to_le_bytes())
    }

    pub fn put_str_frame(&mut self, v: &str) -> &mut Self {
        self.put_frame(v.as_bytes())
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Splits an incoming message back into frames.
pub struct FrameReader {
    buf: Bytes,
}

impl FrameReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn next_frame(&mut self, what: &'static str) -> Result<Bytes, FrameError> {
        if self.buf.remaining() < 4 {
            return Err(FrameError::Truncated(what));
        }
        let len = self.buf.get_u32_le() as usize;
        if self.buf.remaining() < len {
            return Err(FrameError::Truncated(what));
        }
        Ok(self.buf.split_to(len))
    }

    pub fn u8_frame(&mut self, what: &'static str) -> Result<u8, FrameError> {
        let frame = self.next_frame(what)?;
        if frame.len() != 1 {
            return Err(FrameError::Malformed(format!(
                "expected 1-byte frame for {what}, got {} bytes",
                frame.len()
            )));
        }
        Ok(frame[0])
    }

    pub fn u32_frame(&mut self, what: &'static str) -> Result<u32, FrameError> {
        let frame = self.next_frame(what)?;
        if frame.len() != 4 {
            return Err(FrameError::Malformed(format!(
                "expected 4-byte frame for {what}, got {} bytes",
                frame.len()
            )));
        }
        Ok(u32::from_le_bytes(frame[..].try_into().unwrap()))
    }

    pub fn i32_frame(&mut self, what: &'static str) -> Result<i32, FrameError> {
        Ok(self.u32_frame(what)? as i32)
    }

    pub fn u64_frame(&mut self, what: &'static str) -> Result<u64, FrameError> {
        let frame = self.next_frame(what)?;
        if frame.len() != 8 {
            return Err(FrameError::Malformed(format!(
                "expected 8-byte frame for {what}, got {} bytes",
                frame.len()
            )));
        }
        Ok(u64::from_le_bytes(frame[..].try_into().unwrap()))
    }

    pub fn str_frame(&mut self, what: &'static str) -> Result<String, FrameError> {
        let frame = self.next_frame(what)?;
        String::from_utf8(frame.to_vec())
            .map_err(|_| FrameError::Malformed(format!("{what} is not valid utf-8")))
    }
}
