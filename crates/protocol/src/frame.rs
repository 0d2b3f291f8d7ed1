//! Message framing on the accessory byte streams
//!
//! The accessory streams carry no message boundaries of their own, so every
//! message is wrapped in a 3-byte header:
//!
//! ```text
//! Offset  Size  Description
//! 0       1     Kind (host->key: 0x00 = APDU; key->host: 0x00 = response, 0x01 = wait extension)
//! 1       2     Payload length (big-endian)
//! 3       N     Payload
//! ```
//!
//! A wait extension carries no payload. It tells the host the key is still
//! working (typically waiting for touch) and the response deadline should be
//! re-armed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Header size in bytes
pub const FRAME_HEADER_SIZE: usize = 3;

/// Maximum payload a single frame can carry
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Frame kinds
pub mod kind {
    /// Host to key: command APDU
    pub const APDU: u8 = 0x00;
    /// Key to host: complete response APDU
    pub const RESPONSE: u8 = 0x00;
    /// Key to host: still processing, keep waiting
    pub const WAIT_EXTENSION: u8 = 0x01;
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("Wait extension frame carried {0} payload bytes")]
    UnexpectedPayload(usize),
}

/// One undecoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Bytes,
}

/// Frames the host can receive from the key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Response(Bytes),
    WaitExtension,
}

impl InboundFrame {
    /// Interpret a raw frame read from the key's stream
    pub fn from_frame(frame: Frame) -> Result<Self, FrameError> {
        match frame.kind {
            kind::RESPONSE => Ok(InboundFrame::Response(frame.payload)),
            kind::WAIT_EXTENSION if frame.payload.is_empty() => Ok(InboundFrame::WaitExtension),
            kind::WAIT_EXTENSION => Err(FrameError::UnexpectedPayload(frame.payload.len())),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// Wrap a payload in a frame header
pub fn encode_frame(kind: u8, payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.put_u8(kind);
    buf.put_u16(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Frame an encoded command APDU for the outbound stream
pub fn encode_command(apdu: &[u8]) -> Result<Bytes, FrameError> {
    encode_frame(kind::APDU, apdu)
}

/// Frame a response APDU as the key would send it
pub fn encode_response(response: &[u8]) -> Result<Bytes, FrameError> {
    encode_frame(kind::RESPONSE, response)
}

/// Frame a wait extension as the key would send it
pub fn encode_wait_extension() -> Bytes {
    Bytes::from_static(&[kind::WAIT_EXTENSION, 0x00, 0x00])
}

/// Incremental decoder for a byte stream carrying frames
///
/// Bytes are pushed as they arrive; complete frames are popped one at a
/// time. Partial headers and partial payloads simply stay buffered.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return None;
        }

        let len = u16::from_be_bytes([self.buffer[1], self.buffer[2]]) as usize;
        if self.buffer.len() < FRAME_HEADER_SIZE + len {
            return None; // Wait for more data
        }

        let kind = self.buffer[0];
        self.buffer.advance(FRAME_HEADER_SIZE);
        let payload = self.buffer.split_to(len).freeze();

        Some(Frame { kind, payload })
    }

    /// Payload length announced by the buffered header, once the header is complete
    pub fn announced_len(&self) -> Option<usize> {
        (self.buffer.len() >= FRAME_HEADER_SIZE)
            .then(|| u16::from_be_bytes([self.buffer[1], self.buffer[2]]) as usize)
    }

    /// Number of bytes buffered but not yet returned as a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
