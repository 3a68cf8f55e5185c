//! A single WebSocket frame as defined by
//! [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).

use bytes::{Bytes, BytesMut};

use crate::protocol::WebSocketError;

/// Frame opcodes. Reserved values are rejected when decoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Result<Self, WebSocketError> {
        match value {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(WebSocketError::protocol(format!("reserved opcode {other:#x}"))),
        }
    }

    #[inline]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Close, Ping and Pong; these may be interleaved with a fragmented message.
    #[inline]
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x8 != 0
    }
}

/// One frame. `payload` holds the bytes exactly as they travel on the wire,
/// so a frame decoded from a client stays masked until [`Frame::unapply_mask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub has_mask: bool,
    pub mask_key: [u8; 4],
    pub payload: BytesMut,
}

impl Frame {
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self { fin, opcode, has_mask: false, mask_key: [0; 4], payload: payload.into() }
    }

    pub fn text(text: &str) -> Self {
        Self::new(true, OpCode::Text, text.as_bytes())
    }

    pub fn binary(data: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    pub fn ping(data: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Ping, data)
    }

    pub fn pong(data: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Pong, data)
    }

    pub fn close(payload: impl Into<BytesMut>) -> Self {
        Self::new(true, OpCode::Close, payload)
    }

    /// Sets the mask key and masks the payload. Does nothing when already masked.
    pub fn apply_mask(&mut self, mask_key: [u8; 4]) {
        if self.has_mask {
            return;
        }
        self.mask_key = mask_key;
        xor_mask(&mut self.payload, mask_key);
        self.has_mask = true;
    }

    /// Restores the plain payload. Does nothing when not masked.
    pub fn unapply_mask(&mut self) {
        if !self.has_mask {
            return;
        }
        xor_mask(&mut self.payload, self.mask_key);
        self.has_mask = false;
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn into_payload(self) -> Bytes {
        self.payload.freeze()
    }
}

fn xor_mask(payload: &mut [u8], mask_key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask_key[i & 3];
    }
}
