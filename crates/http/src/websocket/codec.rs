//! Decoder and encoder for WebSocket frames.
//!
//! The decoder accepts every consistent length form (inline, 16-bit or 64-bit extension)
//! while the encoder always writes the shortest one. Payloads are passed through
//! untouched: masked frames stay masked in both directions.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::protocol::WebSocketError;
use crate::websocket::{Frame, OpCode};

const MAX_HEADER_SIZE: usize = 14;

/// Upper bound of the buffer growth requested while a frame is incomplete.
const MAX_RESERVE: usize = 64 * 1024;

/// A frame codec with a payload limit.
///
/// A frame whose declared length is above the limit is rejected. By default the rejection is
/// silent: the codec reports "no frame" from then on and drops everything it is given, so the
/// stream ends as if the peer went away. With [`FrameCodec::error_on_oversize`] the decoder
/// returns [`WebSocketError::PayloadTooLarge`] instead, which lets the caller answer with a
/// close frame.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
    error_on_oversize: bool,
    rejected: bool,
}

impl FrameCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload, error_on_oversize: false, rejected: false }
    }

    pub fn error_on_oversize(mut self, enabled: bool) -> Self {
        self.error_on_oversize = enabled;
        self
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Whether an oversized frame was silently rejected.
    pub fn is_rejected(&self) -> bool {
        self.rejected
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(i32::MAX as usize)
    }
}

struct FrameHeader {
    fin: bool,
    opcode: OpCode,
    mask: Option<[u8; 4]>,
    payload_len: u64,
    header_len: usize,
}

/// Parses the fixed header, the extended length and the mask key without consuming `src`.
fn parse_header(src: &[u8]) -> Result<Option<FrameHeader>, WebSocketError> {
    if src.len() < 2 {
        return Ok(None);
    }

    let fin = src[0] & 0x80 != 0;
    if src[0] & 0x70 != 0 {
        return Err(WebSocketError::protocol("reserved bits set without a negotiated extension"));
    }
    let opcode = OpCode::from_u8(src[0] & 0x0F)?;
    let masked = src[1] & 0x80 != 0;

    let (payload_len, mut header_len) = match src[1] & 0x7F {
        126 => {
            if src.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([src[2], src[3]])), 4)
        }
        127 => {
            if src.len() < 10 {
                return Ok(None);
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&src[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        len => (u64::from(len), 2),
    };

    let mask = if masked {
        if src.len() < header_len + 4 {
            return Ok(None);
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&src[header_len..header_len + 4]);
        header_len += 4;
        Some(key)
    } else {
        None
    };

    Ok(Some(FrameHeader { fin, opcode, mask, payload_len, header_len }))
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.rejected {
            src.clear();
            return Ok(None);
        }

        let Some(header) = parse_header(src)? else {
            return Ok(None);
        };

        let too_large = !usize::try_from(header.payload_len).is_ok_and(|len| len <= self.max_payload);
        if too_large {
            if self.error_on_oversize {
                return Err(WebSocketError::payload_too_large(header.payload_len, self.max_payload));
            }
            debug!(length = header.payload_len, max_size = self.max_payload, "reject oversized websocket frame");
            self.rejected = true;
            src.clear();
            return Ok(None);
        }

        // fits in usize, checked above
        let payload_len = header.payload_len as usize;
        let frame_len = header.header_len + payload_len;
        if src.len() < frame_len {
            // grow with the bytes that actually arrive, not with the declared length
            src.reserve((frame_len - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(header.header_len);
        let payload = src.split_to(payload_len);

        trace!(opcode = ?header.opcode, fin = header.fin, length = payload_len, "decoded websocket frame");
        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            has_mask: header.mask.is_some(),
            mask_key: header.mask.unwrap_or_default(),
            payload,
        }))
    }

    /// A frame cut short by the end of the stream is treated as a clean disconnect.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !src.is_empty() {
                    debug!(remaining = src.len(), "stream closed in the middle of a websocket frame");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload_len = frame.payload.len();
        dst.reserve(MAX_HEADER_SIZE + payload_len);

        let first = (if frame.fin { 0x80 } else { 0x00 }) | frame.opcode.as_u8();
        dst.put_u8(first);

        let mask_bit = if frame.has_mask { 0x80 } else { 0x00 };
        match payload_len {
            // shortest form wins
            0..=125 => dst.put_u8(mask_bit | payload_len as u8),
            126..=0xFFFF => {
                dst.put_u8(mask_bit | 126);
                dst.put_u16(payload_len as u16);
            }
            _ => {
                dst.put_u8(mask_bit | 127);
                dst.put_u64(payload_len as u64);
            }
        }

        if frame.has_mask {
            dst.put_slice(&frame.mask_key);
        }
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
