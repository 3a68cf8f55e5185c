//! Close status codes and the close frame payload.

use std::fmt;

use bytes::{BufMut, BytesMut};

/// A close status code as listed in
/// [RFC 6455 Section 7.4.1](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Normal,
    GoingAway,
    ProtocolError,
    UnsupportedData,
    NoStatus,
    Abnormal,
    InvalidPayload,
    PolicyViolation,
    MessageTooBig,
    MandatoryExtension,
    InternalError,
    Other(u16),
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::Normal => 1000,
            CloseReason::GoingAway => 1001,
            CloseReason::ProtocolError => 1002,
            CloseReason::UnsupportedData => 1003,
            CloseReason::NoStatus => 1005,
            CloseReason::Abnormal => 1006,
            CloseReason::InvalidPayload => 1007,
            CloseReason::PolicyViolation => 1008,
            CloseReason::MessageTooBig => 1009,
            CloseReason::MandatoryExtension => 1010,
            CloseReason::InternalError => 1011,
            CloseReason::Other(code) => code,
        }
    }

    /// 1005 and 1006 only describe what happened locally and never travel in a close frame.
    pub fn is_sendable(self) -> bool {
        !matches!(self, CloseReason::NoStatus | CloseReason::Abnormal)
    }
}

impl From<u16> for CloseReason {
    fn from(code: u16) -> Self {
        match code {
            1000 => CloseReason::Normal,
            1001 => CloseReason::GoingAway,
            1002 => CloseReason::ProtocolError,
            1003 => CloseReason::UnsupportedData,
            1005 => CloseReason::NoStatus,
            1006 => CloseReason::Abnormal,
            1007 => CloseReason::InvalidPayload,
            1008 => CloseReason::PolicyViolation,
            1009 => CloseReason::MessageTooBig,
            1010 => CloseReason::MandatoryExtension,
            1011 => CloseReason::InternalError,
            other => CloseReason::Other(other),
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Splits a close payload into its optional code and optional text.
///
/// A payload shorter than two bytes carries neither, exactly two bytes carry only the code.
/// Invalid UTF-8 in the text is replaced rather than rejected.
pub fn parse_close_payload(payload: &[u8]) -> (Option<CloseReason>, Option<String>) {
    if payload.len() < 2 {
        return (None, None);
    }

    let reason = CloseReason::from(u16::from_be_bytes([payload[0], payload[1]]));
    let info = (payload.len() > 2).then(|| String::from_utf8_lossy(&payload[2..]).into_owned());
    (Some(reason), info)
}

/// Builds a close payload; nothing is written without a sendable reason.
pub fn close_payload(reason: Option<CloseReason>, info: Option<&str>) -> BytesMut {
    let Some(reason) = reason.filter(|reason| reason.is_sendable()) else {
        return BytesMut::new();
    };

    let info = info.unwrap_or_default();
    // control frame payloads are limited to 125 bytes
    let info = truncate_utf8(info, 123);

    let mut payload = BytesMut::with_capacity(2 + info.len());
    payload.put_u16(reason.code());
    payload.put_slice(info.as_bytes());
    payload
}

fn truncate_utf8(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
