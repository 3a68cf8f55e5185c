use bytes::{Buf, Bytes};

/// Represents an item in an outgoing payload stream.
///
/// Encoders receive either a data chunk or the end-of-payload marker (EOF).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    /// A chunk of payload data
    Chunk(Data),
    /// Marks the end of the payload stream
    Eof,
}

impl<D: Buf> PayloadItem<D> {
    /// Returns true if this item represents the end of the payload stream
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }
}

/// Represents the size information of an HTTP payload.
///
/// This enum is used to determine how the response body is framed:
/// - Known length: `Content-Length` framing
/// - Chunked: `Transfer-Encoding: chunked` framing
/// - Until close: no framing, the end of the connection ends the body (HTTP/1.0)
/// - Empty: No payload to send
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// Payload with known length in bytes
    Length(u64),
    /// Payload using chunked transfer encoding
    Chunked,
    /// Unframed payload ended by closing the connection
    UntilClose,
    /// Empty payload (no body)
    Empty,
}

impl PayloadSize {
    /// Derives the framing from an optional total length.
    #[inline]
    pub fn from_length(length: Option<u64>) -> Self {
        match length {
            Some(0) => PayloadSize::Empty,
            Some(length) => PayloadSize::Length(length),
            None => PayloadSize::Chunked,
        }
    }

    /// Returns true if the payload uses chunked transfer encoding
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    /// Returns true if only closing the connection marks the end of the payload
    #[inline]
    pub fn is_until_close(&self) -> bool {
        matches!(self, PayloadSize::UntilClose)
    }

    /// Returns true if the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty)
    }
}
