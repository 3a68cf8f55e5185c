//! HTTP header encoder implementation for serializing HTTP response heads
//!
//! This module provides functionality for encoding response heads into raw bytes.
//! It handles serialization of the status line and headers, and manages content length or
//! transfer encoding headers according to the HTTP/1.1 specification.

use crate::protocol::{PayloadSize, ResponseHead, SendError, status_allows_body};

use bytes::{BufMut, BytesMut};

use http::{HeaderValue, Version, header};
use std::io;
use std::io::{ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

const CHUNKED: HeaderValue = HeaderValue::from_static("chunked");

/// Encoder for HTTP response heads implementing the [`Encoder`] trait.
///
/// This encoder serializes a [`ResponseHead`] and [`PayloadSize`] into raw bytes,
/// automatically setting the Content-Length or Transfer-Encoding header from the
/// payload size. Statuses that never carry a body (1xx, 204, 304) get no framing header.
#[derive(Debug)]
pub struct HeaderEncoder;

impl Encoder<(ResponseHead, PayloadSize)> for HeaderEncoder {
    type Error = SendError;

    fn encode(&mut self, item: (ResponseHead, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut header, payload_size) = item;

        dst.reserve(INIT_HEADER_SIZE);
        let version = match header.version() {
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_10 => "HTTP/1.0",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        };
        write!(
            FastWrite(dst),
            "{} {} {}\r\n",
            version,
            header.status().as_str(),
            header.status().canonical_reason().unwrap_or("Unknown")
        )?;

        // Set appropriate content length or transfer encoding header
        if status_allows_body(header.status()) {
            let headers = header.headers_mut();
            match payload_size {
                PayloadSize::Length(n) => {
                    headers.remove(header::TRANSFER_ENCODING);
                    headers.insert(header::CONTENT_LENGTH, n.into());
                }
                PayloadSize::Chunked => {
                    headers.remove(header::CONTENT_LENGTH);
                    headers.insert(header::TRANSFER_ENCODING, CHUNKED);
                }
                PayloadSize::UntilClose => {
                    headers.remove(header::CONTENT_LENGTH);
                    headers.remove(header::TRANSFER_ENCODING);
                }
                PayloadSize::Empty => {
                    headers.remove(header::TRANSFER_ENCODING);
                    headers.insert(header::CONTENT_LENGTH, 0.into());
                }
            }
        }

        // Write all headers
        for (header_name, header_value) in header.headers() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Fast writer implementation for writing to BytesMut.
///
/// Space has already been reserved, so writes never need to grow the buffer in the common case.
struct FastWrite<'a>(&'a mut BytesMut);

impl Write for FastWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.put_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
