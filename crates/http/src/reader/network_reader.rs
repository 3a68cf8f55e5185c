//! A buffered reader that serves bytes and characters from one cursor.
//!
//! HTTP heads are line oriented text while bodies and WebSocket frames are raw bytes, and
//! both are read from the same socket. [`NetworkReader`] keeps one byte buffer holding every
//! byte that has been received but not yet consumed, plus a lookahead of characters decoded
//! from a prefix of that buffer.
//!
//! # Invariants
//!
//! - The decoded characters always describe exactly the first `decoded_bytes` bytes of the
//!   byte buffer. Bytes are only removed from the buffer when a character is *consumed*,
//!   never when it is merely decoded for lookahead.
//! - Before any binary read the character lookahead is dropped. Since decoding never removed
//!   bytes, dropping it hands every byte back to the binary view: nothing is lost and
//!   nothing is delivered twice.
//! - Every async method consumes data only after its last suspension point. Dropping a
//!   pending future (cancellation, timeouts) leaves the reader as if the call never happened,
//!   apart from extra bytes sitting in the buffer.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures::FutureExt;
use memchr::memmem;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tracing::trace;

use crate::ensure;
use crate::protocol::ParseError;

/// Default size of one read from the underlying stream.
pub const DEFAULT_BLOCK_SIZE: usize = 8 * 1024;

const REPLACEMENT: char = char::REPLACEMENT_CHARACTER;

/// Buffered byte and character reader over an async byte stream.
#[derive(Debug)]
pub struct NetworkReader<R> {
    inner: R,
    buffer: BytesMut,
    block_size: usize,
    chars: VecDeque<(char, usize)>,
    decoded_bytes: usize,
    eof: bool,
}

/// Result of scanning for one line.
enum Line {
    Complete(String),
    TooLong(usize),
    Eof,
}

impl<R> NetworkReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_capacity(inner: R, block_size: usize) -> Self {
        let block_size = block_size.max(16);
        Self {
            inner,
            buffer: BytesMut::with_capacity(block_size),
            block_size,
            chars: VecDeque::new(),
            decoded_bytes: 0,
            eof: false,
        }
    }

    /// Creates a reader whose buffer starts with bytes that were already received.
    pub fn with_buffered(inner: R, block_size: usize, buffered: &[u8]) -> Self {
        let mut reader = Self::with_capacity(inner, block_size);
        reader.buffer.extend_from_slice(buffered);
        reader
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of received bytes that have not been consumed yet.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// True once the underlying stream reported end-of-stream.
    #[inline]
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// True when the stream ended and every received byte has been consumed.
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.eof && self.buffer.is_empty()
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Releases the underlying stream together with every unconsumed byte.
    pub fn into_parts(self) -> (R, BytesMut) {
        (self.inner, self.buffer)
    }

    /// Reads one more block from the stream into the buffer without consuming anything.
    ///
    /// Returns the number of new bytes, `0` at end-of-stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        if self.eof {
            return Ok(0);
        }

        self.buffer.reserve(self.block_size);
        let read = self.inner.read_buf(&mut self.buffer).await?;
        if read == 0 {
            trace!("network reader reached end of stream");
            self.eof = true;
        }
        Ok(read)
    }

    /// Non-blocking variant of [`fill`](Self::fill): `None` when no data is ready yet.
    pub fn try_fill(&mut self) -> Option<io::Result<usize>> {
        self.fill().now_or_never()
    }

    /// Returns the next character without consuming it.
    pub async fn peek_char(&mut self) -> io::Result<Option<char>> {
        if !self.ensure_chars(1).await? {
            return Ok(None);
        }
        Ok(self.chars.front().map(|(c, _)| *c))
    }

    /// Reads and consumes the next character.
    pub async fn read_char(&mut self) -> io::Result<Option<char>> {
        if !self.ensure_chars(1).await? {
            return Ok(None);
        }
        Ok(self.consume_chars(1).chars().next())
    }

    /// Reads one line terminated by `\n`, `\r` or `\r\n`, without the terminator.
    ///
    /// A final line without terminator is returned at end-of-stream; `None` means nothing at all
    /// was left to read.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        match self.scan_line(usize::MAX).await? {
            Line::Complete(line) => Ok(Some(line)),
            Line::TooLong(_) | Line::Eof => Ok(None),
        }
    }

    /// Like [`read_line`](Self::read_line) but fails once a line grows beyond `max_bytes`.
    pub async fn read_line_bounded(&mut self, max_bytes: usize) -> Result<Option<String>, ParseError> {
        match self.scan_line(max_bytes).await? {
            Line::Complete(line) => Ok(Some(line)),
            Line::TooLong(size) => Err(ParseError::too_large_header(size, max_bytes)),
            Line::Eof => Ok(None),
        }
    }

    /// Reads up to `dst.len()` bytes. Returns `0` only at end-of-stream or for an empty `dst`.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        self.discard_chars();
        if dst.is_empty() {
            return Ok(0);
        }

        if self.buffer.is_empty() {
            if self.eof {
                return Ok(0);
            }

            // large reads bypass the buffer entirely
            if dst.len() >= self.block_size {
                let read = self.inner.read(dst).await?;
                if read == 0 {
                    self.eof = true;
                }
                return Ok(read);
            }

            if self.fill().await? == 0 {
                return Ok(0);
            }
        }

        let len = dst.len().min(self.buffer.len());
        dst[..len].copy_from_slice(&self.buffer[..len]);
        self.buffer.advance(len);
        Ok(len)
    }

    /// Reads exactly `count` bytes, or fewer when the stream ends first.
    pub async fn read_bytes(&mut self, count: usize) -> io::Result<Bytes> {
        self.discard_chars();
        while self.buffer.len() < count && !self.eof {
            self.fill().await?;
        }

        let len = count.min(self.buffer.len());
        Ok(self.buffer.split_to(len).freeze())
    }

    /// Reads every byte before the first occurrence of `marker`.
    ///
    /// The marker itself stays in the stream. When the marker never shows up, all remaining
    /// bytes up to end-of-stream are returned.
    pub async fn read_until(&mut self, marker: &[u8]) -> Result<Bytes, ParseError> {
        ensure!(
            marker.len() <= self.block_size / 2,
            ParseError::MarkerTooLong { marker_len: marker.len(), buffer_size: self.block_size }
        );
        self.discard_chars();

        let finder = memmem::Finder::new(marker);
        let mut searched = 0;
        loop {
            if let Some(pos) = finder.find(&self.buffer[searched..]) {
                return Ok(self.buffer.split_to(searched + pos).freeze());
            }

            if self.eof {
                let len = self.buffer.len();
                return Ok(self.buffer.split_to(len).freeze());
            }

            // a marker may straddle the end of the current buffer
            searched = self.buffer.len().saturating_sub(marker.len().saturating_sub(1));
            self.fill().await?;
        }
    }

    /// Drops the character lookahead, handing its bytes back to the binary view.
    fn discard_chars(&mut self) {
        self.chars.clear();
        self.decoded_bytes = 0;
    }

    /// Consumes `count` decoded characters together with their bytes.
    fn consume_chars(&mut self, count: usize) -> String {
        let mut text = String::with_capacity(count);
        let mut bytes = 0;
        for (c, len) in self.chars.drain(..count) {
            text.push(c);
            bytes += len;
        }
        self.buffer.advance(bytes);
        self.decoded_bytes -= bytes;
        text
    }

    /// Makes sure at least `count` characters are decoded. `false` when the stream ended first.
    async fn ensure_chars(&mut self, count: usize) -> io::Result<bool> {
        loop {
            if self.chars.len() >= count {
                return Ok(true);
            }

            if self.decode_more() {
                continue;
            }

            if self.eof {
                return Ok(false);
            }
            self.fill().await?;
        }
    }

    /// Decodes the undecoded part of the buffer into the lookahead. Returns whether any
    /// character was produced.
    fn decode_more(&mut self) -> bool {
        let pending = &self.buffer[self.decoded_bytes..];
        if pending.is_empty() {
            return false;
        }

        let window = &pending[..pending.len().min(self.block_size)];
        let before = self.chars.len();
        let (valid, invalid) = match simdutf8::compat::from_utf8(window) {
            Ok(text) => {
                self.chars.extend(text.chars().map(|c| (c, c.len_utf8())));
                (window.len(), None)
            }
            Err(e) => {
                let valid = e.valid_up_to();
                // SAFETY: `valid_up_to` marks the end of the longest prefix validated as utf-8
                let text = unsafe { std::str::from_utf8_unchecked(&window[..valid]) };
                self.chars.extend(text.chars().map(|c| (c, c.len_utf8())));
                (valid, Some(e.error_len()))
            }
        };
        self.decoded_bytes += valid;

        match invalid {
            // an invalid sequence decodes to one replacement char covering exactly its bytes
            Some(Some(len)) => {
                self.chars.push_back((REPLACEMENT, len));
                self.decoded_bytes += len;
            }
            // incomplete sequence cut off by the end of the stream
            Some(None) if self.eof && window.len() == pending.len() => {
                let len = window.len() - valid;
                self.chars.push_back((REPLACEMENT, len));
                self.decoded_bytes += len;
            }
            _ => {}
        }

        self.chars.len() > before
    }

    async fn scan_line(&mut self, max_bytes: usize) -> io::Result<Line> {
        let mut scanned = 0;
        let mut line_bytes = 0;
        loop {
            while scanned < self.chars.len() {
                let (c, len) = self.chars[scanned];
                match c {
                    '\n' => return Ok(Line::Complete(self.take_line(scanned, 1))),
                    '\r' => match self.chars.get(scanned + 1) {
                        Some(('\n', _)) => return Ok(Line::Complete(self.take_line(scanned, 2))),
                        Some(_) => return Ok(Line::Complete(self.take_line(scanned, 1))),
                        // need one more char to know whether a '\n' follows
                        None if !self.eof || self.decoded_bytes < self.buffer.len() => break,
                        None => return Ok(Line::Complete(self.take_line(scanned, 1))),
                    },
                    _ => {
                        scanned += 1;
                        line_bytes += len;
                        if line_bytes > max_bytes {
                            return Ok(Line::TooLong(line_bytes));
                        }
                    }
                }
            }

            if self.decode_more() {
                continue;
            }

            if self.eof {
                if self.chars.is_empty() {
                    return Ok(Line::Eof);
                }
                let len = self.chars.len();
                return Ok(Line::Complete(self.consume_chars(len)));
            }

            self.fill().await?;
        }
    }

    /// Consumes a line of `len` chars plus `terminator` chars, returning the line only.
    fn take_line(&mut self, len: usize, terminator: usize) -> String {
        let line = self.consume_chars(len);
        self.consume_chars(terminator);
        line
    }
}

/// Binary view of the reader; any character lookahead is handed back first.
impl<R> AsyncRead for NetworkReader<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.discard_chars();

        if !this.buffer.is_empty() {
            let len = buf.remaining().min(this.buffer.len());
            buf.put_slice(&this.buffer[..len]);
            this.buffer.advance(len);
            return Poll::Ready(Ok(()));
        }

        if this.eof {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result
            && buf.filled().len() == before
            && buf.remaining() > 0
        {
            this.eof = true;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn reader(data: &'static [u8]) -> NetworkReader<&'static [u8]> {
        NetworkReader::with_capacity(data, 16)
    }

    #[tokio::test]
    async fn read_lines_with_mixed_terminators() {
        let mut reader = reader("\u{2661}\r\nfoo\n".as_bytes());

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("\u{2661}"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("foo"));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn read_lines_cr_only_and_trailing_partial() {
        let mut reader = reader(b"a\rb\r\n\r\ntail");

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("a"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("b"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some(""));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("tail"));
        assert_eq!(reader.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn chars_then_bytes_lose_nothing() {
        let mut reader = reader("h\u{e9}llo\r\nworld".as_bytes());

        assert_eq!(reader.peek_char().await.unwrap(), Some('h'));
        assert_eq!(reader.read_char().await.unwrap(), Some('h'));
        assert_eq!(reader.peek_char().await.unwrap(), Some('\u{e9}'));

        // the peeked char is decoded but its bytes still belong to the binary view
        let bytes = reader.read_bytes(2).await.unwrap();
        assert_eq!(&bytes[..], "\u{e9}".as_bytes());

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("llo"));
        let rest = reader.read_bytes(100).await.unwrap();
        assert_eq!(&rest[..], b"world");
    }

    #[tokio::test]
    async fn line_then_body_is_byte_exact() {
        let mut reader = reader(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody");

        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("POST / HTTP/1.1"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("Content-Length: 4"));
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some(""));

        let mut body = [0u8; 4];
        assert_eq!(reader.read(&mut body).await.unwrap(), 4);
        assert_eq!(&body, b"body");
        assert_eq!(reader.read(&mut body).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn read_until_marker() {
        let data: &'static [u8] = &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut reader = NetworkReader::with_capacity(data, 16);

        let before = reader.read_until(&[4, 5, 6]).await.unwrap();
        assert_eq!(&before[..], &[0, 1, 2, 3]);

        let rest = reader.read_bytes(6).await.unwrap();
        assert_eq!(&rest[..], &[4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn read_until_missing_marker_returns_rest() {
        let mut reader = reader(b"abcdefgh");
        let all = reader.read_until(b"xyz").await.unwrap();
        assert_eq!(&all[..], b"abcdefgh");
        assert!(reader.is_exhausted());
    }

    #[tokio::test]
    async fn read_until_marker_across_reads() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = NetworkReader::with_capacity(server, 16);

        let writer = tokio::spawn(async move {
            client.write_all(b"--part-one--bound").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.write_all(b"ary--tail").await.unwrap();
        });

        let before = reader.read_until(b"boundary").await.unwrap();
        assert_eq!(&before[..], b"--part-one--");
        writer.await.unwrap();

        let rest = reader.read_bytes(13).await.unwrap();
        assert_eq!(&rest[..], b"boundary--tai");
    }

    #[tokio::test]
    async fn read_until_rejects_long_marker() {
        let mut reader = reader(b"abc");
        let result = reader.read_until(&[0u8; 9]).await;
        assert!(matches!(result, Err(ParseError::MarkerTooLong { marker_len: 9, buffer_size: 16 })));
    }

    #[tokio::test]
    async fn invalid_utf8_becomes_replacement() {
        let mut reader = reader(b"a\xffb\n");
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("a\u{fffd}b"));
    }

    #[tokio::test]
    async fn bounded_line_limit() {
        let mut reader = reader(b"0123456789abcdef\n");
        let result = reader.read_line_bounded(8).await;
        assert!(matches!(result, Err(ParseError::TooLargeHeader { max_size: 8, .. })));
    }

    #[tokio::test]
    async fn cancelled_read_loses_nothing() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut reader = NetworkReader::with_capacity(server, 16);

        client.write_all(b"partial").await.unwrap();
        let cancelled = tokio::time::timeout(Duration::from_millis(20), reader.read_line()).await;
        assert!(cancelled.is_err());

        client.write_all(b" line\r\n").await.unwrap();
        assert_eq!(reader.read_line().await.unwrap().as_deref(), Some("partial line"));
    }

    #[tokio::test]
    async fn async_read_after_peek() {
        let mut reader = reader(b"xyz");
        assert_eq!(reader.peek_char().await.unwrap(), Some('x'));

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"xyz");
    }

    #[tokio::test]
    async fn try_fill_without_data() {
        let (_client, server) = tokio::io::duplex(64);
        let mut reader = NetworkReader::new(server);
        assert!(reader.try_fill().is_none());
        assert_eq!(reader.buffered(), 0);
    }
}
