use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::codec::Encoder;
use tracing::trace;

use crate::codec::ChunkedEncoder;
use crate::protocol::{PayloadItem, SendError};
use crate::source::{DataSink, HttpDataSource};

/// Writes another source with chunked transfer encoding.
///
/// A source of known length goes out as a single chunk of exactly that length. A source of
/// unknown length is pumped through a pipe of `buffer_size` bytes and every read from the
/// pipe becomes one chunk. The pipe is bounded: once it is full the producing source waits
/// until the framer has written the pending bytes to the sink.
#[derive(Debug)]
pub struct ChunkedSource<S> {
    inner: S,
    buffer_size: usize,
}

impl<S> ChunkedSource<S>
where
    S: HttpDataSource,
{
    pub fn new(inner: S, buffer_size: usize) -> Self {
        Self { inner, buffer_size: buffer_size.max(1) }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn write_single_chunk(&mut self, sink: &mut DataSink<'_>, start: u64, stop: u64) -> io::Result<u64> {
        let size = stop.saturating_sub(start);
        if size > 0 {
            sink.write_all(format!("{size:X}\r\n").as_bytes()).await?;
            let written = self.inner.write_to(sink, start, Some(stop)).await?;
            if written != size {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "data source ended before its length"));
            }
            sink.write_all(b"\r\n").await?;
        }
        sink.write_all(b"0\r\n\r\n").await?;
        Ok(size)
    }

    async fn write_piped(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        let (mut pipe_writer, mut pipe_reader) = tokio::io::duplex(self.buffer_size);
        let inner = &mut self.inner;
        let buffer_size = self.buffer_size;
        let failed = AtomicBool::new(false);
        let failed = &failed;

        let produce = async move {
            let result = inner.write_to(&mut pipe_writer, start, stop).await;
            if result.is_err() {
                // set before the pipe closes, the framer must not terminate the body
                failed.store(true, Ordering::Release);
                drop(pipe_writer);
            } else {
                let _ = pipe_writer.shutdown().await;
            }
            result
        };

        let frame = async move {
            let mut encoder = ChunkedEncoder::new();
            let mut chunk = BytesMut::with_capacity(buffer_size);
            let mut framed = BytesMut::with_capacity(buffer_size + 16);
            loop {
                chunk.reserve(buffer_size);
                if pipe_reader.read_buf(&mut chunk).await? == 0 {
                    if failed.load(Ordering::Acquire) {
                        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "data source failed before its end"));
                    }
                    encoder.encode(PayloadItem::<Bytes>::Eof, &mut framed).map_err(into_io)?;
                    sink.write_all(&framed).await?;
                    trace!(size = encoder.send_size(), "finished chunked body");
                    return Ok::<_, io::Error>(encoder.send_size());
                }

                framed.clear();
                encoder.encode(PayloadItem::Chunk(chunk.split().freeze()), &mut framed).map_err(into_io)?;
                sink.write_all(&framed).await?;
                framed.clear();
            }
        };

        let (produced, framed) = tokio::join!(produce, frame);
        produced?;
        framed
    }
}

fn into_io(e: SendError) -> io::Error {
    match e {
        SendError::Io { source } => source,
        e => io::Error::other(e),
    }
}

#[async_trait]
impl<S> HttpDataSource for ChunkedSource<S>
where
    S: HttpDataSource,
{
    /// The framed output has no upfront length.
    fn length(&self) -> Option<u64> {
        None
    }

    fn mime_type(&self) -> Option<mime::Mime> {
        self.inner.mime_type()
    }

    /// Writes the chunked framing of `start..stop` of the inner source.
    ///
    /// Returns the number of payload bytes, not counting the framing.
    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        match self.inner.length() {
            Some(length) => {
                let stop = stop.map_or(length, |stop| stop.min(length));
                self.write_single_chunk(sink, start.min(stop), stop).await
            }
            None => self.write_piped(sink, start, stop).await,
        }
    }
}
