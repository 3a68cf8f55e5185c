//! Response body data sources.
//!
//! Every response body is described by one or more [`HttpDataSource`]s held in the task's
//! document. A source knows its length (when it can) and writes any byte window of itself into
//! a sink. Sources of unknown length are framed with chunked transfer encoding by
//! [`ChunkedSource`].
//!
//! | source | length | backing data |
//! |---|---|---|
//! | [`BytesSource`] | known | in-memory bytes or text |
//! | [`StreamSource`] | known | seekable reader such as a file |
//! | [`BodySource`] | `size_hint().exact()` | any `http_body::Body` |
//! | [`LazySource`] | unknown | sources produced on demand by an iterator |
//! | [`RangeSource`] | known | a window of another source |
//! | [`MultiRangeSource`] | known | `multipart/byteranges` over another source |
//! | [`ChunkedSource`] | unknown | chunked framing of another source |

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use async_trait::async_trait;
use mime::Mime;
use tokio::io::AsyncWrite;

mod body;
mod chunked;
mod lazy;
mod memory;
mod range;
mod stream;

pub use body::BodySource;
pub use chunked::ChunkedSource;
pub use lazy::LazySource;
pub use memory::BytesSource;
pub use range::{ByteRange, MultiRangeSource, RangeSet, RangeSource};
pub use stream::StreamSource;

/// The writer every data source writes its bytes into.
pub type DataSink<'a> = dyn AsyncWrite + Send + Unpin + 'a;

/// A body that can be written to an output stream.
///
/// Once [`length`](HttpDataSource::length) returned a value it must keep returning the same
/// value, callers use it to choose the response framing before writing.
#[async_trait]
pub trait HttpDataSource: Send {
    /// Total number of bytes, `None` when it is not known upfront.
    fn length(&self) -> Option<u64>;

    /// Content type of the data, if the source knows it.
    fn mime_type(&self) -> Option<Mime> {
        None
    }

    /// Writes the bytes in `start..stop` (`stop` defaulting to the end) into `sink`.
    ///
    /// Returns the number of data bytes written.
    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64>;
}

#[async_trait]
impl<T: HttpDataSource + ?Sized> HttpDataSource for Box<T> {
    fn length(&self) -> Option<u64> {
        (**self).length()
    }

    fn mime_type(&self) -> Option<Mime> {
        (**self).mime_type()
    }

    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        (**self).write_to(sink, start, stop).await
    }
}

#[async_trait]
impl<T: HttpDataSource + ?Sized> HttpDataSource for &mut T {
    fn length(&self) -> Option<u64> {
        (**self).length()
    }

    fn mime_type(&self) -> Option<Mime> {
        (**self).mime_type()
    }

    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        (**self).write_to(sink, start, stop).await
    }
}

/// Passes on only the bytes inside a window of the written stream.
///
/// Bytes before `skip` and after the window are swallowed but reported as written, so a
/// producer that can only write its whole output can still serve a byte range.
struct WindowWriter<'a, 'b> {
    inner: &'a mut DataSink<'b>,
    skip: u64,
    remaining: Option<u64>,
    forwarded: u64,
}

impl<'a, 'b> WindowWriter<'a, 'b> {
    fn new(inner: &'a mut DataSink<'b>, start: u64, stop: Option<u64>) -> Self {
        Self { inner, skip: start, remaining: stop.map(|stop| stop.saturating_sub(start)), forwarded: 0 }
    }

    fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// True once every byte of a bounded window was passed on.
    fn is_done(&self) -> bool {
        self.remaining == Some(0)
    }
}

impl AsyncWrite for WindowWriter<'_, '_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        let offset = usize::try_from(this.skip).map_or(buf.len(), |skip| skip.min(buf.len()));
        let mut window = &buf[offset..];
        if let Some(remaining) = this.remaining {
            let len = usize::try_from(remaining).map_or(window.len(), |remaining| remaining.min(window.len()));
            window = &window[..len];
        }

        if window.is_empty() {
            this.skip -= offset as u64;
            return Poll::Ready(Ok(buf.len()));
        }

        let written = ready!(Pin::new(&mut *this.inner).poll_write(cx, window))?;
        this.skip -= offset as u64;
        this.forwarded += written as u64;
        if let Some(remaining) = this.remaining.as_mut() {
            *remaining -= written as u64;
        }
        Poll::Ready(Ok(offset + written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }
}
