//! Request content bounded to a fixed number of bytes.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;
use tracing::trace;

use crate::reader::NetworkReader;

/// Progress of reading one request body, kept by the task between stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BodyState {
    full_length: u64,
    read_bytes: u64,
}

impl BodyState {
    pub fn new(full_length: u64) -> Self {
        Self { full_length, read_bytes: 0 }
    }

    #[inline]
    pub fn full_length(&self) -> u64 {
        self.full_length
    }

    #[inline]
    pub fn read_bytes(&self) -> u64 {
        self.read_bytes
    }

    #[inline]
    pub fn unread_bytes(&self) -> u64 {
        self.full_length - self.read_bytes
    }
}

/// A view of the reader that never reads past the end of the current request body.
///
/// The unread remainder must be [`discard`](ContentStream::discard)ed before the reader
/// serves the next request, otherwise the body bytes would be parsed as the next request head.
#[derive(Debug)]
pub struct ContentStream<'a, R> {
    reader: &'a mut NetworkReader<R>,
    state: &'a mut BodyState,
}

impl<'a, R> ContentStream<'a, R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: &'a mut NetworkReader<R>, state: &'a mut BodyState) -> Self {
        Self { reader, state }
    }

    #[inline]
    pub fn full_length(&self) -> u64 {
        self.state.full_length()
    }

    #[inline]
    pub fn unread_bytes(&self) -> u64 {
        self.state.unread_bytes()
    }

    /// Reads at most `dst.len()` bytes, clamped to the unread remainder of the body.
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let unread = self.state.unread_bytes();
        if unread == 0 {
            return Ok(0);
        }

        let len = usize::try_from(unread).map_or(dst.len(), |unread| unread.min(dst.len()));
        let read = self.reader.read(&mut dst[..len]).await?;
        self.state.read_bytes += read as u64;
        Ok(read)
    }

    /// Reads the whole unread remainder of the body into memory.
    pub async fn read_to_end(&mut self) -> io::Result<Bytes> {
        let unread = usize::try_from(self.state.unread_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "request body does not fit in memory"))?;

        let bytes = self.reader.read_bytes(unread).await?;
        self.state.read_bytes += bytes.len() as u64;
        if bytes.len() < unread {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed within request body"));
        }
        Ok(bytes)
    }

    /// Drains every unread byte of the body. Calling it again is a no-op.
    pub async fn discard(&mut self) -> io::Result<()> {
        if self.state.unread_bytes() == 0 {
            return Ok(());
        }

        trace!(unread = self.state.unread_bytes(), "discard unread request content");
        let mut scratch = BytesMut::zeroed(self.reader.block_size());
        while self.state.unread_bytes() > 0 {
            if self.read(&mut scratch).await? == 0 {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed within request body"));
            }
        }
        Ok(())
    }
}
