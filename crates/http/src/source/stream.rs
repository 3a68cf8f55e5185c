use std::io;
use std::io::SeekFrom;

use async_trait::async_trait;
use mime::Mime;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::source::{DataSink, HttpDataSource};

/// A seekable stream of known length, typically a file.
///
/// Every write seeks to the requested start, so the same source can serve several ranges.
#[derive(Debug)]
pub struct StreamSource<S> {
    stream: S,
    length: u64,
    mime: Option<Mime>,
}

impl<S> StreamSource<S>
where
    S: AsyncRead + AsyncSeek + Send + Unpin,
{
    pub fn new(stream: S, length: u64) -> Self {
        Self { stream, length, mime: None }
    }

    #[must_use]
    pub fn with_mime(mut self, mime: Mime) -> Self {
        self.mime = Some(mime);
        self
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl StreamSource<File> {
    /// Serves an opened file, taking its length from the file metadata.
    pub async fn from_file(file: File) -> io::Result<Self> {
        let length = file.metadata().await?.len();
        Ok(Self::new(file, length))
    }
}

#[async_trait]
impl<S> HttpDataSource for StreamSource<S>
where
    S: AsyncRead + AsyncSeek + Send + Unpin,
{
    fn length(&self) -> Option<u64> {
        Some(self.length)
    }

    fn mime_type(&self) -> Option<Mime> {
        self.mime.clone()
    }

    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        let stop = stop.map_or(self.length, |stop| stop.min(self.length));
        if start >= stop {
            return Ok(0);
        }

        self.stream.seek(SeekFrom::Start(start)).await?;
        let mut window = (&mut self.stream).take(stop - start);
        tokio::io::copy(&mut window, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn seeks_to_each_window() {
        let mut source = StreamSource::new(Cursor::new(b"0123456789".to_vec()), 10);

        let mut out = Vec::new();
        assert_eq!(source.write_to(&mut out, 7, None).await.unwrap(), 3);
        assert_eq!(out, b"789");

        let mut out = Vec::new();
        assert_eq!(source.write_to(&mut out, 1, Some(4)).await.unwrap(), 3);
        assert_eq!(out, b"123");
    }
}
