use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use mime::Mime;
use tokio::io::AsyncWriteExt;

use crate::source::{DataSink, HttpDataSource};

/// Bytes or text kept in memory.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
    mime: Option<Mime>,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into(), mime: None }
    }

    /// A `text/plain; charset=utf-8` source.
    pub fn text(text: impl Into<String>) -> Self {
        Self { data: Bytes::from(text.into()), mime: Some(mime::TEXT_PLAIN_UTF_8) }
    }

    #[must_use]
    pub fn with_mime(mut self, mime: Mime) -> Self {
        self.mime = Some(mime);
        self
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

#[async_trait]
impl HttpDataSource for BytesSource {
    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }

    fn mime_type(&self) -> Option<Mime> {
        self.mime.clone()
    }

    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        let len = self.data.len();
        let start = usize::try_from(start).map_or(len, |start| start.min(len));
        let stop = stop.and_then(|stop| usize::try_from(stop).ok()).map_or(len, |stop| stop.min(len));
        if start >= stop {
            return Ok(0);
        }

        sink.write_all(&self.data[start..stop]).await?;
        Ok((stop - start) as u64)
    }
}
