use std::error::Error;
use std::io;

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use http_body::Body;
use http_body_util::BodyExt;
use mime::Mime;
use tokio::io::AsyncWriteExt;

use crate::source::{DataSink, HttpDataSource};

/// Exposes any [`http_body::Body`] as a data source.
///
/// A body can only be read forward, so successive writes must request ascending,
/// non-overlapping windows, which is what range responses do.
#[derive(Debug)]
pub struct BodySource<B> {
    body: B,
    length: Option<u64>,
    mime: Option<Mime>,
    pending: Bytes,
    position: u64,
}

impl<B> BodySource<B>
where
    B: Body + Send + Unpin,
    B::Data: Send,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    pub fn new(body: B) -> Self {
        let length = body.size_hint().exact();
        Self { body, length, mime: None, pending: Bytes::new(), position: 0 }
    }

    #[must_use]
    pub fn with_mime(mut self, mime: Mime) -> Self {
        self.mime = Some(mime);
        self
    }
}

#[async_trait]
impl<B> HttpDataSource for BodySource<B>
where
    B: Body + Send + Unpin,
    B::Data: Send,
    B::Error: Into<Box<dyn Error + Send + Sync>>,
{
    fn length(&self) -> Option<u64> {
        self.length
    }

    fn mime_type(&self) -> Option<Mime> {
        self.mime.clone()
    }

    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        if start < self.position {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "body source cannot rewind"));
        }

        let mut written = 0;
        loop {
            if stop.is_some_and(|stop| self.position >= stop) {
                break;
            }

            if self.pending.is_empty() {
                match self.body.frame().await {
                    None => break,
                    Some(Err(e)) => return Err(io::Error::other(e)),
                    Some(Ok(frame)) => {
                        if let Ok(mut data) = frame.into_data() {
                            self.pending = data.copy_to_bytes(data.remaining());
                        }
                        continue;
                    }
                }
            }

            if self.position < start {
                let skip = usize::try_from(start - self.position).map_or(self.pending.len(), |n| n.min(self.pending.len()));
                self.pending.advance(skip);
                self.position += skip as u64;
                continue;
            }

            let len = stop
                .and_then(|stop| usize::try_from(stop - self.position).ok())
                .map_or(self.pending.len(), |n| n.min(self.pending.len()));
            sink.write_all(&self.pending[..len]).await?;
            self.pending.advance(len);
            self.position += len as u64;
            written += len as u64;
        }

        Ok(written)
    }
}
