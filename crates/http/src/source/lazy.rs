use std::fmt;
use std::io;

use async_trait::async_trait;

use crate::source::{DataSink, HttpDataSource, WindowWriter};

type SourceIter = Box<dyn Iterator<Item = Box<dyn HttpDataSource>> + Send>;

/// A composite of sources that are only created while the body is written.
///
/// The total length is unknown upfront, so the body is sent chunked.
pub struct LazySource {
    sources: Option<SourceIter>,
}

impl LazySource {
    pub fn new<I>(sources: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn HttpDataSource>>,
        I::IntoIter: Send + 'static,
    {
        Self { sources: Some(Box::new(sources.into_iter())) }
    }
}

impl fmt::Debug for LazySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazySource").field("consumed", &self.sources.is_none()).finish()
    }
}

#[async_trait]
impl HttpDataSource for LazySource {
    fn length(&self) -> Option<u64> {
        None
    }

    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        let Some(sources) = self.sources.take() else {
            return Err(io::Error::new(io::ErrorKind::Unsupported, "lazy source was already written"));
        };

        let mut window = WindowWriter::new(sink, start, stop);
        for mut source in sources {
            if window.is_done() {
                break;
            }
            source.write_to(&mut window, 0, None).await?;
        }
        Ok(window.forwarded())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::BytesSource;

    fn parts() -> Vec<Box<dyn HttpDataSource>> {
        vec![Box::new(BytesSource::new("one,")), Box::new(BytesSource::new("two,")), Box::new(BytesSource::new("three"))]
    }

    #[tokio::test]
    async fn writes_every_part_in_order() {
        let mut source = LazySource::new(parts());
        assert_eq!(source.length(), None);

        let mut out = Vec::new();
        assert_eq!(source.write_to(&mut out, 0, None).await.unwrap(), 13);
        assert_eq!(out, b"one,two,three");

        assert!(source.write_to(&mut out, 0, None).await.is_err());
    }

    #[tokio::test]
    async fn window_spans_parts() {
        let mut source = LazySource::new(parts());
        let mut out = Vec::new();
        assert_eq!(source.write_to(&mut out, 2, Some(10)).await.unwrap(), 8);
        assert_eq!(out, b"e,two,th");
    }
}
