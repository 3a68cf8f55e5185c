//! Byte ranges (`Range: bytes=…`) and the sources serving them.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use mime::Mime;
use tokio::io::AsyncWriteExt;

use crate::ensure;
use crate::protocol::RangeError;
use crate::source::{DataSink, HttpDataSource, WindowWriter};

/// A half-open byte range `start..end` of a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    /// The `Content-Range` value of this range within a body of `total` bytes.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{total}", self.start, self.end - 1)
    }
}

/// The satisfiable ranges of one `Range` header, sorted and merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
    total: u64,
}

impl RangeSet {
    /// Parses a `bytes=` range header against a body of `total` bytes.
    ///
    /// Ranges closer to each other than `join_gap` bytes are merged into one, so the returned
    /// ranges are ascending and never overlap. A range starting or ending beyond the body makes
    /// the whole header unsatisfiable.
    pub fn parse(header: &str, total: u64, join_gap: u64) -> Result<Self, RangeError> {
        let Some(specs) = header.trim().strip_prefix("bytes=") else {
            return Err(RangeError::invalid(format!("unsupported range unit in '{header}'")));
        };

        let mut ranges = specs
            .split(',')
            .map(str::trim)
            .filter(|spec| !spec.is_empty())
            .map(|spec| parse_spec(spec, total))
            .collect::<Result<Vec<_>, _>>()?;
        ensure!(!ranges.is_empty(), RangeError::invalid("empty range set"));

        ranges.sort_unstable();
        let mut merged: Vec<ByteRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if range.start <= last.end.saturating_add(join_gap) => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }

        Ok(Self { ranges: merged, total })
    }

    pub fn ranges(&self) -> &[ByteRange] {
        &self.ranges
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn is_single(&self) -> bool {
        self.ranges.len() == 1
    }
}

fn parse_spec(spec: &str, total: u64) -> Result<ByteRange, RangeError> {
    let Some((first, last)) = spec.split_once('-') else {
        return Err(RangeError::invalid(format!("missing '-' in '{spec}'")));
    };
    let number = |s: &str| s.trim().parse::<u64>().map_err(|_| RangeError::invalid(format!("bad position in '{spec}'")));
    let not_satisfiable = RangeError::NotSatisfiable { length: total };

    match (first.trim().is_empty(), last.trim().is_empty()) {
        // suffix range: the last n bytes
        (true, false) => {
            let suffix = number(last)?;
            ensure!(suffix > 0 && total > 0, not_satisfiable);
            Ok(ByteRange::new(total - suffix.min(total), total))
        }
        (false, true) => {
            let start = number(first)?;
            ensure!(start < total, not_satisfiable);
            Ok(ByteRange::new(start, total))
        }
        (false, false) => {
            let (start, end) = (number(first)?, number(last)?);
            ensure!(start <= end, RangeError::invalid(format!("reversed range '{spec}'")));
            ensure!(end < total, not_satisfiable);
            Ok(ByteRange::new(start, end + 1))
        }
        (true, true) => Err(RangeError::invalid(format!("empty range '{spec}'"))),
    }
}

/// One range of another source.
#[derive(Debug)]
pub struct RangeSource<S> {
    inner: S,
    range: ByteRange,
}

impl<S: HttpDataSource> RangeSource<S> {
    pub fn new(inner: S, range: ByteRange) -> Self {
        Self { inner, range }
    }

    pub fn range(&self) -> ByteRange {
        self.range
    }
}

#[async_trait]
impl<S: HttpDataSource> HttpDataSource for RangeSource<S> {
    fn length(&self) -> Option<u64> {
        Some(self.range.len())
    }

    fn mime_type(&self) -> Option<Mime> {
        self.inner.mime_type()
    }

    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        let len = self.range.len();
        let stop = stop.map_or(len, |stop| stop.min(len));
        if start >= stop {
            return Ok(0);
        }
        self.inner.write_to(sink, self.range.start + start, Some(self.range.start + stop)).await
    }
}

/// A `multipart/byteranges` body with one part per range.
pub struct MultiRangeSource<S> {
    inner: S,
    ranges: Vec<ByteRange>,
    total: u64,
    boundary: String,
    part_type: Option<Mime>,
    length: u64,
}

impl<S: HttpDataSource> MultiRangeSource<S> {
    pub fn new(inner: S, ranges: &RangeSet) -> Self {
        Self::with_boundary(inner, ranges, next_boundary())
    }

    pub fn with_boundary(inner: S, ranges: &RangeSet, boundary: String) -> Self {
        let mut source = Self {
            part_type: inner.mime_type(),
            inner,
            ranges: ranges.ranges().to_vec(),
            total: ranges.total(),
            boundary,
            length: 0,
        };
        source.length = source.ranges.iter().map(|range| source.part_head(range).len() as u64 + range.len()).sum::<u64>()
            + source.tail().len() as u64;
        source
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    fn part_head(&self, range: &ByteRange) -> String {
        let mut head = format!("\r\n--{}\r\n", self.boundary);
        if let Some(part_type) = &self.part_type {
            head.push_str(&format!("Content-Type: {part_type}\r\n"));
        }
        head.push_str(&format!("Content-Range: {}\r\n\r\n", range.content_range(self.total)));
        head
    }

    fn tail(&self) -> String {
        format!("\r\n--{}--\r\n", self.boundary)
    }

    async fn write_parts(&mut self, sink: &mut DataSink<'_>) -> io::Result<()> {
        for index in 0..self.ranges.len() {
            let range = self.ranges[index];
            sink.write_all(self.part_head(&range).as_bytes()).await?;
            let written = self.inner.write_to(sink, range.start, Some(range.end)).await?;
            if written != range.len() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "data source ended within a range"));
            }
        }
        sink.write_all(self.tail().as_bytes()).await
    }
}

impl<S> fmt::Debug for MultiRangeSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiRangeSource")
            .field("ranges", &self.ranges)
            .field("total", &self.total)
            .field("boundary", &self.boundary)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<S: HttpDataSource> HttpDataSource for MultiRangeSource<S> {
    fn length(&self) -> Option<u64> {
        Some(self.length)
    }

    fn mime_type(&self) -> Option<Mime> {
        format!("multipart/byteranges; boundary={}", self.boundary).parse().ok()
    }

    async fn write_to(&mut self, sink: &mut DataSink<'_>, start: u64, stop: Option<u64>) -> io::Result<u64> {
        let mut window = WindowWriter::new(sink, start, stop);
        self.write_parts(&mut window).await?;
        Ok(window.forwarded())
    }
}

fn next_boundary() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_nanos() as u64);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:016x}{count:08x}", nanos ^ count.rotate_left(32))
}
