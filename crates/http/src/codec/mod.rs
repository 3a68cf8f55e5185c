//! HTTP codec module for encoding outgoing HTTP messages
//!
//! Requests are read line by line through the [`NetworkReader`](crate::reader::NetworkReader);
//! this module covers the write side:
//!
//! - [`HeaderEncoder`]: serialises the status line and headers, deriving the framing headers
//!   from a [`PayloadSize`](crate::protocol::PayloadSize)
//! - [`ChunkedEncoder`]: chunked transfer encoding for bodies of unknown length

mod chunked_encoder;
mod header_encoder;

pub use chunked_encoder::ChunkedEncoder;
pub use header_encoder::HeaderEncoder;
