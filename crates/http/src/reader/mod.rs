//! Buffered reading of the connection's byte stream.
//!
//! - [`NetworkReader`]: one cursor serving characters (for the request head) and raw bytes
//!   (for bodies and WebSocket frames) without losing data between the two views
//! - [`ContentStream`]: a body-bounded view over the reader

mod content_stream;
mod network_reader;

pub use content_stream::BodyState;
pub use content_stream::ContentStream;
pub use network_reader::DEFAULT_BLOCK_SIZE;
pub use network_reader::NetworkReader;
