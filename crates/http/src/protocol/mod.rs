//! Core HTTP protocol abstractions.
//!
//! This module provides the types shared by every stage of the pipeline:
//!
//! - **Request Processing** ([`request`]): [`RawRequestHead`] as read from the wire and
//!   the typed [`RequestHeader`] produced from it
//! - **Response Processing** ([`response`]): [`ResponseHead`] built up by the services
//! - **Payload framing** ([`PayloadSize`]): how a response body goes on the wire
//! - **Error Handling** ([`error`]): [`HttpError`], [`ParseError`], [`SendError`],
//!   [`WebSocketError`] and [`RangeError`]

mod payload;
pub use payload::PayloadItem;
pub use payload::PayloadSize;

mod request;
pub use request::RawRequestHead;
pub use request::RequestHeader;

mod response;
pub(crate) use response::{CLOSE, KEEP_ALIVE};
pub use response::ResponseHead;
pub use response::is_keep_alive;
pub use response::status_allows_body;

mod error;
pub use error::HttpError;
pub use error::ParseError;
pub use error::RangeError;
pub use error::SendError;
pub use error::WebSocketError;
