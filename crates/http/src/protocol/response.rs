//! HTTP response header handling implementation.
//!
//! The pipeline builds the response head up across several stages before any body
//! is attached, so the head is represented by `http::Response<()>`.

use http::{HeaderValue, Response, StatusCode, header};

/// Type alias for HTTP response headers.
///
/// This type represents the header portion of an HTTP response, using
/// `http::Response<()>` with an empty body placeholder. The body is carried
/// separately by the task's document data sources.
pub type ResponseHead = Response<()>;

/// Whether a response with this status is allowed to carry a body.
pub fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

/// Whether the response declared `Connection: keep-alive`.
pub fn is_keep_alive(head: &ResponseHead) -> bool {
    head.headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("keep-alive"))
}

pub(crate) const KEEP_ALIVE: HeaderValue = HeaderValue::from_static("keep-alive");
pub(crate) const CLOSE: HeaderValue = HeaderValue::from_static("close");
