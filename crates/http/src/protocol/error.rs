use std::error::Error;
use std::io;

use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("websocket error: {source}")]
    WebSocketError {
        #[from]
        source: WebSocketError,
    },

    #[error("service error: {source}")]
    ServiceError { source: Box<dyn Error + Send + Sync> },
}

impl HttpError {
    pub fn service<E: Into<Box<dyn Error + Send + Sync>>>(e: E) -> Self {
        Self::ServiceError { source: e.into() }
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid request line: {reason}")]
    InvalidRequestLine { reason: String },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0}")]
    InvalidVersion(String),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("marker length {marker_len} exceed half of the buffer size {buffer_size}")]
    MarkerTooLong { marker_len: usize, buffer_size: usize },

    #[error("no request data received within {waited_ms}ms")]
    Timeout { waited_ms: u128 },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_request_line<S: ToString>(str: S) -> Self {
        Self::InvalidRequestLine { reason: str.to_string() }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status a client sees when its request failed with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ParseError::TooLargeHeader { .. } | ParseError::TooManyHeaders { .. } => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            ParseError::Timeout { .. } => StatusCode::REQUEST_TIMEOUT,
            ParseError::MarkerTooLong { .. } | ParseError::Io { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

#[derive(Error, Debug)]
pub enum WebSocketError {
    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    #[error("unsupported websocket version: {version}")]
    UnsupportedVersion { version: String },

    #[error("protocol violation: {reason}")]
    Protocol { reason: String },

    #[error("payload too large, length: {length} exceed the limit {max_size}")]
    PayloadTooLarge { length: u64, max_size: usize },

    #[error("connection already closed")]
    Closed,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl WebSocketError {
    pub fn handshake<S: ToString>(str: S) -> Self {
        Self::Handshake { reason: str.to_string() }
    }

    pub fn protocol<S: ToString>(str: S) -> Self {
        Self::Protocol { reason: str.to_string() }
    }

    pub fn payload_too_large(length: u64, max_size: usize) -> Self {
        Self::PayloadTooLarge { length, max_size }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("invalid range header: {reason}")]
    Invalid { reason: String },

    #[error("range not satisfiable for length {length}")]
    NotSatisfiable { length: u64 },
}

impl RangeError {
    pub fn invalid<S: ToString>(str: S) -> Self {
        Self::Invalid { reason: str.to_string() }
    }
}
