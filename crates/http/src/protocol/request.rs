//! HTTP request header handling implementation.
//!
//! Requests are read in two steps. The request reader collects the request line and the
//! header lines verbatim into a [`RawRequestHead`], and the request parser then converts
//! that raw form into a typed [`RequestHeader`] backed by `http::Request<()>`.

use http::request::Parts;
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version, header};

use crate::protocol::ParseError;

/// The request line and header lines exactly as they were received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RawRequestHead {
    /// Splits a request line of the form `METHOD SP request-target SP HTTP-version`.
    pub fn from_request_line(line: &str) -> Result<Self, ParseError> {
        let mut parts = line.split(' ').filter(|part| !part.is_empty());
        let (Some(method), Some(target), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ParseError::invalid_request_line(line));
        };

        Ok(Self { method: method.to_string(), target: target.to_string(), version: version.to_string(), headers: vec![] })
    }

    /// Adds a `Name: value` header line; a line without a colon is rejected.
    pub fn push_header_line(&mut self, line: &str) -> Result<(), ParseError> {
        let Some((name, value)) = line.split_once(':') else {
            return Err(ParseError::invalid_header(format!("missing colon in header line '{line}'")));
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(ParseError::invalid_header("empty header name"));
        }

        self.headers.push((name.to_string(), value.trim().to_string()));
        Ok(())
    }

    /// Returns the first value of a header, matching names case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(key, _)| key.eq_ignore_ascii_case(name)).map(|(_, value)| value.as_str())
    }
}

/// Represents an HTTP request header.
///
/// This struct wraps a `http::Request<()>` to provide:
/// - Access to standard HTTP header fields
/// - Conversion from the raw request head
/// - Body attachment capabilities
/// - Request metadata inspection
#[derive(Debug)]
pub struct RequestHeader {
    inner: Request<()>,
}

impl AsRef<Request<()>> for RequestHeader {
    fn as_ref(&self) -> &Request<()> {
        &self.inner
    }
}

impl AsMut<Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> Request<T> {
        self.inner.map(|()| body)
    }

    /// Returns a reference to the request's HTTP method.
    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    /// Returns a reference to the request's URI.
    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    /// Returns the request's HTTP version.
    pub fn version(&self) -> Version {
        self.inner.version()
    }

    /// Returns a reference to the request's headers.
    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Determines if this request requires a body based on its HTTP method.
    ///
    /// Returns false for methods that typically don't have bodies:
    /// - GET
    /// - HEAD
    /// - DELETE
    /// - OPTIONS
    /// - CONNECT
    pub fn need_body(&self) -> bool {
        !matches!(self.method(), &Method::GET | &Method::HEAD | &Method::DELETE | &Method::OPTIONS | &Method::CONNECT)
    }

    /// Whether the client asked to keep the connection open after this request.
    ///
    /// HTTP/1.1 connections are persistent unless `Connection: close` is sent,
    /// HTTP/1.0 connections only with an explicit `Connection: keep-alive`.
    pub fn keep_alive_requested(&self) -> bool {
        let has_token = |token: &str| {
            self.headers()
                .get_all(header::CONNECTION)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .any(|value| value.trim().eq_ignore_ascii_case(token))
        };

        match self.version() {
            Version::HTTP_11 => !has_token("close"),
            Version::HTTP_10 => has_token("keep-alive"),
            _ => false,
        }
    }
}

/// Converts request parts into a RequestHeader.
impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: Request::from_parts(parts, ()) }
    }
}

/// Converts a bodyless request into a RequestHeader.
impl From<Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: Request<()>) -> Self {
        Self { inner }
    }
}

/// Converts a raw request head into a typed header.
///
/// Method, target and version are validated here; duplicate header names are appended
/// so every occurrence stays available, while `get` keeps returning the first one.
impl TryFrom<RawRequestHead> for RequestHeader {
    type Error = ParseError;

    fn try_from(raw: RawRequestHead) -> Result<Self, Self::Error> {
        let method = Method::from_bytes(raw.method.as_bytes()).map_err(|_| ParseError::InvalidMethod)?;
        let uri = raw.target.parse::<Uri>().map_err(|_| ParseError::InvalidUri)?;
        let version = parse_version(&raw.version)?;

        let mut request = Request::new(());
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.version_mut() = version;

        let headers = request.headers_mut();
        headers.reserve(raw.headers.len());
        for (name, value) in raw.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ParseError::invalid_header(format!("invalid header name '{name}'")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|_| ParseError::invalid_header(format!("invalid value for header '{name}'")))?;
            headers.append(name, value);
        }

        Ok(RequestHeader { inner: request })
    }
}

fn parse_version(version: &str) -> Result<Version, ParseError> {
    match version {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        // http2 and http3 currently not support
        _ => Err(ParseError::InvalidVersion(version.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use http::{HeaderValue, Method, Version};
    use indoc::indoc;

    use super::*;

    fn raw_head(text: &str) -> RawRequestHead {
        let mut lines = text.lines();
        let mut raw = RawRequestHead::from_request_line(lines.next().unwrap()).unwrap();
        for line in lines.take_while(|line| !line.is_empty()) {
            raw.push_header_line(line).unwrap();
        }
        raw
    }

    #[test]
    fn from_curl() {
        let str = indoc! {r##"
        GET /index.html HTTP/1.1
        Host: 127.0.0.1:8080
        User-Agent: curl/7.79.1
        Accept: */*

        "##};

        let header = RequestHeader::try_from(raw_head(str)).unwrap();

        assert_eq!(header.method(), &Method::GET);
        assert_eq!(header.version(), Version::HTTP_11);
        assert_eq!(header.uri().host(), None);
        assert_eq!(header.uri().path(), "/index.html");
        assert_eq!(header.uri().scheme(), None);
        assert_eq!(header.uri().query(), None);

        assert_eq!(header.headers().len(), 3);

        assert_eq!(header.headers().get(http::header::ACCEPT), Some(&HeaderValue::from_str("*/*").unwrap()));
        assert_eq!(header.headers().get(http::header::HOST), Some(&HeaderValue::from_str("127.0.0.1:8080").unwrap()));
        assert_eq!(header.headers().get(http::header::USER_AGENT), Some(&HeaderValue::from_str("curl/7.79.1").unwrap()));
        assert!(header.keep_alive_requested());
    }

    #[test]
    fn from_edge() {
        let str = indoc! {r##"
        GET /index/?a=1&b=2&a=3 HTTP/1.1
        Host: 127.0.0.1:8080
        Connection: keep-alive
        Cache-Control: max-age=0
        sec-ch-ua: "#Not_A Brand";v="99", "Microsoft Edge";v="109", "Chromium";v="109"
        sec-ch-ua-mobile: ?0
        sec-ch-ua-platform: "macOS"
        Accept-Encoding: gzip, deflate, br
        Accept-Language: zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7

        "##};

        let header = RequestHeader::try_from(raw_head(str)).unwrap();

        assert_eq!(header.uri().path(), "/index/");
        assert_eq!(header.uri().query(), Some("a=1&b=2&a=3"));
        assert_eq!(header.headers().len(), 8);

        assert_eq!(
            header.headers().get("sec-ch-ua"),
            Some(&HeaderValue::from_str(r##""#Not_A Brand";v="99", "Microsoft Edge";v="109", "Chromium";v="109""##).unwrap())
        );
        assert_eq!(header.headers().get("sec-ch-ua-platform"), Some(&HeaderValue::from_str("\"macOS\"").unwrap()));
        assert_eq!(
            header.headers().get(http::header::ACCEPT_LANGUAGE),
            Some(&HeaderValue::from_str("zh-CN,zh;q=0.9,en-US;q=0.8,en;q=0.7").unwrap())
        );
    }

    #[test]
    fn duplicate_headers_first_wins() {
        let mut raw = RawRequestHead::from_request_line("GET / HTTP/1.1").unwrap();
        raw.push_header_line("X-Token: first").unwrap();
        raw.push_header_line("x-token: second").unwrap();

        assert_eq!(raw.header("X-TOKEN"), Some("first"));

        let header = RequestHeader::try_from(raw).unwrap();
        assert_eq!(header.headers().get("x-token").unwrap(), "first");
        assert_eq!(header.headers().get_all("x-token").iter().count(), 2);
    }

    #[test]
    fn reject_malformed_lines() {
        assert!(matches!(RawRequestHead::from_request_line("GET /"), Err(ParseError::InvalidRequestLine { .. })));
        assert!(matches!(
            RawRequestHead::from_request_line("GET / HTTP/1.1 extra"),
            Err(ParseError::InvalidRequestLine { .. })
        ));

        let mut raw = RawRequestHead::from_request_line("GET / HTTP/1.1").unwrap();
        assert!(matches!(raw.push_header_line("no colon here"), Err(ParseError::InvalidHeader { .. })));
    }

    #[test]
    fn reject_bad_version_and_method() {
        let raw = RawRequestHead::from_request_line("GET / HTTP/2.0").unwrap();
        assert!(matches!(RequestHeader::try_from(raw), Err(ParseError::InvalidVersion(_))));

        let raw = RawRequestHead::from_request_line("G(T / HTTP/1.1").unwrap();
        assert!(matches!(RequestHeader::try_from(raw), Err(ParseError::InvalidMethod)));
    }

    #[test]
    fn http10_keep_alive() {
        let raw = RawRequestHead::from_request_line("GET / HTTP/1.0").unwrap();
        assert!(!RequestHeader::try_from(raw).unwrap().keep_alive_requested());

        let mut raw = RawRequestHead::from_request_line("GET / HTTP/1.0").unwrap();
        raw.push_header_line("Connection: Keep-Alive").unwrap();
        assert!(RequestHeader::try_from(raw).unwrap().keep_alive_requested());
    }
}
