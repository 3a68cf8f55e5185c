//! Opening handshake helpers, see
//! [RFC 6455 Section 4.2](https://datatracker.ietf.org/doc/html/rfc6455#section-4.2).

use base64::prelude::{BASE64_STANDARD, Engine as _};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Version};
use sha1::{Digest, Sha1};

use crate::protocol::{RequestHeader, ResponseHead, WebSocketError};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
pub const WEBSOCKET_VERSION: &str = "13";

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.trim().as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

fn has_token(headers: &HeaderMap, name: http::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

/// Checks an upgrade request and returns its `Sec-WebSocket-Key`.
///
/// A missing or different `Sec-WebSocket-Version` yields [`WebSocketError::UnsupportedVersion`],
/// every other failure [`WebSocketError::Handshake`].
pub fn validate_upgrade(request: &RequestHeader) -> Result<String, WebSocketError> {
    if *request.method() != Method::GET {
        return Err(WebSocketError::handshake("upgrade requires the GET method"));
    }
    if request.version() != Version::HTTP_11 {
        return Err(WebSocketError::handshake("upgrade requires HTTP/1.1"));
    }

    let headers = request.headers();
    if !has_token(headers, UPGRADE, "websocket") {
        return Err(WebSocketError::handshake("missing 'Upgrade: websocket'"));
    }
    if !has_token(headers, CONNECTION, "upgrade") {
        return Err(WebSocketError::handshake("missing 'Connection: upgrade'"));
    }

    let version = headers.get(SEC_WEBSOCKET_VERSION).and_then(|value| value.to_str().ok()).map(str::trim);
    if version != Some(WEBSOCKET_VERSION) {
        return Err(WebSocketError::UnsupportedVersion { version: version.unwrap_or_default().to_string() });
    }

    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or_else(|| WebSocketError::handshake("missing Sec-WebSocket-Key"))?;

    match BASE64_STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => Ok(key.to_string()),
        _ => Err(WebSocketError::handshake("Sec-WebSocket-Key must be a base64 encoded 16 byte nonce")),
    }
}

/// Sub-protocols offered by the client, in the client's order of preference.
pub fn offered_protocols(request: &RequestHeader) -> Vec<String> {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|protocol| !protocol.is_empty())
        .map(str::to_string)
        .collect()
}

/// Turns `response` into the `101 Switching Protocols` answer.
pub fn write_accept(response: &mut ResponseHead, key: &str, protocol: Option<&str>) -> Result<(), WebSocketError> {
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));

    let accept = HeaderValue::from_str(&accept_key(key)).map_err(WebSocketError::handshake)?;
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);

    if let Some(protocol) = protocol {
        let protocol = HeaderValue::from_str(protocol).map_err(WebSocketError::handshake)?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use http::Request;

    use super::*;

    fn upgrade_request(version: &str) -> RequestHeader {
        Request::get("/chat")
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_VERSION, version)
            .header(SEC_WEBSOCKET_PROTOCOL, "chat, superchat")
            .body(())
            .unwrap()
            .into()
    }

    #[test]
    fn rfc_accept_key() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn valid_upgrade() {
        let request = upgrade_request("13");
        assert_eq!(validate_upgrade(&request).unwrap(), "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(offered_protocols(&request), ["chat", "superchat"]);
    }

    #[test]
    fn wrong_version() {
        let err = validate_upgrade(&upgrade_request("8")).unwrap_err();
        assert!(matches!(err, WebSocketError::UnsupportedVersion { version } if version == "8"));
    }

    #[test]
    fn missing_upgrade_headers() {
        let request: RequestHeader = Request::get("/chat")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap()
            .into();
        assert!(matches!(validate_upgrade(&request), Err(WebSocketError::Handshake { .. })));

        let request: RequestHeader = Request::post("/chat")
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "upgrade")
            .body(())
            .unwrap()
            .into();
        assert!(matches!(validate_upgrade(&request), Err(WebSocketError::Handshake { .. })));
    }

    #[test]
    fn bad_key() {
        let request: RequestHeader = Request::get("/chat")
            .header(UPGRADE, "websocket")
            .header(CONNECTION, "upgrade")
            .header(SEC_WEBSOCKET_KEY, "short")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .body(())
            .unwrap()
            .into();
        assert!(matches!(validate_upgrade(&request), Err(WebSocketError::Handshake { .. })));
    }

    #[test]
    fn accept_response() {
        let mut response = ResponseHead::default();
        write_accept(&mut response, "dGhlIHNhbXBsZSBub25jZQ==", Some("chat")).unwrap();

        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[SEC_WEBSOCKET_ACCEPT], "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(response.headers()[SEC_WEBSOCKET_PROTOCOL], "chat");
        assert_eq!(response.headers()[UPGRADE], "websocket");
    }
}
