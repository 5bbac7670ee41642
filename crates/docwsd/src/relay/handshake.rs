//! WebSocket handshake validation.
//!
//! Runs before the upgrade so each malformed handshake gets a specific,
//! logged `400 Bad Request`.

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use docwsd_protocol::WEBSOCKET_VERSION;
use thiserror::Error;

/// Ways a WebSocket handshake can be malformed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("no WebSocket handshake")]
    NoHandshake,

    #[error("missing Sec-WebSocket-Version in handshake request")]
    MissingVersion,

    #[error("unsupported WebSocket version requested")]
    UnsupportedVersion,

    #[error("missing Sec-WebSocket-Key in handshake request")]
    MissingKey,
}

impl IntoResponse for HandshakeError {
    fn into_response(self) -> Response {
        let mut response = StatusCode::BAD_REQUEST.into_response();
        if self == Self::UnsupportedVersion {
            response.headers_mut().insert(
                header::SEC_WEBSOCKET_VERSION,
                HeaderValue::from_static(WEBSOCKET_VERSION),
            );
        }
        response
            .headers_mut()
            .insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        response
    }
}

/// Check the upgrade headers of a request.
pub fn verify(headers: &HeaderMap) -> Result<(), HandshakeError> {
    let upgrade = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    let connection = headers
        .get(header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
    if !upgrade || !connection {
        return Err(HandshakeError::NoHandshake);
    }

    match headers.get(header::SEC_WEBSOCKET_VERSION) {
        None => return Err(HandshakeError::MissingVersion),
        Some(version) if version.as_bytes() != WEBSOCKET_VERSION.as_bytes() => {
            return Err(HandshakeError::UnsupportedVersion);
        }
        Some(_) => {}
    }

    if !headers.contains_key(header::SEC_WEBSOCKET_KEY) {
        return Err(HandshakeError::MissingKey);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, Upgrade"));
        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
        headers.insert(
            header::SEC_WEBSOCKET_KEY,
            HeaderValue::from_static("dGhlIHNhbXBsZSBub25jZQ=="),
        );
        headers
    }

    #[test]
    fn test_valid_handshake() {
        assert_eq!(verify(&handshake()), Ok(()));
    }

    #[test]
    fn test_missing_upgrade() {
        let mut headers = handshake();
        headers.remove(header::UPGRADE);
        assert_eq!(verify(&headers), Err(HandshakeError::NoHandshake));

        let mut headers = handshake();
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
        assert_eq!(verify(&headers), Err(HandshakeError::NoHandshake));
    }

    #[test]
    fn test_version_checks() {
        let mut headers = handshake();
        headers.remove(header::SEC_WEBSOCKET_VERSION);
        assert_eq!(verify(&headers), Err(HandshakeError::MissingVersion));

        headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("8"));
        assert_eq!(verify(&headers), Err(HandshakeError::UnsupportedVersion));
    }

    #[test]
    fn test_missing_key() {
        let mut headers = handshake();
        headers.remove(header::SEC_WEBSOCKET_KEY);
        assert_eq!(verify(&headers), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn test_error_responses() {
        let response = HandshakeError::UnsupportedVersion.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[header::SEC_WEBSOCKET_VERSION], "13");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "0");

        let response = HandshakeError::MissingKey.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!response.headers().contains_key(header::SEC_WEBSOCKET_VERSION));
    }
}
