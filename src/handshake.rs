//! Client handshake (RFC 6455 §4, RFC 8441).
//!
//! [`build_handshake`] produces the request the caller's HTTP client must
//! issue (a GET upgrade on HTTP/1.1, an extended CONNECT on HTTP/2) plus
//! an opaque context. Once the response status and headers arrive,
//! [`finalize_handshake`] validates them and produces the [`Connection`]
//! that encodes and decodes frames.

use base64::prelude::*;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use sha1::{Digest, Sha1};

use crate::{
    connection::Connection,
    extension::{self, ExtensionOffer},
    Result, WebSocketError,
};

/// The HTTP version the handshake will run over, as reported by the
/// caller's HTTP client.
pub enum HttpProtocol {
    /// HTTP/1.1 upgrade (RFC 6455 §4.1).
    Http1,
    /// HTTP/2 extended CONNECT (RFC 8441). `connect_protocol_enabled` is
    /// the server's `SETTINGS_ENABLE_CONNECT_PROTOCOL` value (setting id
    /// 0x8); without it the request must not be issued.
    Http2 { connect_protocol_enabled: bool },
}

/// Scheme of the request target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The request the caller's HTTP client should issue verbatim.
///
/// On HTTP/2, `protocol` carries the value of the `:protocol`
/// pseudo-header; on HTTP/1.1 it is `None` and `method` is GET.
pub struct HandshakeRequest {
    pub method: Method,
    pub scheme: Scheme,
    pub path: String,
    pub protocol: Option<&'static str>,
    pub headers: HeaderMap,
}

/// Opaque state carried from [`build_handshake`] to [`finalize_handshake`]:
/// the nonce we sent (HTTP/1.1 only) and the extension offers awaiting the
/// server's answer.
pub struct HandshakeContext {
    key: Option<String>,
    offers: Vec<Box<dyn ExtensionOffer>>,
}

/// Builds the upgrade request for the given HTTP version.
///
/// Engine-owned headers come first; `extra_headers` are appended after
/// them. On HTTP/2 the server's `SETTINGS_ENABLE_CONNECT_PROTOCOL` must
/// already be known: when it is unset this fails with
/// `ExtendedConnectDisabled` and no request is produced.
pub fn build_handshake(
    protocol: HttpProtocol,
    scheme: Scheme,
    path: &str,
    extra_headers: HeaderMap,
    offers: Vec<Box<dyn ExtensionOffer>>,
) -> Result<(HandshakeRequest, HandshakeContext)> {
    let mut headers = HeaderMap::new();

    let (method, ws_protocol, key) = match protocol {
        HttpProtocol::Http1 => {
            let key = generate_key();
            headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(
                header::SEC_WEBSOCKET_KEY,
                key.parse().expect("header value"),
            );
            (Method::GET, None, Some(key))
        }
        HttpProtocol::Http2 {
            connect_protocol_enabled,
        } => {
            if !connect_protocol_enabled {
                return Err(WebSocketError::ExtendedConnectDisabled);
            }
            (Method::CONNECT, Some("websocket"), None)
        }
    };

    headers.insert(header::SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));

    if !offers.is_empty() {
        let value = extension::format_offers(&offers);
        headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            value.parse().expect("header value"),
        );
    }

    for (name, value) in extra_headers.iter() {
        headers.append(name, value.clone());
    }

    Ok((
        HandshakeRequest {
            method,
            scheme,
            path: path.to_owned(),
            protocol: ws_protocol,
            headers,
        },
        HandshakeContext { key, offers },
    ))
}

/// Validates the server's response and produces the connection state.
///
/// HTTP/1.1 responses must carry status 101 and a byte-exact
/// `Sec-WebSocket-Accept`; HTTP/2 extended CONNECT responses must be 2xx
/// and have no accept nonce. Extensions the server echoed are instantiated
/// in the server's order; extensions it ignored are dropped.
pub fn finalize_handshake(
    ctx: HandshakeContext,
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<Connection> {
    match &ctx.key {
        Some(key) => {
            if status != StatusCode::SWITCHING_PROTOCOLS {
                return Err(WebSocketError::ConnectionNotUpgraded(status.as_u16()));
            }

            let expected = accept_key(key.as_bytes());
            let accept = headers
                .get(header::SEC_WEBSOCKET_ACCEPT)
                .ok_or(WebSocketError::InvalidNonce)?;
            if accept.as_bytes() != expected.as_bytes() {
                return Err(WebSocketError::InvalidNonce);
            }
        }
        None => {
            if !status.is_success() {
                return Err(WebSocketError::ConnectionNotUpgraded(status.as_u16()));
            }
        }
    }

    let values = headers
        .get_all(header::SEC_WEBSOCKET_EXTENSIONS)
        .iter()
        .filter_map(|value| value.to_str().ok());
    let extensions = extension::negotiate(&ctx.offers, values)?;

    log::debug!("handshake complete with {} extension(s)", extensions.len());

    Ok(Connection::new(extensions))
}

/// Derives the `Sec-WebSocket-Accept` value for a key (RFC 6455 §4.2.2):
/// base64 of the SHA-1 of the key concatenated with the protocol GUID.
fn accept_key(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11"); // magic string
    BASE64_STANDARD.encode(sha1.finalize())
}

/// A fresh `Sec-WebSocket-Key`: base64 of 16 random bytes.
fn generate_key() -> String {
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deflate::DeflateOptions;

    fn http1_handshake(
        offers: Vec<Box<dyn ExtensionOffer>>,
    ) -> (HandshakeRequest, HandshakeContext) {
        build_handshake(
            HttpProtocol::Http1,
            Scheme::Https,
            "/chat",
            HeaderMap::new(),
            offers,
        )
        .unwrap()
    }

    fn accepting_headers(ctx: &HandshakeContext) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let key = ctx.key.as_deref().unwrap();
        headers.insert(
            header::SEC_WEBSOCKET_ACCEPT,
            accept_key(key.as_bytes()).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn computes_rfc6455_sample_accept() {
        assert_eq!(
            accept_key(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_keys_are_16_random_bytes() {
        let key = generate_key();
        let decoded = BASE64_STANDARD.decode(&key).unwrap();
        assert_eq!(decoded.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn http1_request_headers() {
        let (request, ctx) = http1_handshake(vec![]);

        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, "/chat");
        assert!(request.protocol.is_none());
        assert_eq!(request.headers[header::UPGRADE], "websocket");
        assert_eq!(request.headers[header::CONNECTION], "upgrade");
        assert_eq!(request.headers[header::SEC_WEBSOCKET_VERSION], "13");
        assert_eq!(
            request.headers[header::SEC_WEBSOCKET_KEY],
            ctx.key.as_deref().unwrap()
        );
        assert!(!request.headers.contains_key(header::SEC_WEBSOCKET_EXTENSIONS));
    }

    #[test]
    fn http1_request_offers_extensions() {
        let (request, _) = http1_handshake(vec![Box::new(DeflateOptions::default())]);
        assert_eq!(
            request.headers[header::SEC_WEBSOCKET_EXTENSIONS],
            "permessage-deflate"
        );
    }

    #[test]
    fn caller_headers_are_appended() {
        let mut extra = HeaderMap::new();
        extra.insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token"),
        );

        let (request, _) = build_handshake(
            HttpProtocol::Http1,
            Scheme::Http,
            "/",
            extra,
            vec![],
        )
        .unwrap();

        assert_eq!(request.headers[header::AUTHORIZATION], "Bearer token");
    }

    #[test]
    fn http1_finalize_accepts_valid_response() {
        let (_, ctx) = http1_handshake(vec![]);
        let headers = accepting_headers(&ctx);

        assert!(finalize_handshake(ctx, StatusCode::SWITCHING_PROTOCOLS, &headers).is_ok());
    }

    #[test]
    fn http1_finalize_rejects_wrong_status() {
        let (_, ctx) = http1_handshake(vec![]);
        let res = finalize_handshake(ctx, StatusCode::OK, &HeaderMap::new());
        assert!(matches!(
            res,
            Err(WebSocketError::ConnectionNotUpgraded(200))
        ));
    }

    #[test]
    fn http1_finalize_rejects_missing_or_wrong_nonce() {
        let (_, ctx) = http1_handshake(vec![]);
        let res = finalize_handshake(ctx, StatusCode::SWITCHING_PROTOCOLS, &HeaderMap::new());
        assert!(matches!(res, Err(WebSocketError::InvalidNonce)));

        let (_, ctx) = http1_handshake(vec![]);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_static("bm90IHRoZSByaWdodCBub25jZQ=="),
        );
        let res = finalize_handshake(ctx, StatusCode::SWITCHING_PROTOCOLS, &headers);
        assert!(matches!(res, Err(WebSocketError::InvalidNonce)));
    }

    #[test]
    fn http1_finalize_rejects_unoffered_extension() {
        let (_, ctx) = http1_handshake(vec![]);
        let mut headers = accepting_headers(&ctx);
        headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static("permessage-deflate"),
        );

        let res = finalize_handshake(ctx, StatusCode::SWITCHING_PROTOCOLS, &headers);
        assert!(matches!(res, Err(WebSocketError::ExtensionsMismatch(_))));
    }

    #[test]
    fn http1_finalize_negotiates_offered_extension() {
        let (_, ctx) = http1_handshake(vec![Box::new(DeflateOptions::default())]);
        let mut headers = accepting_headers(&ctx);
        headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static("permessage-deflate; server_no_context_takeover"),
        );

        assert!(finalize_handshake(ctx, StatusCode::SWITCHING_PROTOCOLS, &headers).is_ok());
    }

    #[test]
    fn http2_requires_connect_protocol_setting() {
        let res = build_handshake(
            HttpProtocol::Http2 {
                connect_protocol_enabled: false,
            },
            Scheme::Https,
            "/chat",
            HeaderMap::new(),
            vec![],
        );
        assert!(matches!(res, Err(WebSocketError::ExtendedConnectDisabled)));
    }

    #[test]
    fn http2_request_shape() {
        let (request, ctx) = build_handshake(
            HttpProtocol::Http2 {
                connect_protocol_enabled: true,
            },
            Scheme::Https,
            "/chat",
            HeaderMap::new(),
            vec![],
        )
        .unwrap();

        assert_eq!(request.method, Method::CONNECT);
        assert_eq!(request.protocol, Some("websocket"));
        assert_eq!(request.scheme, Scheme::Https);
        assert_eq!(request.headers[header::SEC_WEBSOCKET_VERSION], "13");
        assert!(!request.headers.contains_key(header::SEC_WEBSOCKET_KEY));
        assert!(ctx.key.is_none());
    }

    #[test]
    fn http2_finalize_accepts_any_2xx() {
        for status in [StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT] {
            let (_, ctx) = build_handshake(
                HttpProtocol::Http2 {
                    connect_protocol_enabled: true,
                },
                Scheme::Https,
                "/",
                HeaderMap::new(),
                vec![],
            )
            .unwrap();

            assert!(finalize_handshake(ctx, status, &HeaderMap::new()).is_ok());
        }
    }

    #[test]
    fn http2_finalize_rejects_non_2xx() {
        let (_, ctx) = build_handshake(
            HttpProtocol::Http2 {
                connect_protocol_enabled: true,
            },
            Scheme::Https,
            "/",
            HeaderMap::new(),
            vec![],
        )
        .unwrap();

        let res = finalize_handshake(ctx, StatusCode::NOT_FOUND, &HeaderMap::new());
        assert!(matches!(
            res,
            Err(WebSocketError::ConnectionNotUpgraded(404))
        ));
    }
}
