//! # sansws
//!
//! A process-less, I/O-agnostic WebSocket client protocol engine.
//!
//! The crate owns no sockets, no threads and no timers. Callers feed it the
//! handshake response and the byte buffers they read from their transport,
//! and receive either encoded byte sequences to transmit or decoded frames
//! to consume. All I/O, timers and reconnect policy stay with the caller and
//! its HTTP client.
//!
//! ## Layered processing
//!
//! Frames flow through three layers on receive:
//!
//! ```text
//! bytes ──▶ codec (frame parsing, partial-input buffering)
//!       ──▶ fragment assembler (continuation reassembly)
//!       ──▶ extension pipeline (permessage-deflate, ...)
//!       ──▶ caller frames
//! ```
//!
//! and the reverse on send: the extension pipeline runs first, then the
//! codec masks and serializes.
//!
//! ## Usage
//!
//! ```no_run
//! use sansws::{build_handshake, finalize_handshake, Frame, HttpProtocol, Scheme};
//! use http::HeaderMap;
//!
//! # fn run() -> sansws::Result<()> {
//! let (request, ctx) =
//!     build_handshake(HttpProtocol::Http1, Scheme::Https, "/chat", HeaderMap::new(), vec![])?;
//! // ... send `request` through your HTTP client, read status + headers ...
//! # let (status, headers) = (http::StatusCode::SWITCHING_PROTOCOLS, HeaderMap::new());
//! let mut conn = finalize_handshake(ctx, status, &headers)?;
//!
//! let bytes = conn.encode(Frame::text("hello"))?;
//! // ... write `bytes` to the transport; later, feed received bytes back ...
//! # let received: &[u8] = &[];
//! for frame in conn.decode(received)? {
//!     let frame = frame?;
//!     // ...
//! }
//! # Ok(())
//! # }
//! ```

pub mod close;
pub mod codec;
mod connection;
pub mod deflate;
pub mod extension;
mod fragment;
pub mod frame;
mod handshake;
mod mask;

pub use close::CloseCode;
pub use connection::Connection;
pub use deflate::{CompressionLevel, DeflateOptions};
pub use extension::{Extension, ExtensionOffer};
pub use frame::{Frame, OpCode, RawFrame};
pub use handshake::{
    build_handshake, finalize_handshake, HandshakeContext, HandshakeRequest, HttpProtocol, Scheme,
};

use thiserror::Error;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Errors raised by the protocol engine.
///
/// The variants fall into three groups:
///
/// - Handshake failures, which abandon the connection before any frame is
///   exchanged.
/// - Per-frame validation failures (`PayloadTooLarge` on encode,
///   `InvalidUtf8`, `InvalidClosePayload` on decode), after which the
///   connection remains usable.
/// - Stream-level protocol violations, after which the caller should close
///   the connection with close code 1002.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// The server did not switch protocols: a non-101 status on HTTP/1.1,
    /// or a non-2xx status on an HTTP/2 extended CONNECT.
    #[error("connection not upgraded (status={0})")]
    ConnectionNotUpgraded(u16),

    /// The `Sec-WebSocket-Accept` header is missing or does not match the
    /// value derived from the key we sent.
    #[error("sec-websocket-accept mismatch")]
    InvalidNonce,

    /// The HTTP/2 server did not advertise `SETTINGS_ENABLE_CONNECT_PROTOCOL`,
    /// so an extended CONNECT must not be issued (RFC 8441 §4).
    #[error("server does not support extended CONNECT")]
    ExtendedConnectDisabled,

    /// The server accepted an extension the client never offered.
    #[error("server accepted unknown extension: {0}")]
    ExtensionsMismatch(String),

    /// Outbound payload exceeds what the length prefix can carry, or a
    /// control frame payload exceeds 125 bytes.
    #[error("payload too large")]
    PayloadTooLarge,

    /// Received a frame with an opcode in the reserved ranges 0x3-0x7 or
    /// 0xB-0xF.
    #[error("unsupported opcode (byte={0})")]
    UnsupportedOpcode(u8),

    /// A 64-bit length prefix with the high bit set (RFC 6455 §5.2 requires
    /// the most significant bit to be zero).
    #[error("malformed payload length")]
    MalformedPayloadLength,

    /// A reserved header bit was set that no negotiated extension claims.
    #[error("reserved bits are not zero")]
    MalformedReserved,

    /// The server sent a masked frame. Servers must not mask (RFC 6455 §5.1).
    #[error("received masked frame from server")]
    UnexpectedMask,

    /// A text payload or close reason is not valid UTF-8.
    #[error("invalid utf-8")]
    InvalidUtf8,

    /// A close frame with a 1-byte payload, an out-of-range or reserved
    /// close code, or a reason longer than 123 bytes.
    #[error("invalid close payload")]
    InvalidClosePayload,

    /// A continuation frame arrived with no fragmented message in progress.
    #[error("continuation without a message in progress")]
    UninitiatedContinuation,

    /// A new text or binary frame arrived while a fragmented message was
    /// still awaiting its terminal continuation.
    #[error("data frame interleaved with a fragmented message")]
    OutOfOrderFragments,

    /// A control frame with the FIN bit clear. Control frames must not be
    /// fragmented (RFC 6455 §5.5).
    #[error("control frame must not be fragmented")]
    ControlFrameFragmented,

    /// The permessage-deflate stream is corrupt on either direction.
    #[error(transparent)]
    Compression(#[from] std::io::Error),
}
