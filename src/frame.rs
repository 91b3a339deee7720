//! WebSocket frames (RFC 6455 §5.2).
//!
//! Two representations live here:
//!
//! - [`Frame`]: what callers send and receive. A tagged sum of the five
//!   frame kinds, already validated (UTF-8 text, close code in range).
//! - [`RawFrame`]: the on-wire representation with `fin`, reserved bits,
//!   opcode, optional mask and payload. The codec and the extension
//!   pipeline speak raw frames.
//!
//! `Frame::lower` and `RawFrame::lift` translate between the two.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |     Masking-key, if MASK set  |          Payload Data         |
//! +-------------------------------+ - - - - - - - - - - - - - - - +
//! ```

use bytes::{Bytes, BytesMut};

use crate::{close::CloseCode, mask, Result, WebSocketError};

/// Reserved bit 1, claimed by permessage-deflate.
pub const RSV1: u8 = 0b100;
/// Reserved bit 2. No registered extension claims it.
pub const RSV2: u8 = 0b010;
/// Reserved bit 3. No registered extension claims it.
pub const RSV3: u8 = 0b001;

/// Largest possible frame header: 2 fixed bytes, 8 length bytes, 4 mask bytes.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code, identifying the kind of a frame.
///
/// The numeric values are defined in RFC 6455 §11.8: continuation = 0x0,
/// text = 0x1, binary = 0x2, close = 0x8, ping = 0x9, pong = 0xA. The
/// ranges 0x3-0x7 and 0xB-0xF are reserved and rejected during decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames manage the connection itself and have special
    /// constraints: FIN must be set, and the payload is at most 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for `Text` and `Binary`, the opcodes that may open a
    /// message.
    pub fn is_data(&self) -> bool {
        matches!(*self, OpCode::Text | OpCode::Binary)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::UnsupportedOpcode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A complete, validated WebSocket frame as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text message. Always valid UTF-8.
    Text(String),
    /// A binary message.
    Binary(Bytes),
    /// A ping. Payload is at most 125 bytes.
    Ping(Bytes),
    /// A pong, conventionally echoing a ping's payload.
    Pong(Bytes),
    /// A close frame. A frame with an empty wire payload decodes as
    /// `Close { code: Some(1000), reason: Some("") }`.
    Close {
        code: Option<CloseCode>,
        reason: Option<String>,
    },
}

impl Frame {
    /// Creates a text frame.
    pub fn text(payload: impl Into<String>) -> Self {
        Self::Text(payload.into())
    }

    /// Creates a binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::Binary(payload.into())
    }

    /// Creates a ping frame.
    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::Ping(payload.into())
    }

    /// Creates a pong frame.
    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::Pong(payload.into())
    }

    /// Creates a close frame with a code and reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close {
            code: Some(code),
            reason: Some(reason.into()),
        }
    }

    /// Lowers a caller frame into its wire representation.
    ///
    /// Data and control frames all leave with `fin` set; the engine never
    /// fragments outbound messages. The mask is attached later, when the
    /// codec serializes the frame.
    ///
    /// A close with no code produces an empty wire payload; a reason
    /// without a code cannot be expressed on the wire and is dropped.
    pub(crate) fn lower(self) -> RawFrame {
        match self {
            Frame::Text(text) => RawFrame::new(true, OpCode::Text, text.as_bytes()),
            Frame::Binary(payload) => RawFrame::new(true, OpCode::Binary, payload.as_ref()),
            Frame::Ping(payload) => RawFrame::new(true, OpCode::Ping, payload.as_ref()),
            Frame::Pong(payload) => RawFrame::new(true, OpCode::Pong, payload.as_ref()),
            Frame::Close { code, reason } => {
                let payload = match code {
                    Some(code) => {
                        let reason = reason.unwrap_or_default();
                        let mut payload = BytesMut::with_capacity(2 + reason.len());
                        payload.extend_from_slice(&u16::from(code).to_be_bytes());
                        payload.extend_from_slice(reason.as_bytes());
                        payload
                    }
                    None => BytesMut::new(),
                };
                RawFrame::new(true, OpCode::Close, payload)
            }
        }
    }
}

/// The on-wire frame representation.
///
/// Produced by the decoder and consumed by the encoder; extensions transform
/// raw frames in between. The payload of an inbound raw frame is already
/// unmasked (servers never mask), and the payload of an outbound one is
/// masked by the encoder as the last step before serialization.
#[derive(Debug)]
pub struct RawFrame {
    /// Whether this frame terminates a message.
    pub fin: bool,
    /// Reserved bits, `0b100`/`0b010`/`0b001` for RSV1/2/3.
    pub rsv: u8,
    /// The frame kind.
    pub opcode: OpCode,
    /// Masking key; set on outbound frames only.
    pub(crate) mask: Option<[u8; 4]>,
    /// Payload bytes.
    pub payload: BytesMut,
}

impl RawFrame {
    /// Creates an unmasked raw frame with no reserved bits set.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<BytesMut>) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Creates a raw frame carrying a predetermined masking key.
    #[cfg(test)]
    pub(crate) fn with_mask(
        fin: bool,
        opcode: OpCode,
        mask: [u8; 4],
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            rsv: 0,
            opcode,
            mask: Some(mask),
            payload: payload.into(),
        }
    }

    #[inline]
    pub(crate) fn is_masked(&self) -> bool {
        self.mask.is_some()
    }

    /// Masks the payload, generating a fresh random key if none is set.
    pub(crate) fn mask(&mut self) {
        let key = *self.mask.get_or_insert_with(mask::new_mask);
        mask::apply_mask(&mut self.payload, key);
    }

    /// Reverses a previous masking and clears the key.
    #[cfg(test)]
    pub(crate) fn unmask(&mut self) {
        if let Some(key) = self.mask.take() {
            mask::apply_mask(&mut self.payload, key);
        }
    }

    /// Formats the frame header into `head` and returns its size.
    ///
    /// `head` must hold at least [`MAX_HEAD_SIZE`] bytes.
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | self.rsv << 4 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        if let Some(mask) = self.mask {
            head[1] |= 0x80;
            head[size..size + 4].copy_from_slice(&mask);
            size + 4
        } else {
            size
        }
    }

    /// Lifts a decoded, assembled raw frame into a caller frame.
    ///
    /// By this point every negotiated extension has run and cleared the bits
    /// it claimed, so any remaining reserved bit is a protocol violation.
    pub(crate) fn lift(self) -> Result<Frame> {
        if self.rsv != 0 {
            return Err(WebSocketError::MalformedReserved);
        }

        match self.opcode {
            OpCode::Text => String::from_utf8(self.payload.to_vec())
                .map(Frame::Text)
                .map_err(|_| WebSocketError::InvalidUtf8),
            OpCode::Binary => Ok(Frame::Binary(self.payload.freeze())),
            OpCode::Ping => Ok(Frame::Ping(self.payload.freeze())),
            OpCode::Pong => Ok(Frame::Pong(self.payload.freeze())),
            OpCode::Close => lift_close(&self.payload),
            // The assembler never emits a bare continuation.
            OpCode::Continuation => Err(WebSocketError::UninitiatedContinuation),
        }
    }
}

/// Validates a close frame payload (RFC 6455 §5.5.1 and §7.4).
///
/// An empty payload is given the synthetic default `Close(1000, "")`. A
/// 1-byte payload is always invalid. Otherwise the first two bytes are a
/// big-endian close code, which must be allowed on the wire, followed by a
/// UTF-8 reason of at most 123 bytes.
fn lift_close(payload: &[u8]) -> Result<Frame> {
    match payload.len() {
        0 => Ok(Frame::Close {
            code: Some(CloseCode::Normal),
            reason: Some(String::new()),
        }),
        1 => Err(WebSocketError::InvalidClosePayload),
        len => {
            if len - 2 > 123 {
                return Err(WebSocketError::InvalidClosePayload);
            }

            let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_allowed() {
                return Err(WebSocketError::InvalidClosePayload);
            }

            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| WebSocketError::InvalidUtf8)?;

            Ok(Frame::Close {
                code: Some(code),
                reason: Some(reason.to_owned()),
            })
        }
    }
}
