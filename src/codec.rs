//! Frame-level byte codec.
//!
//! [`Decoder`] parses a byte buffer into [`RawFrame`]s and is partial-input
//! safe: any prefix of a frame stream yields the frames whose bytes are
//! complete, leaves the rest in the buffer, and resumes on the next call.
//! [`Encoder`] masks and serializes outbound raw frames.
//!
//! Both implement the `tokio_util::codec` traits so they compose with any
//! buffer-driven transport; the engine itself drives them from
//! [`Connection`](crate::Connection) without any I/O.

use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{OpCode, RawFrame, MAX_HEAD_SIZE},
    Result, WebSocketError,
};

/// Decoding position within the current frame.
enum ReadState {
    /// The first two bytes are parsed; awaiting the extended length.
    Header(Header),
    /// The full header is parsed; awaiting `payload_len` bytes of payload.
    Payload(Header, usize),
}

/// Fields recovered from the fixed two-byte frame prefix.
struct Header {
    fin: bool,
    rsv: u8,
    opcode: OpCode,
    /// Extended-length bytes still to read (0, 2 or 8).
    extra: usize,
    /// The 7-bit length field.
    length_code: u8,
}

/// Client-role frame decoder.
///
/// Rejects masked input outright: servers must not mask (RFC 6455 §5.1).
/// Reserved bits are checked against the union of bits claimed by the
/// negotiated extensions; anything else fails decoding.
pub struct Decoder {
    state: Option<ReadState>,
    claimed_rsv: u8,
}

impl Decoder {
    /// Creates a decoder that tolerates the given reserved bits.
    ///
    /// `claimed_rsv` is the OR of [`claimed_rsv`](crate::Extension::claimed_rsv)
    /// over the accepted extensions; `0` when none were negotiated.
    pub fn new(claimed_rsv: u8) -> Self {
        Self {
            state: None,
            claimed_rsv,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = RawFrame;
    type Error = WebSocketError;

    /// Parses one frame from the head of `src`, if its bytes are complete.
    ///
    /// Returns `Ok(None)` when more data is needed; the consumed header
    /// fields are carried over in the decoder state, so the call can resume
    /// at any byte boundary.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    let rsv = (src[0] >> 4) & 0b0111;
                    if rsv & !self.claimed_rsv != 0 {
                        return Err(WebSocketError::MalformedReserved);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;

                    if src[1] & 0b1000_0000 != 0 {
                        return Err(WebSocketError::UnexpectedMask);
                    }
                    let length_code = src[1] & 0x7F;

                    if opcode.is_control() {
                        if !fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if length_code > 125 {
                            return Err(WebSocketError::PayloadTooLarge);
                        }
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        rsv,
                        opcode,
                        extra,
                        length_code,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.extra {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        8 => {
                            let len = src.get_u64();
                            if len & (1 << 63) != 0 {
                                return Err(WebSocketError::MalformedPayloadLength);
                            }
                            usize::try_from(len)
                                .map_err(|_| WebSocketError::PayloadTooLarge)?
                        }
                        _ => unreachable!(),
                    };

                    self.state = Some(ReadState::Payload(header, payload_len));
                }
                Some(ReadState::Payload(header, payload_len)) => {
                    if src.remaining() < payload_len {
                        self.state = Some(ReadState::Payload(header, payload_len));
                        return Ok(None);
                    }

                    let payload = src.split_to(payload_len);

                    break Ok(Some(RawFrame {
                        fin: header.fin,
                        rsv: header.rsv,
                        opcode: header.opcode,
                        mask: None,
                        payload,
                    }));
                }
            }
        }
    }
}

/// Client-role frame encoder.
///
/// Every outbound frame leaves with the mask bit set and a 4-byte key; a
/// fresh key is drawn per frame unless the caller preset one.
pub struct Encoder;

impl codec::Encoder<RawFrame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: RawFrame, dst: &mut BytesMut) -> Result<()> {
        let len = frame.payload.len();
        if frame.opcode.is_control() && len > 125 {
            return Err(WebSocketError::PayloadTooLarge);
        }
        if len as u64 & (1 << 63) != 0 {
            return Err(WebSocketError::PayloadTooLarge);
        }

        frame.mask();

        let mut head = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut head);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&head[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
