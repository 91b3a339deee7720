//! Fragmented-message reassembly (RFC 6455 §5.4).

use bytes::BytesMut;

use crate::{
    frame::{OpCode, RawFrame},
    Result, WebSocketError,
};

/// Reassembles continuation fragments into complete data frames.
///
/// Control frames pass through untouched; they may legally interleave with
/// a fragment sequence. Data frames with `fin` set pass through when no
/// sequence is in progress. Everything else either extends the pending
/// sequence or is a protocol violation.
pub(crate) struct FragmentAssembler {
    /// Header of the in-progress message, if any.
    fragment: Option<Fragment>,
    /// Payload bytes accumulated so far.
    accumulated: BytesMut,
}

/// Opening-fragment metadata, reapplied to the assembled frame.
struct Fragment {
    opcode: OpCode,
    rsv: u8,
}

impl FragmentAssembler {
    pub(crate) fn new() -> Self {
        Self {
            fragment: None,
            accumulated: BytesMut::with_capacity(1024),
        }
    }

    /// Whether a fragment sequence is awaiting its terminal continuation.
    pub(crate) fn has_pending(&self) -> bool {
        self.fragment.is_some()
    }

    /// Feeds one decoded frame through the assembler.
    ///
    /// Returns `Ok(Some(frame))` when a complete frame is available: a
    /// control frame, an unfragmented data frame, or a finished reassembly
    /// carrying the opening fragment's opcode and reserved bits. Returns
    /// `Ok(None)` while a sequence is still accumulating.
    pub(crate) fn on_frame(&mut self, mut frame: RawFrame) -> Result<Option<RawFrame>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::OutOfOrderFragments);
                }

                if frame.fin {
                    return Ok(Some(frame));
                }

                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                    rsv: frame.rsv,
                });
                self.accumulated.extend_from_slice(&frame.payload);

                Ok(None)
            }
            OpCode::Continuation => {
                let Some(fragment) = self.fragment.as_ref() else {
                    return Err(WebSocketError::UninitiatedContinuation);
                };

                self.accumulated.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                // Swap in a fresh buffer so one large message does not pin
                // its capacity for the connection's lifetime.
                frame.opcode = fragment.opcode;
                frame.rsv = fragment.rsv;
                frame.payload =
                    std::mem::replace(&mut self.accumulated, BytesMut::with_capacity(1024));
                self.fragment = None;

                Ok(Some(frame))
            }
            // Control frames bypass reassembly entirely.
            OpCode::Close | OpCode::Ping | OpCode::Pong => Ok(Some(frame)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(fin: bool, payload: &[u8]) -> RawFrame {
        RawFrame::new(fin, OpCode::Text, payload)
    }

    fn continuation(fin: bool, payload: &[u8]) -> RawFrame {
        RawFrame::new(fin, OpCode::Continuation, payload)
    }

    #[test]
    fn passes_complete_frames_through() {
        let mut assembler = FragmentAssembler::new();
        let out = assembler.on_frame(text(true, b"hello")).unwrap().unwrap();
        assert_eq!(out.opcode, OpCode::Text);
        assert_eq!(&out.payload[..], b"hello");
        assert!(!assembler.has_pending());
    }

    #[test]
    fn reassembles_two_fragments() {
        let mut assembler = FragmentAssembler::new();

        assert!(assembler.on_frame(text(false, b"hello")).unwrap().is_none());
        assert!(assembler.has_pending());

        let out = assembler
            .on_frame(continuation(true, b" world"))
            .unwrap()
            .unwrap();
        assert_eq!(out.opcode, OpCode::Text);
        assert!(out.fin);
        assert_eq!(&out.payload[..], b"hello world");
        assert!(!assembler.has_pending());
    }

    #[test]
    fn reassembles_three_fragments() {
        let mut assembler = FragmentAssembler::new();

        assert!(assembler.on_frame(text(false, b"a")).unwrap().is_none());
        assert!(assembler
            .on_frame(continuation(false, b"b"))
            .unwrap()
            .is_none());
        let out = assembler.on_frame(continuation(true, b"c")).unwrap().unwrap();
        assert_eq!(&out.payload[..], b"abc");
    }

    #[test]
    fn control_frames_interleave() {
        let mut assembler = FragmentAssembler::new();

        assert!(assembler.on_frame(text(false, b"hel")).unwrap().is_none());

        let ping = assembler
            .on_frame(RawFrame::new(true, OpCode::Ping, &b"hb"[..]))
            .unwrap()
            .unwrap();
        assert_eq!(ping.opcode, OpCode::Ping);
        assert!(assembler.has_pending());

        let out = assembler.on_frame(continuation(true, b"lo")).unwrap().unwrap();
        assert_eq!(&out.payload[..], b"hello");
    }

    #[test]
    fn rejects_uninitiated_continuation() {
        let mut assembler = FragmentAssembler::new();
        for fin in [false, true] {
            assert!(matches!(
                assembler.on_frame(continuation(fin, b"x")),
                Err(WebSocketError::UninitiatedContinuation)
            ));
        }
    }

    #[test]
    fn rejects_data_frame_mid_sequence() {
        let mut assembler = FragmentAssembler::new();
        assert!(assembler.on_frame(text(false, b"start")).unwrap().is_none());

        assert!(matches!(
            assembler.on_frame(RawFrame::new(true, OpCode::Binary, &b"new"[..])),
            Err(WebSocketError::OutOfOrderFragments)
        ));
    }

    #[test]
    fn assembled_frame_keeps_opening_reserved_bits() {
        let mut assembler = FragmentAssembler::new();

        let mut opening = RawFrame::new(false, OpCode::Binary, &b"compressed"[..]);
        opening.rsv = crate::frame::RSV1;
        assert!(assembler.on_frame(opening).unwrap().is_none());

        let out = assembler.on_frame(continuation(true, b"-tail")).unwrap().unwrap();
        assert_eq!(out.opcode, OpCode::Binary);
        assert_eq!(out.rsv, crate::frame::RSV1);
        assert_eq!(&out.payload[..], b"compressed-tail");
    }
}
