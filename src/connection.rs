//! Connection state and the encode/decode pipeline.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder as _, Encoder as _};

use crate::{
    codec,
    extension::Extension,
    fragment::FragmentAssembler,
    frame::{Frame, MAX_HEAD_SIZE},
    Result,
};

/// Per-connection protocol state, produced by
/// [`finalize_handshake`](crate::finalize_handshake).
///
/// Owns the negotiated extension pipeline, the fragment assembler and the
/// decode buffer. The value is single-owner: the caller threads it through
/// every [`encode`](Connection::encode) and [`decode`](Connection::decode)
/// call, and two calls on the same connection are trivially serial. Nothing
/// here blocks, spawns or allocates beyond the buffers it owns; dropping
/// the connection releases the DEFLATE contexts along with it.
pub struct Connection {
    extensions: Vec<Box<dyn Extension>>,
    assembler: FragmentAssembler,
    decoder: codec::Decoder,
    encoder: codec::Encoder,
    read_buf: BytesMut,
}

impl Connection {
    pub(crate) fn new(extensions: Vec<Box<dyn Extension>>) -> Self {
        let claimed = extensions
            .iter()
            .fold(0, |bits, extension| bits | extension.claimed_rsv());

        Self {
            extensions,
            assembler: FragmentAssembler::new(),
            decoder: codec::Decoder::new(claimed),
            encoder: codec::Encoder,
            read_buf: BytesMut::with_capacity(4096),
        }
    }

    /// Encodes one outbound frame into wire bytes.
    ///
    /// The frame runs through the extension pipeline in negotiation order,
    /// then is masked with a fresh random key and serialized. On error the
    /// frame is rejected and nothing is queued; the connection remains
    /// usable.
    pub fn encode(&mut self, frame: Frame) -> Result<Bytes> {
        let mut raw = frame.lower();
        for extension in &mut self.extensions {
            raw = extension.encode(raw)?;
        }

        let mut dst = BytesMut::with_capacity(MAX_HEAD_SIZE + raw.payload.len());
        self.encoder.encode(raw, &mut dst)?;

        Ok(dst.freeze())
    }

    /// Decodes received bytes into frames.
    ///
    /// `input` may cut a frame at any byte boundary: whole frames are
    /// returned, and the unparsed tail is buffered for the next call.
    /// Feeding a stream chunk by chunk yields the same frames as feeding it
    /// at once.
    ///
    /// Per-frame validation failures (`InvalidUtf8`, `InvalidClosePayload`)
    /// are reported inline in the returned list, so later frames stay
    /// reachable. Framing-level violations (a masked server frame, a bad
    /// length prefix, unclaimed reserved bits, broken fragmentation) are
    /// returned as the outer error; the stream position is lost and the
    /// caller should close the connection with code 1002.
    pub fn decode(&mut self, input: &[u8]) -> Result<Vec<Result<Frame>>> {
        self.read_buf.extend_from_slice(input);

        let mut frames = Vec::new();
        while let Some(raw) = self.decoder.decode(&mut self.read_buf)? {
            let Some(mut assembled) = self.assembler.on_frame(raw)? else {
                continue;
            };

            for extension in &mut self.extensions {
                assembled = extension.decode(assembled)?;
            }

            frames.push(assembled.lift());
        }

        Ok(frames)
    }

    /// Whether a fragmented message is awaiting its terminal continuation.
    pub fn has_pending_fragments(&self) -> bool {
        self.assembler.has_pending()
    }

    /// Bytes buffered from a partially received frame.
    pub fn buffered(&self) -> usize {
        self.read_buf.len()
    }
}
