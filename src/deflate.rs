//! Per-message DEFLATE (RFC 7692).
//!
//! The one well-known extension. On encode it compresses the payload of
//! each data frame, strips the trailing `00 00 FF FF` that a sync flush
//! appends, and sets RSV1. Decode runs after fragment assembly, so always
//! on a complete message: it appends the `00 00 FF FF` tail back and
//! inflates.
//!
//! The LZ77 dictionary is retained across messages unless the matching
//! `no_context_takeover` parameter was negotiated, in which case the
//! context resets at each message boundary.

use std::io;

use bytes::{BufMut, BytesMut};
use flate2::{Compress, CompressError, Decompress, DecompressError, Status};

use crate::{
    extension::{Extension, ExtensionOffer, Param},
    frame::{RawFrame, RSV1},
    Result,
};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Compression level, re-exported from `flate2`.
pub type CompressionLevel = flate2::Compression;

/// Offer configuration for permessage-deflate.
///
/// The four RFC 7692 parameters plus the local compression level. Window
/// sizes take effect only with the `zlib` feature; the default DEFLATE
/// backend has a fixed 15-bit window, so without it the negotiated values
/// are accepted and ignored.
#[derive(Debug, Clone)]
pub struct DeflateOptions {
    level: CompressionLevel,
    server_no_context_takeover: bool,
    client_no_context_takeover: bool,
    server_max_window_bits: Option<u8>,
    client_max_window_bits: Option<u8>,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::default(),
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            server_max_window_bits: None,
            client_max_window_bits: None,
        }
    }
}

impl DeflateOptions {
    /// Sets the local compression level.
    pub fn with_level(mut self, level: CompressionLevel) -> Self {
        self.level = level;
        self
    }

    /// Asks the server to reset its compression context after each message.
    pub fn server_no_context_takeover(mut self) -> Self {
        self.server_no_context_takeover = true;
        self
    }

    /// Commits this client to resetting its compression context after each
    /// message.
    pub fn client_no_context_takeover(mut self) -> Self {
        self.client_no_context_takeover = true;
        self
    }

    /// Asks the server to cap its LZ77 window at `bits` (9-15).
    pub fn server_max_window_bits(mut self, bits: u8) -> Self {
        self.server_max_window_bits = Some(bits);
        self
    }

    /// Advertises that this client will cap its LZ77 window at `bits` (9-15).
    pub fn client_max_window_bits(mut self, bits: u8) -> Self {
        self.client_max_window_bits = Some(bits);
        self
    }
}

impl ExtensionOffer for DeflateOptions {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn params(&self) -> Vec<Param> {
        let mut params = Vec::new();
        if let Some(bits) = self.server_max_window_bits {
            let value = (9..16).contains(&bits).then(|| bits.to_string());
            params.push(("server_max_window_bits".to_owned(), value));
        }
        if let Some(bits) = self.client_max_window_bits {
            let value = (9..16).contains(&bits).then(|| bits.to_string());
            params.push(("client_max_window_bits".to_owned(), value));
        }
        if self.server_no_context_takeover {
            params.push(("server_no_context_takeover".to_owned(), None));
        }
        if self.client_no_context_takeover {
            params.push(("client_no_context_takeover".to_owned(), None));
        }
        params
    }

    /// Instantiates the extension from the parameters the server chose.
    ///
    /// Unrecognized parameters are ignored; the negotiated flags are the
    /// union of what we offered and what the server returned.
    fn accept(&self, params: &[Param]) -> Result<Box<dyn Extension>> {
        let mut negotiated = self.clone();

        for (key, value) in params {
            match key.as_str() {
                "server_no_context_takeover" => negotiated.server_no_context_takeover = true,
                "client_no_context_takeover" => negotiated.client_no_context_takeover = true,
                "server_max_window_bits" => {
                    negotiated.server_max_window_bits =
                        Some(value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                "client_max_window_bits" => {
                    negotiated.client_max_window_bits =
                        Some(value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0));
                }
                _ => {}
            }
        }

        log::debug!(
            "permessage-deflate accepted: client_no_context_takeover={} \
            server_no_context_takeover={} server_max_window_bits={:?} \
            client_max_window_bits={:?}",
            negotiated.client_no_context_takeover,
            negotiated.server_no_context_takeover,
            negotiated.server_max_window_bits,
            negotiated.client_max_window_bits,
        );

        Ok(Box::new(PermessageDeflate::new(&negotiated)))
    }
}

/// The negotiated permessage-deflate instance: one deflate stream for the
/// client-to-server direction, one inflate stream for the reverse.
pub struct PermessageDeflate {
    deflate: Compressor,
    inflate: Decompressor,
}

impl PermessageDeflate {
    fn new(negotiated: &DeflateOptions) -> Self {
        #[cfg(feature = "zlib")]
        let deflate = match negotiated.client_max_window_bits {
            Some(bits @ 9..=15) => Compressor::with_window_bits(
                negotiated.level,
                bits,
                negotiated.client_no_context_takeover,
            ),
            _ => Compressor::new(negotiated.level, negotiated.client_no_context_takeover),
        };
        #[cfg(not(feature = "zlib"))]
        let deflate = Compressor::new(negotiated.level, negotiated.client_no_context_takeover);

        #[cfg(feature = "zlib")]
        let inflate = match negotiated.server_max_window_bits {
            Some(bits @ 9..=15) => {
                Decompressor::with_window_bits(bits, negotiated.server_no_context_takeover)
            }
            _ => Decompressor::new(negotiated.server_no_context_takeover),
        };
        #[cfg(not(feature = "zlib"))]
        let inflate = Decompressor::new(negotiated.server_no_context_takeover);

        Self { deflate, inflate }
    }
}

impl Extension for PermessageDeflate {
    fn name(&self) -> &str {
        PERMESSAGE_DEFLATE
    }

    fn claimed_rsv(&self) -> u8 {
        RSV1
    }

    fn encode(&mut self, mut frame: RawFrame) -> Result<RawFrame> {
        if frame.opcode.is_data() {
            frame.payload = self.deflate.compress(&frame.payload)?;
            frame.rsv |= RSV1;
        }
        Ok(frame)
    }

    fn decode(&mut self, mut frame: RawFrame) -> Result<RawFrame> {
        if frame.opcode.is_data() && frame.rsv & RSV1 != 0 {
            frame.payload = self.inflate.decompress(&frame.payload)?;
            frame.rsv &= !RSV1;
        }
        Ok(frame)
    }
}

/// A DEFLATE compressor for message payloads.
///
/// Streams the input through `flate2::Compress` with a sync flush at the
/// message boundary and strips the `00 00 FF FF` the flush appends
/// (RFC 7692 §7.2.1). In `reset_context` mode the dictionary is dropped at
/// each message boundary.
pub(crate) struct Compressor {
    output: BytesMut,
    compress: Compress,
    reset_context: bool,
}

impl Compressor {
    pub(crate) fn new(level: CompressionLevel, reset_context: bool) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            compress: Compress::new(level, false),
            reset_context,
        }
    }

    #[cfg(feature = "zlib")]
    pub(crate) fn with_window_bits(
        level: CompressionLevel,
        window_bits: u8,
        reset_context: bool,
    ) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            compress: Compress::new_with_window_bits(level, false, window_bits),
            reset_context,
        }
    }

    /// Compresses one complete message payload.
    pub(crate) fn compress(&mut self, mut input: &[u8]) -> io::Result<BytesMut> {
        if self.reset_context {
            self.compress.reset();
        }

        while !input.is_empty() {
            let consumed = self.write(input)?;
            input = &input[consumed..];
        }
        self.flush()
    }

    fn write(&mut self, input: &[u8]) -> io::Result<usize> {
        let dst = chunk(&mut self.output);

        let before_out = self.compress.total_out();
        let before_in = self.compress.total_in();

        let status = self.compress.compress(input, dst, flate2::FlushCompress::None);

        let written = (self.compress.total_out() - before_out) as usize;
        let consumed = (self.compress.total_in() - before_in) as usize;

        unsafe { self.output.advance_mut(written) };

        match status {
            Ok(Status::Ok) => Ok(consumed),
            Ok(Status::StreamEnd | Status::BufError) | Err(..) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "corrupt deflate stream",
            )),
        }
    }

    fn flush(&mut self) -> io::Result<BytesMut> {
        let dst = chunk(&mut self.output);
        let before_out = self.compress.total_out();

        self.compress
            .compress(&[], dst, flate2::FlushCompress::Sync)
            .map_err(deflate_error)?;

        let written = (self.compress.total_out() - before_out) as usize;
        unsafe { self.output.advance_mut(written) };

        loop {
            let dst = chunk(&mut self.output);

            let before_out = self.compress.total_out();
            self.compress
                .compress(&[], dst, flate2::FlushCompress::None)
                .map_err(deflate_error)?;

            if before_out == self.compress.total_out() {
                if self.output.ends_with(&[0x00, 0x00, 0xff, 0xff]) {
                    self.output.truncate(self.output.len() - 4);
                }

                break Ok(self.output.split());
            }

            let written = (self.compress.total_out() - before_out) as usize;
            unsafe { self.output.advance_mut(written) };
        }
    }
}

/// The matching inflater for inbound message payloads.
pub(crate) struct Decompressor {
    output: BytesMut,
    decompress: Decompress,
    reset_context: bool,
}

impl Decompressor {
    pub(crate) fn new(reset_context: bool) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            decompress: Decompress::new(false),
            reset_context,
        }
    }

    #[cfg(feature = "zlib")]
    pub(crate) fn with_window_bits(window_bits: u8, reset_context: bool) -> Self {
        Self {
            output: BytesMut::with_capacity(1024),
            decompress: Decompress::new_with_window_bits(false, window_bits),
            reset_context,
        }
    }

    /// Inflates one complete message payload, restoring the `00 00 FF FF`
    /// tail stripped by the sender (RFC 7692 §7.2.2).
    pub(crate) fn decompress(&mut self, input: &[u8]) -> io::Result<BytesMut> {
        self.write(input)?;
        self.write(&[0x00, 0x00, 0xff, 0xff])?;
        let output = self.flush()?;

        if self.reset_context {
            self.decompress.reset(false);
        }

        Ok(output)
    }

    fn write(&mut self, mut input: &[u8]) -> io::Result<()> {
        while !input.is_empty() {
            let dst = chunk(&mut self.output);

            let before_out = self.decompress.total_out();
            let before_in = self.decompress.total_in();

            let status = self
                .decompress
                .decompress(input, dst, flate2::FlushDecompress::None);

            let written = (self.decompress.total_out() - before_out) as usize;
            let consumed = (self.decompress.total_in() - before_in) as usize;

            unsafe { self.output.advance_mut(written) };

            input = &input[consumed..];

            match status {
                Ok(Status::Ok | Status::BufError | Status::StreamEnd) => {}
                Err(..) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "corrupt deflate stream",
                    ))
                }
            }
        }

        Ok(())
    }

    fn flush(&mut self) -> io::Result<BytesMut> {
        let dst = chunk(&mut self.output);
        let before_out = self.decompress.total_out();

        self.decompress
            .decompress(&[], dst, flate2::FlushDecompress::Sync)
            .map_err(inflate_error)?;

        let written = (self.decompress.total_out() - before_out) as usize;
        unsafe { self.output.advance_mut(written) };

        loop {
            let dst = chunk(&mut self.output);

            let before_out = self.decompress.total_out();
            self.decompress
                .decompress(&[], dst, flate2::FlushDecompress::None)
                .map_err(inflate_error)?;

            if before_out == self.decompress.total_out() {
                break Ok(self.output.split());
            }

            let written = (self.decompress.total_out() - before_out) as usize;
            unsafe { self.output.advance_mut(written) };
        }
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("compression error: {err}"))
}

fn inflate_error(err: DecompressError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, format!("decompression error: {err}"))
}

/// Returns a writable slice over the buffer's spare capacity, growing it
/// when full.
///
/// The returned bytes are uninitialized; callers must only read back what
/// the (de)compressor reports written before `advance_mut`.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        // chunk_mut would reserve only 64 bytes
        output.reserve(1024);
    }

    let spare = output.spare_capacity_mut();
    unsafe { &mut *(spare as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::OpCode;

    fn instance(options: DeflateOptions, server_params: &[Param]) -> Box<dyn Extension> {
        options.accept(server_params).unwrap()
    }

    #[test]
    fn compress_roundtrip_contextual() {
        let mut compressor = Compressor::new(CompressionLevel::default(), false);
        let mut decompressor = Decompressor::new(false);

        for message in [&b"first message"[..], b"second message", b"first message"] {
            let compressed = compressor.compress(message).unwrap();
            let restored = decompressor.decompress(&compressed).unwrap();
            assert_eq!(&restored[..], message);
        }
    }

    #[test]
    fn compress_roundtrip_no_context_takeover() {
        let mut compressor = Compressor::new(CompressionLevel::default(), true);
        let mut decompressor = Decompressor::new(true);

        let first = compressor.compress(b"repeated payload").unwrap();
        let restored = decompressor.decompress(&first).unwrap();
        assert_eq!(&restored[..], b"repeated payload");

        // With the dictionary reset, recompressing the same bytes yields
        // the same stream.
        let second = compressor.compress(b"repeated payload").unwrap();
        assert_eq!(first, second);
        let restored = decompressor.decompress(&second).unwrap();
        assert_eq!(&restored[..], b"repeated payload");
    }

    #[test]
    fn context_takeover_shrinks_repeats() {
        let mut compressor = Compressor::new(CompressionLevel::default(), false);

        let first = compressor.compress(b"a long enough repeated payload").unwrap();
        let second = compressor.compress(b"a long enough repeated payload").unwrap();
        assert!(second.len() < first.len());
    }

    #[test]
    fn compressed_output_has_no_sync_tail() {
        let mut compressor = Compressor::new(CompressionLevel::default(), false);
        let out = compressor.compress(b"tail check").unwrap();
        assert!(!out.ends_with(&[0x00, 0x00, 0xff, 0xff]));
    }

    #[test]
    fn empty_message_roundtrip() {
        let mut compressor = Compressor::new(CompressionLevel::default(), false);
        let mut decompressor = Decompressor::new(false);

        let compressed = compressor.compress(b"").unwrap();
        let restored = decompressor.decompress(&compressed).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn extension_sets_and_clears_rsv1() {
        let mut ext = instance(DeflateOptions::default(), &[]);

        let frame = RawFrame::new(true, OpCode::Text, &b"hello compression"[..]);
        let encoded = ext.encode(frame).unwrap();
        assert_eq!(encoded.rsv, RSV1);
        assert_ne!(&encoded.payload[..], b"hello compression");

        let decoded = ext.decode(encoded).unwrap();
        assert_eq!(decoded.rsv, 0);
        assert_eq!(&decoded.payload[..], b"hello compression");
    }

    #[test]
    fn extension_skips_control_frames() {
        let mut ext = instance(DeflateOptions::default(), &[]);

        let ping = RawFrame::new(true, OpCode::Ping, &b"ping"[..]);
        let encoded = ext.encode(ping).unwrap();
        assert_eq!(encoded.rsv, 0);
        assert_eq!(&encoded.payload[..], b"ping");
    }

    #[test]
    fn extension_passes_uncompressed_data_through_on_decode() {
        let mut ext = instance(DeflateOptions::default(), &[]);

        let frame = RawFrame::new(true, OpCode::Binary, &b"plain"[..]);
        let decoded = ext.decode(frame).unwrap();
        assert_eq!(decoded.rsv, 0);
        assert_eq!(&decoded.payload[..], b"plain");
    }

    #[test]
    fn offer_params_follow_header_grammar() {
        let options = DeflateOptions::default()
            .server_max_window_bits(10)
            .client_max_window_bits(0)
            .client_no_context_takeover();

        assert_eq!(
            options.params(),
            vec![
                ("server_max_window_bits".to_owned(), Some("10".to_owned())),
                ("client_max_window_bits".to_owned(), None),
                ("client_no_context_takeover".to_owned(), None),
            ]
        );
    }

    #[test]
    fn server_params_force_context_reset() {
        let mut ext = instance(
            DeflateOptions::default(),
            &[("client_no_context_takeover".to_owned(), None)],
        );

        let payload = b"the same message twice";
        let first = ext
            .encode(RawFrame::new(true, OpCode::Text, &payload[..]))
            .unwrap();
        let second = ext
            .encode(RawFrame::new(true, OpCode::Text, &payload[..]))
            .unwrap();
        assert_eq!(first.payload, second.payload);
    }
}
