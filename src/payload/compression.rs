//! gzip compression wrapper for any [`PayloadCodec`]
//!
//! With compression enabled the compressed form is kept only when it is
//! strictly shorter, decided per message. Decoding always recognizes gzip
//! input by its magic bytes, whether or not outbound compression is on.

use super::{Payload, PayloadCodec};
use crate::error::{DecodeError, EncodeError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use tracing::{debug, trace};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Decorates a codec with gzip handling
///
/// Inbound gzip is always inflated; outbound compression is opt-in.
#[derive(Debug, Clone, Default)]
pub struct Compressed<C> {
    inner: C,
    compress: bool,
}

impl<C: PayloadCodec> Compressed<C> {
    /// Compresses on encode when that saves bytes
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            compress: true,
        }
    }

    /// Encodes plain but still accepts gzip input
    pub fn decode_only(inner: C) -> Self {
        Self {
            inner,
            compress: false,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

/// Returns `bytes` compressed if that is strictly shorter, else unchanged
pub fn compress_if_smaller(bytes: Vec<u8>) -> Result<Vec<u8>, EncodeError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&bytes).map_err(EncodeError::Compression)?;
    let compressed = encoder.finish().map_err(EncodeError::Compression)?;

    if compressed.len() < bytes.len() {
        trace!("Compressed payload {} -> {} bytes", bytes.len(), compressed.len());
        Ok(compressed)
    } else {
        trace!(
            "Keeping uncompressed payload ({} bytes, compressed {})",
            bytes.len(),
            compressed.len()
        );
        Ok(bytes)
    }
}

pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(GZIP_MAGIC)
}

pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(DecodeError::Decompression)?;
    Ok(out)
}

impl<C: PayloadCodec> PayloadCodec for Compressed<C> {
    fn encode(&self, payload: &Payload) -> Result<Vec<u8>, EncodeError> {
        let bytes = self.inner.encode(payload)?;
        if self.compress {
            compress_if_smaller(bytes)
        } else {
            Ok(bytes)
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Payload, DecodeError> {
        if !is_compressed(bytes) {
            return self.inner.decode(bytes);
        }
        match decompress(bytes) {
            Ok(plain) => self.inner.decode(&plain),
            Err(e) => {
                debug!("Not a gzip stream, decoding as is: {}", e);
                self.inner.decode(bytes)
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{codec_for, BinaryCodec, JsonCodec, MetricValue, PayloadEncoding};

    #[test]
    fn incompressible_input_is_returned_unchanged() {
        let input = b"short".to_vec();
        assert_eq!(compress_if_smaller(input.clone()).expect("compress"), input);
    }

    #[test]
    fn repetitive_payload_is_compressed_and_restored() {
        let codec = Compressed::new(JsonCodec);
        let mut payload = Payload::new();
        payload.add_metric("log", "abcdefgh".repeat(200));

        let plain = JsonCodec.encode(&payload).expect("plain");
        let bytes = codec.encode(&payload).expect("encode");
        assert!(is_compressed(&bytes));
        assert!(bytes.len() < plain.len());

        let decoded = codec.decode(&bytes).expect("decode");
        assert_eq!(
            decoded.metric("log"),
            Some(&MetricValue::String("abcdefgh".repeat(200)))
        );
    }

    #[test]
    fn uncompressed_input_still_decodes() {
        let codec = Compressed::new(BinaryCodec);
        let mut payload = Payload::new();
        payload.add_metric("n", 1i32);

        let plain = BinaryCodec.encode(&payload).expect("encode");
        assert_eq!(codec.decode(&plain).expect("decode"), payload);
    }

    #[test]
    fn gzip_input_decodes_with_compression_disabled() {
        let mut payload = Payload::new();
        payload.add_metric("reading", "0123456789".repeat(50));
        let gzipped = Compressed::new(BinaryCodec).encode(&payload).expect("encode");
        assert!(is_compressed(&gzipped));

        let codec = codec_for(PayloadEncoding::Protobuf, false);
        assert_eq!(codec.decode(&gzipped).expect("decode"), payload);

        let plain = codec.encode(&payload).expect("encode");
        assert!(!is_compressed(&plain));
    }

    #[test]
    fn broken_gzip_stream_falls_back_to_inner_codec() {
        let bytes = [0x1f, 0x8b, b'n', b'o', b'p', b'e'];

        let decoded = Compressed::new(JsonCodec).decode(&bytes).expect("lenient");
        assert_eq!(decoded.body.as_deref(), Some(&bytes[..]));

        assert!(Compressed::new(BinaryCodec).decode(&bytes).is_err());
    }
}
