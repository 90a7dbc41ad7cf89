//! Block compression codecs.
//!
//! Only the 4 KiB page variant compresses blocks. A compressed block is a
//! zlib stream (RFC 1950) and its trailer records the inflated size; a
//! block whose recorded size is zero or equal to its stored size is
//! stored verbatim.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    None,
    Deflate,
}

impl CodecId {
    /// Codec implied by a block trailer's stored and inflated sizes.
    pub fn for_block(stored_size: usize, inflated_size: usize) -> Self {
        if inflated_size == 0 || inflated_size == stored_size {
            CodecId::None
        } else {
            CodecId::Deflate
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecId::None    => "none",
            CodecId::Deflate => "deflate",
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression error: {0}")]
    Compression(String),
    #[error("decompression error: {0}")]
    Decompression(String),
    #[error("inflated {found} bytes, trailer declares {expected}")]
    SizeMismatch { expected: usize, found: usize },
}

// ── Codec trait ──────────────────────────────────────────────────────────────

pub trait Codec: Send + Sync {
    fn codec_id(&self) -> CodecId;
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError>;
    /// Inflate `data` into exactly `expected_size` bytes.
    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError>;
}

pub struct NoneCodec;
impl Codec for NoneCodec {
    fn codec_id(&self) -> CodecId { CodecId::None }
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
    fn decompress(&self, data: &[u8], _: usize) -> Result<Vec<u8>, CodecError> { Ok(data.to_vec()) }
}

pub struct DeflateCodec;
impl Codec for DeflateCodec {
    fn codec_id(&self) -> CodecId { CodecId::Deflate }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).map_err(|e| CodecError::Compression(e.to_string()))?;
        encoder.finish().map_err(|e| CodecError::Compression(e.to_string()))
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>, CodecError> {
        trace!("inflating {} bytes -> {} bytes (expected)", data.len(), expected_size);
        let mut out = Vec::with_capacity(expected_size);
        ZlibDecoder::new(data)
            .take(expected_size as u64 + 1)
            .read_to_end(&mut out)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        if out.len() != expected_size {
            return Err(CodecError::SizeMismatch { expected: expected_size, found: out.len() });
        }
        Ok(out)
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_codec(id: CodecId) -> Box<dyn Codec> {
    match id {
        CodecId::None    => Box::new(NoneCodec),
        CodecId::Deflate => Box::new(DeflateCodec),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deflate_roundtrip() {
        let data = b"Subject: quarterly report\r\n".repeat(200);
        let codec = get_codec(CodecId::Deflate);
        let packed = codec.compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(codec.decompress(&packed, data.len()).unwrap(), data);
    }

    #[test]
    fn deflate_rejects_wrong_size() {
        let codec = DeflateCodec;
        let packed = codec.compress(&[7u8; 300]).unwrap();
        assert!(matches!(
            codec.decompress(&packed, 299),
            Err(CodecError::SizeMismatch { expected: 299, found: 300 })
        ));
        assert!(matches!(
            codec.decompress(&packed, 301),
            Err(CodecError::SizeMismatch { expected: 301, found: 300 })
        ));
    }

    #[test]
    fn deflate_rejects_garbage() {
        assert!(matches!(
            DeflateCodec.decompress(&[0x12, 0x34, 0x56], 10),
            Err(CodecError::Decompression(_))
        ));
    }

    #[test]
    fn codec_selection_from_trailer() {
        assert_eq!(CodecId::for_block(100, 0), CodecId::None);
        assert_eq!(CodecId::for_block(100, 100), CodecId::None);
        assert_eq!(CodecId::for_block(100, 4000), CodecId::Deflate);
    }
}
