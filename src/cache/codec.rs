//! Value Codec
//!
//! Every cached value is stored as a small tagged frame:
//!
//! ```text
//! ┌──────┬───────────┬──────────────────────────┐
//! │ tag  │ algorithm │ payload                  │
//! │ 1 B  │ 1 B       │ raw or compressed bytes  │
//! └──────┴───────────┴──────────────────────────┘
//! ```
//!
//! Payloads at or above the configured threshold are compressed. Compression
//! failures fall back to a raw frame and are never surfaced; decode failures
//! are returned as [`Error::Codec`] so tiers can treat them as a miss.

use crate::error::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Frame tag for raw payloads
const TAG_RAW: u8 = 0x00;

/// Frame tag for compressed payloads
const TAG_COMPRESSED: u8 = 0x01;

/// Tag + algorithm bytes
pub const FRAME_HEADER_LEN: usize = 2;

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Compression algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    #[default]
    Lz4,
    Zstd,
    Snappy,
}

impl CompressionAlgorithm {
    fn to_byte(self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
            CompressionAlgorithm::Zstd => 2,
            CompressionAlgorithm::Snappy => 3,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            2 => Some(CompressionAlgorithm::Zstd),
            3 => Some(CompressionAlgorithm::Snappy),
            _ => None,
        }
    }

    fn compress(self, data: &[u8], level: i32) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => lz4::block::compress(
                data,
                Some(lz4::block::CompressionMode::HIGHCOMPRESSION(level)),
                true,
            )
            .map_err(|e| Error::Codec(format!("LZ4 compression failed: {}", e))),
            CompressionAlgorithm::Zstd => zstd::encode_all(data, level)
                .map_err(|e| Error::Codec(format!("Zstd compression failed: {}", e))),
            CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::Codec(format!("Snappy compression failed: {}", e))),
        }
    }

    fn decompress(self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionAlgorithm::None => Ok(data.to_vec()),
            CompressionAlgorithm::Lz4 => lz4::block::decompress(data, None)
                .map_err(|e| Error::Codec(format!("LZ4 decompression failed: {}", e))),
            CompressionAlgorithm::Zstd => zstd::decode_all(data)
                .map_err(|e| Error::Codec(format!("Zstd decompression failed: {}", e))),
            CompressionAlgorithm::Snappy => snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(|e| Error::Codec(format!("Snappy decompression failed: {}", e))),
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressionAlgorithm::None => write!(f, "none"),
            CompressionAlgorithm::Lz4 => write!(f, "lz4"),
            CompressionAlgorithm::Zstd => write!(f, "zstd"),
            CompressionAlgorithm::Snappy => write!(f, "snappy"),
        }
    }
}

// =============================================================================
// Codec Configuration
// =============================================================================

/// Configuration for the codec
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Payloads of at least this many bytes are compressed
    pub compression_threshold: usize,
    /// Algorithm used above the threshold
    pub algorithm: CompressionAlgorithm,
    /// Compression level (algorithm-specific)
    pub level: i32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            compression_threshold: 4 * 1024,
            algorithm: CompressionAlgorithm::Lz4,
            level: 3,
        }
    }
}

// =============================================================================
// Codec
// =============================================================================

/// An encoded frame ready to store
#[derive(Debug, Clone)]
pub struct Encoded {
    pub frame: Bytes,
    pub compressed: bool,
}

/// Frame encoder/decoder
#[derive(Debug, Clone, Default)]
pub struct Codec {
    config: CodecConfig,
}

impl Codec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Encode raw bytes into a frame
    pub fn encode(&self, value: &[u8]) -> Encoded {
        let algorithm = self.config.algorithm;
        if algorithm != CompressionAlgorithm::None && value.len() >= self.config.compression_threshold
        {
            match algorithm.compress(value, self.config.level) {
                Ok(compressed) if compressed.len() < value.len() => {
                    return Encoded {
                        frame: frame(TAG_COMPRESSED, algorithm, &compressed),
                        compressed: true,
                    };
                }
                Ok(_) => {}
                Err(e) => warn!(algorithm = %algorithm, error = %e, "Compression failed, storing raw"),
            }
        }

        Encoded {
            frame: frame(TAG_RAW, CompressionAlgorithm::None, value),
            compressed: false,
        }
    }

    /// Decode a frame back to the original bytes
    pub fn decode(&self, frame: &Bytes) -> Result<Bytes> {
        if frame.len() < FRAME_HEADER_LEN {
            return Err(Error::Codec(format!("frame too short: {} bytes", frame.len())));
        }
        match frame[0] {
            TAG_RAW => Ok(frame.slice(FRAME_HEADER_LEN..)),
            TAG_COMPRESSED => {
                let algorithm = CompressionAlgorithm::from_byte(frame[1])
                    .ok_or_else(|| Error::Codec(format!("unknown algorithm byte {}", frame[1])))?;
                algorithm
                    .decompress(&frame[FRAME_HEADER_LEN..])
                    .map(Bytes::from)
            }
            tag => Err(Error::Codec(format!("unknown frame tag {:#04x}", tag))),
        }
    }

    /// Serialize a typed value as JSON and encode it
    pub fn encode_value<T: Serialize>(&self, value: &T) -> Result<Encoded> {
        let raw = serde_json::to_vec(value)?;
        Ok(self.encode(&raw))
    }

    /// Decode a frame and deserialize it as JSON
    pub fn decode_value<T: DeserializeOwned>(&self, frame: &Bytes) -> Result<T> {
        let raw = self.decode(frame)?;
        serde_json::from_slice(&raw).map_err(|e| Error::Codec(format!("JSON decode failed: {}", e)))
    }
}

fn frame(tag: u8, algorithm: CompressionAlgorithm, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(tag);
    buf.put_u8(algorithm.to_byte());
    buf.put_slice(payload);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compressible(len: usize) -> Vec<u8> {
        b"risk-score:features:".iter().cycle().take(len).copied().collect()
    }

    #[test]
    fn test_small_values_stay_raw() {
        let codec = Codec::default();
        let encoded = codec.encode(b"tiny");
        assert!(!encoded.compressed);
        assert_eq!(encoded.frame.len(), FRAME_HEADER_LEN + 4);
        assert_eq!(codec.decode(&encoded.frame).unwrap().as_ref(), b"tiny");
    }

    #[test]
    fn test_large_values_compress_with_each_algorithm() {
        for algorithm in [
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Zstd,
            CompressionAlgorithm::Snappy,
        ] {
            let codec = Codec::new(CodecConfig {
                compression_threshold: 64,
                algorithm,
                level: 3,
            });
            let data = compressible(8 * 1024);
            let encoded = codec.encode(&data);
            assert!(encoded.compressed, "{} should compress", algorithm);
            assert!(encoded.frame.len() < data.len());
            assert_eq!(codec.decode(&encoded.frame).unwrap().as_ref(), &data[..]);
        }
    }

    #[test]
    fn test_incompressible_falls_back_to_raw() {
        let codec = Codec::new(CodecConfig {
            compression_threshold: 16,
            ..Default::default()
        });
        // 64 distinct bytes: LZ4 output is larger than the input
        let data: Vec<u8> = (0..64u8).collect();
        let encoded = codec.encode(&data);
        assert!(!encoded.compressed);
        assert_eq!(codec.decode(&encoded.frame).unwrap().as_ref(), &data[..]);
    }

    #[test]
    fn test_corrupt_frames_are_rejected() {
        let codec = Codec::default();
        assert!(codec.decode(&Bytes::from_static(b"")).is_err());
        assert!(codec.decode(&Bytes::from_static(&[0x07, 0x00, 1, 2])).is_err());
        assert!(codec
            .decode(&Bytes::from_static(&[TAG_COMPRESSED, 0x01, 0xff, 0xff, 0xff, 0x7f, 9]))
            .is_err());
        assert!(codec.decode(&Bytes::from_static(&[TAG_COMPRESSED, 0x09, 1])).is_err());
    }

    #[test]
    fn test_typed_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Score {
            business: String,
            score: f64,
        }

        let codec = Codec::default();
        let score = Score {
            business: "acme".into(),
            score: 0.42,
        };
        let encoded = codec.encode_value(&score).unwrap();
        let decoded: Score = codec.decode_value(&encoded.frame).unwrap();
        assert_eq!(decoded, score);
    }
}
