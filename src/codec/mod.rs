//! Compressed persistence codec
//!
//! Recordings are Opus frames in a minimal framed container:
//!
//! ```text
//! "OPFR" | version u8 | channels u8 | sample_rate u32 LE
//! then per frame: length u16 LE | Opus packet
//! ```
//!
//! The header is written lazily before the first frame, so a recording
//! that never received audio is an empty file.

pub mod decoder;
pub mod encoder;
pub mod streaming;

pub use decoder::{decode_stream, DecodedStream, FramedOpusReader, OpusDecoder};
pub use encoder::{adapt_channels, decode_s16le, EncoderStats, FrameEncoder, OpusFrameEncoder};
pub use streaming::{StreamingEncoder, StreamingStats};

use crate::error::CodecError;

/// Container magic
pub const MAGIC: &[u8; 4] = b"OPFR";

/// Container version
pub const VERSION: u8 = 1;

/// Encoded header size in bytes
pub const HEADER_LEN: usize = 10;

/// Size of the per-frame length prefix
pub const FRAME_LENGTH_BYTES: usize = 2;

/// Stream parameters carried in the container header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub channels: u16,
    pub sample_rate: u32,
}

impl StreamHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[..4].copy_from_slice(MAGIC);
        bytes[4] = VERSION;
        bytes[5] = self.channels as u8;
        bytes[6..].copy_from_slice(&self.sample_rate.to_le_bytes());
        bytes
    }

    pub fn parse(bytes: &[u8; HEADER_LEN]) -> Result<Self, CodecError> {
        if &bytes[..4] != MAGIC {
            return Err(CodecError::DecodingFailed("not a framed Opus stream".to_string()));
        }
        if bytes[4] != VERSION {
            return Err(CodecError::DecodingFailed(format!(
                "unsupported container version {}",
                bytes[4]
            )));
        }
        let channels = bytes[5] as u16;
        if !(1..=2).contains(&channels) {
            return Err(CodecError::DecodingFailed(format!("invalid channel count {}", channels)));
        }
        let sample_rate = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]);
        Ok(Self { channels, sample_rate })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = StreamHeader { channels: 2, sample_rate: 16000 };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[..4], b"OPFR");
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[5], 2);
        assert_eq!(&bytes[6..], &16000u32.to_le_bytes());
        assert_eq!(StreamHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_version() {
        let mut bytes = StreamHeader { channels: 1, sample_rate: 16000 }.to_bytes();
        bytes[4] = 9;
        assert!(StreamHeader::parse(&bytes).is_err());
    }
}
