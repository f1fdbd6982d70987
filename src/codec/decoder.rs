//! Framed Opus reader and decoder
//!
//! Reads recordings produced by `OpusFrameEncoder` back into PCM. Used by
//! the `inspect` command and to verify recordings in tests.

use opus::{Channels, Decoder};
use std::io::{ErrorKind, Read};

use crate::codec::{StreamHeader, FRAME_LENGTH_BYTES, HEADER_LEN};
use crate::error::CodecError;

/// Largest decoded frame: 120ms at 48 kHz stereo
const MAX_DECODED_SAMPLES: usize = 48000 * 2 * 120 / 1000;

/// Iterates the length-prefixed packets of a framed Opus stream
pub struct FramedOpusReader<R> {
    reader: R,
    header: StreamHeader,
}

impl<R: Read> FramedOpusReader<R> {
    /// Read and validate the stream header
    pub fn new(mut reader: R) -> Result<Self, CodecError> {
        let mut bytes = [0u8; HEADER_LEN];
        reader
            .read_exact(&mut bytes)
            .map_err(|e| CodecError::DecodingFailed(format!("missing stream header: {}", e)))?;
        let header = StreamHeader::parse(&bytes)?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> StreamHeader {
        self.header
    }

    /// Next packet, or `None` at a clean end of stream
    pub fn next_packet(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let mut prefix = [0u8; FRAME_LENGTH_BYTES];
        match self.reader.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(CodecError::DecodingFailed(e.to_string())),
        }

        let len = u16::from_le_bytes(prefix) as usize;
        let mut packet = vec![0u8; len];
        self.reader
            .read_exact(&mut packet)
            .map_err(|e| CodecError::DecodingFailed(format!("truncated packet: {}", e)))?;
        Ok(Some(packet))
    }
}

/// Opus decoder wrapper
pub struct OpusDecoder {
    decoder: Decoder,
    channels: u16,
    /// Decoding buffer (reused to avoid allocations)
    decode_buffer: Vec<i16>,
    frames_decoded: u64,
}

impl OpusDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::DecoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            channels,
            decode_buffer: vec![0i16; MAX_DECODED_SAMPLES],
            frames_decoded: 0,
        })
    }

    /// Decode one packet into interleaved samples
    pub fn decode(&mut self, packet: &[u8]) -> Result<Vec<i16>, CodecError> {
        let frames = self
            .decoder
            .decode(packet, &mut self.decode_buffer, false)
            .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;

        self.frames_decoded += 1;
        Ok(self.decode_buffer[..frames * self.channels as usize].to_vec())
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }
}

/// A fully decoded recording
#[derive(Debug, Clone)]
pub struct DecodedStream {
    pub header: StreamHeader,
    pub packets: usize,
    /// Interleaved samples
    pub samples: Vec<i16>,
}

impl DecodedStream {
    pub fn duration_secs(&self) -> f64 {
        let frames = self.samples.len() / self.header.channels.max(1) as usize;
        frames as f64 / self.header.sample_rate as f64
    }
}

/// Decode a whole framed stream. An empty input decodes to nothing.
pub fn decode_stream<R: Read>(reader: R) -> Result<Option<DecodedStream>, CodecError> {
    let mut reader = reader;
    let mut first = [0u8; 1];
    let n = reader
        .read(&mut first)
        .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
    if n == 0 {
        return Ok(None);
    }

    let mut framed = FramedOpusReader::new((&first[..]).chain(reader))?;
    let header = framed.header();
    let mut decoder = OpusDecoder::new(header.sample_rate, header.channels)?;

    let mut samples = Vec::new();
    let mut packets = 0;
    while let Some(packet) = framed.next_packet()? {
        samples.extend(decoder.decode(&packet)?);
        packets += 1;
    }

    Ok(Some(DecodedStream { header, packets, samples }))
}
