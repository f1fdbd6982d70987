//! Opus frame encoder
//!
//! Turns an open-ended stream of interleaved i16 samples into fixed 20ms
//! Opus frames written to a byte sink in the framed container format
//! (see `codec` module docs). Samples that do not fill a whole frame are
//! carried over to the next `write`; `finish` pads the last partial frame
//! with silence.

use opus::{Application, Bitrate, Channels, Encoder};
use std::io::Write;

use crate::codec::{StreamHeader, FRAME_LENGTH_BYTES};
use crate::constants::{MAX_OPUS_PACKET, OPUS_FRAME_MS};
use crate::error::CodecError;

/// Compressing stage behind the streaming encoder and the recorder
pub trait FrameEncoder: Send {
    /// Interleaved channel count `write` expects
    fn channels(&self) -> u16;

    /// Encode `samples` (interleaved, `channels()` wide) into `sink`
    fn write(&mut self, sink: &mut dyn Write, samples: &[i16]) -> Result<(), CodecError>;

    /// Emit anything still pending and flush `sink`. Safe to call repeatedly.
    fn finish(&mut self, sink: &mut dyn Write) -> Result<(), CodecError>;
}

/// Decode an S16LE batch. An odd byte count is malformed input.
pub fn decode_s16le(pcm: &[u8]) -> Result<Vec<i16>, CodecError> {
    if pcm.len() % 2 != 0 {
        return Err(CodecError::OddByteCount(pcm.len()));
    }
    Ok(pcm
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect())
}

/// Convert samples between channel layouts.
///
/// Only mono to stereo changes anything: each sample is duplicated into
/// both channels. Other combinations are passed through.
pub fn adapt_channels(samples: Vec<i16>, from: u16, to: u16) -> Vec<i16> {
    if from == 1 && to == 2 {
        let mut stereo = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            stereo.push(sample);
            stereo.push(sample);
        }
        stereo
    } else {
        samples
    }
}

/// Encoder statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
}

/// Opus encoder emitting length-prefixed frames
pub struct OpusFrameEncoder {
    encoder: Encoder,
    header: StreamHeader,
    /// Interleaved samples per frame
    frame_len: usize,
    /// Samples waiting for a full frame
    pending: Vec<i16>,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    header_written: bool,
    stats: EncoderStats,
}

impl OpusFrameEncoder {
    /// Create an encoder for `channels` interleaved channels at `sample_rate`.
    ///
    /// Opus accepts 8, 12, 16, 24 and 48 kHz; anything else fails here.
    pub fn new(sample_rate: u32, channels: u16, bitrate: u32) -> Result<Self, CodecError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(CodecError::EncoderInit(format!(
                    "Unsupported channel count: {}",
                    channels
                )))
            }
        };

        let mut encoder = Encoder::new(sample_rate, opus_channels, Application::Voip)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        encoder
            .set_bitrate(Bitrate::Bits(bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
        encoder
            .set_vbr(true)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;
        // Recordings are written locally; no loss to protect against
        encoder
            .set_inband_fec(false)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        let frame_len = (sample_rate * OPUS_FRAME_MS / 1000) as usize * channels as usize;

        Ok(Self {
            encoder,
            header: StreamHeader { channels, sample_rate },
            frame_len,
            pending: Vec::with_capacity(frame_len * 2),
            encode_buffer: vec![0u8; MAX_OPUS_PACKET],
            header_written: false,
            stats: EncoderStats::default(),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.header.sample_rate
    }

    /// Interleaved samples consumed per Opus frame
    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples carried over, waiting for a full frame
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> EncoderStats {
        self.stats
    }

    fn write_header(&mut self, sink: &mut dyn Write) -> Result<(), CodecError> {
        if !self.header_written {
            sink.write_all(&self.header.to_bytes()).map_err(sink_error)?;
            self.header_written = true;
        }
        Ok(())
    }

    fn encode_frame(&mut self, sink: &mut dyn Write, frame: &[i16]) -> Result<(), CodecError> {
        let size = self
            .encoder
            .encode(frame, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        let mut prefix = [0u8; FRAME_LENGTH_BYTES];
        prefix.copy_from_slice(&(size as u16).to_le_bytes());
        sink.write_all(&prefix).map_err(sink_error)?;
        sink.write_all(&self.encode_buffer[..size]).map_err(sink_error)?;

        self.stats.frames_encoded += 1;
        self.stats.bytes_produced += (FRAME_LENGTH_BYTES + size) as u64;
        Ok(())
    }
}

impl FrameEncoder for OpusFrameEncoder {
    fn channels(&self) -> u16 {
        self.header.channels
    }

    fn write(&mut self, sink: &mut dyn Write, samples: &[i16]) -> Result<(), CodecError> {
        if samples.is_empty() {
            return Ok(());
        }
        self.write_header(sink)?;
        self.pending.extend_from_slice(samples);

        let whole = self.pending.len() / self.frame_len * self.frame_len;
        if whole == 0 {
            return Ok(());
        }

        let pending = std::mem::take(&mut self.pending);
        let result = pending[..whole]
            .chunks_exact(self.frame_len)
            .try_for_each(|frame| self.encode_frame(sink, frame));
        self.pending = pending[whole..].to_vec();
        result
    }

    fn finish(&mut self, sink: &mut dyn Write) -> Result<(), CodecError> {
        if !self.pending.is_empty() {
            self.write_header(sink)?;
            let mut frame = std::mem::take(&mut self.pending);
            frame.resize(self.frame_len, 0);
            self.encode_frame(sink, &frame)?;
        }
        sink.flush().map_err(sink_error)
    }
}

fn sink_error(e: std::io::Error) -> CodecError {
    CodecError::Sink(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decoder::FramedOpusReader;
    use std::io::Cursor;

    fn tone(len: usize) -> Vec<i16> {
        (0..len)
            .map(|i| ((i as f32 * 0.1).sin() * 8000.0) as i16)
            .collect()
    }

    #[test]
    fn test_encoder_creation() {
        let encoder = OpusFrameEncoder::new(16000, 1, 32000).unwrap();
        assert_eq!(encoder.channels(), 1);
        assert_eq!(encoder.sample_rate(), 16000);
        // 20ms at 16 kHz
        assert_eq!(encoder.frame_len(), 320);

        let stereo = OpusFrameEncoder::new(48000, 2, 64000).unwrap();
        assert_eq!(stereo.frame_len(), 960 * 2);
    }

    #[test]
    fn test_rejects_bad_layout() {
        assert!(matches!(
            OpusFrameEncoder::new(16000, 3, 32000),
            Err(CodecError::EncoderInit(_))
        ));
        assert!(matches!(
            OpusFrameEncoder::new(44100, 1, 32000),
            Err(CodecError::EncoderInit(_))
        ));
    }

    #[test]
    fn test_partial_frames_carry_over() {
        let mut encoder = OpusFrameEncoder::new(16000, 1, 32000).unwrap();
        let mut sink = Vec::new();

        encoder.write(&mut sink, &tone(500)).unwrap();
        assert_eq!(encoder.stats().frames_encoded, 1);
        assert_eq!(encoder.pending_samples(), 180);

        encoder.write(&mut sink, &tone(140)).unwrap();
        assert_eq!(encoder.stats().frames_encoded, 2);
        assert_eq!(encoder.pending_samples(), 0);
    }

    #[test]
    fn test_finish_pads_last_frame() {
        let mut encoder = OpusFrameEncoder::new(16000, 1, 32000).unwrap();
        let mut sink = Vec::new();

        // 2048 samples = 6 full frames + 128 samples
        encoder.write(&mut sink, &tone(2048)).unwrap();
        assert_eq!(encoder.stats().frames_encoded, 6);
        encoder.finish(&mut sink).unwrap();
        assert_eq!(encoder.stats().frames_encoded, 7);

        // a second finish has nothing left to emit
        let len = sink.len();
        encoder.finish(&mut sink).unwrap();
        assert_eq!(sink.len(), len);

        let mut reader = FramedOpusReader::new(Cursor::new(sink)).unwrap();
        assert_eq!(reader.header().channels, 1);
        assert_eq!(reader.header().sample_rate, 16000);
        let mut packets = 0;
        while reader.next_packet().unwrap().is_some() {
            packets += 1;
        }
        assert_eq!(packets, 7);
    }

    #[test]
    fn test_finish_without_audio_writes_nothing() {
        let mut encoder = OpusFrameEncoder::new(16000, 1, 32000).unwrap();
        let mut sink = Vec::new();
        encoder.write(&mut sink, &[]).unwrap();
        encoder.finish(&mut sink).unwrap();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_decode_s16le() {
        assert_eq!(decode_s16le(&[1, 0, 0xff, 0xff]).unwrap(), vec![1, -1]);
        assert_eq!(decode_s16le(&[]).unwrap(), Vec::<i16>::new());
        assert_eq!(decode_s16le(&[1, 2, 3]), Err(CodecError::OddByteCount(3)));
    }

    #[test]
    fn test_adapt_channels() {
        assert_eq!(adapt_channels(vec![1, 2, 3], 1, 2), vec![1, 1, 2, 2, 3, 3]);
        assert_eq!(adapt_channels(vec![1, 2, 3], 1, 1), vec![1, 2, 3]);
        assert_eq!(adapt_channels(vec![1, 2], 2, 2), vec![1, 2]);
    }
}
