//! Threshold-batched streaming encoder
//!
//! Consumes the lossless persistence stream: PCM packets are appended to
//! a buffer and, once `buffer_threshold` bytes are held, the whole buffer
//! is decoded as S16LE, adapted to the frame encoder's channel layout and
//! encoded into the sink.
//!
//! The loop ends when the input channel closes (clean) or the token is
//! cancelled. Either way the packets still queued are consumed and the
//! remainder is flushed before `wait` returns.

use crossbeam_channel::{select, Receiver};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::audio::Packet;
use crate::cancel::{CancelToken, FirstError};
use crate::codec::encoder::{adapt_channels, decode_s16le, FrameEncoder, OpusFrameEncoder};
use crate::config::EncoderConfig;
use crate::error::CodecError;

/// Streaming encoder counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingStats {
    /// Batches handed to the frame encoder
    pub batches: u64,
    /// PCM bytes received
    pub pcm_bytes: u64,
}

struct Core<W> {
    buffer: Vec<u8>,
    encoder: Box<dyn FrameEncoder>,
    sink: W,
    stats: StreamingStats,
}

impl<W: Write> Core<W> {
    fn push(&mut self, packet: &[u8], threshold: usize) -> Result<(), CodecError> {
        self.buffer.extend_from_slice(packet);
        self.stats.pcm_bytes += packet.len() as u64;
        if self.buffer.len() >= threshold {
            self.encode_buffered()?;
        }
        Ok(())
    }

    fn encode_buffered(&mut self) -> Result<(), CodecError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        // a malformed batch is discarded either way
        let pcm = std::mem::take(&mut self.buffer);
        let samples = decode_s16le(&pcm)?;
        let samples = adapt_channels(samples, 1, self.encoder.channels());
        self.encoder.write(&mut self.sink, &samples)?;
        self.stats.batches += 1;
        tracing::trace!("Encoded batch of {} bytes", pcm.len());
        Ok(())
    }

    /// Encode the buffered remainder; a partial Opus frame stays pending
    fn flush(&mut self) -> Result<(), CodecError> {
        self.encode_buffered()?;
        self.sink
            .flush()
            .map_err(|e| CodecError::Sink(e.to_string()))
    }

    /// Flush, then pad and encode the last partial frame
    fn finish(&mut self) -> Result<(), CodecError> {
        self.encode_buffered()?;
        self.encoder.finish(&mut self.sink)
    }
}

/// Streaming encoder over a receiver of PCM packets
pub struct StreamingEncoder<W> {
    config: EncoderConfig,
    input: Option<Receiver<Packet>>,
    core: Arc<Mutex<Core<W>>>,
    error: Arc<FirstError<CodecError>>,
    thread_handle: Option<JoinHandle<()>>,
    started: bool,
}

impl<W: Write + Send + 'static> StreamingEncoder<W> {
    /// Validate `config` and build an Opus frame encoder writing to `sink`.
    ///
    /// The frame encoder uses `config.output_channels`; with 2 every mono
    /// sample is duplicated into both channels.
    pub fn new(config: EncoderConfig, input: Receiver<Packet>, sink: W) -> Result<Self, CodecError> {
        config.validate()?;
        let encoder = OpusFrameEncoder::new(config.sample_rate, config.output_channels, config.bitrate)?;
        Self::with_encoder(config, input, sink, Box::new(encoder))
    }

    /// Use a caller-supplied frame encoder
    pub fn with_encoder(
        config: EncoderConfig,
        input: Receiver<Packet>,
        sink: W,
        encoder: Box<dyn FrameEncoder>,
    ) -> Result<Self, CodecError> {
        config.validate()?;
        Ok(Self {
            config,
            input: Some(input),
            core: Arc::new(Mutex::new(Core {
                buffer: Vec::with_capacity(config.buffer_threshold),
                encoder,
                sink,
                stats: StreamingStats::default(),
            })),
            error: Arc::new(FirstError::new("streaming encoder")),
            thread_handle: None,
            started: false,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Start the ingest loop. Fails if already started.
    pub fn start(&mut self, token: &CancelToken) -> Result<(), CodecError> {
        if self.started {
            return Err(CodecError::AlreadyStarted);
        }
        let input = self.input.take().ok_or(CodecError::AlreadyStarted)?;

        let core = self.core.clone();
        let error = self.error.clone();
        let token = token.clone();
        let threshold = self.config.buffer_threshold;

        let handle = thread::Builder::new()
            .name("stream-encoder".to_string())
            .spawn(move || ingest(input, core, error, token, threshold))
            .map_err(|e| CodecError::Spawn(e.to_string()))?;

        self.thread_handle = Some(handle);
        self.started = true;
        tracing::info!(
            "Streaming encoder started: {}Hz, threshold {} bytes ({:?} per batch)",
            self.config.sample_rate,
            self.config.buffer_threshold,
            self.config.batch_duration()
        );
        Ok(())
    }

    /// Encode any buffered remainder without waiting for the threshold.
    ///
    /// Samples short of a whole Opus frame are carried into the next batch,
    /// so a flush mid-stream never inserts silence. The last partial frame
    /// is padded only when the ingest loop ends. Safe to call repeatedly.
    pub fn flush(&self) -> Result<(), CodecError> {
        let result = self.core.lock().flush();
        if let Err(e) = &result {
            self.error.set(e.clone());
        }
        result
    }

    /// Block until the ingest loop has exited and flushed.
    /// Returns the first error recorded, if any.
    pub fn wait(&mut self) -> Result<(), CodecError> {
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                self.error.set(CodecError::EncodingFailed("encoder thread panicked".to_string()));
            }
        }
        match self.error.get() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> StreamingStats {
        self.core.lock().stats
    }

    /// Wait for the loop and hand back the sink.
    /// Fails with the first recorded error, like `wait`.
    pub fn into_sink(mut self) -> Result<W, CodecError> {
        self.wait()?;
        let core = Arc::try_unwrap(self.core)
            .map_err(|_| CodecError::EncodingFailed("sink still in use".to_string()))?;
        Ok(core.into_inner().sink)
    }
}

fn ingest<W: Write>(
    input: Receiver<Packet>,
    core: Arc<Mutex<Core<W>>>,
    error: Arc<FirstError<CodecError>>,
    token: CancelToken,
    threshold: usize,
) {
    let push = |packet: &[u8]| -> bool {
        match core.lock().push(packet, threshold) {
            Ok(()) => true,
            // only this batch is lost
            Err(e @ CodecError::OddByteCount(_)) => {
                error.set(e);
                true
            }
            Err(e) => {
                error.set(e);
                false
            }
        }
    };

    let cancelled = loop {
        select! {
            recv(input) -> msg => match msg {
                Ok(packet) => {
                    if !push(&packet) {
                        tracing::warn!("Streaming encoder stopped after sink failure");
                        return;
                    }
                }
                Err(_) => break false,
            },
            recv(token.signal()) -> _ => break true,
        }
    };

    if cancelled {
        let queued = input.len();
        for packet in input.try_iter().take(queued) {
            if !push(&packet) {
                return;
            }
        }
        tracing::debug!("Streaming encoder cancelled, drained {} queued packet(s)", queued);
    }

    if let Err(e) = core.lock().finish() {
        error.set(e);
    }
    if cancelled {
        error.set(CodecError::Cancelled);
    }

    let stats = core.lock().stats;
    tracing::info!(
        "Streaming encoder stopped: {} batch(es), {} PCM bytes",
        stats.batches,
        stats.pcm_bytes
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decoder::decode_stream;
    use crossbeam_channel::bounded;
    use bytes::Bytes;
    use std::io::{self, Cursor};

    /// Records every batch instead of compressing it
    struct RecordingEncoder {
        channels: u16,
        batches: Arc<Mutex<Vec<Vec<i16>>>>,
        finishes: Arc<Mutex<usize>>,
    }

    impl FrameEncoder for RecordingEncoder {
        fn channels(&self) -> u16 {
            self.channels
        }

        fn write(&mut self, sink: &mut dyn Write, samples: &[i16]) -> Result<(), CodecError> {
            for sample in samples {
                sink.write_all(&sample.to_le_bytes())
                    .map_err(|e| CodecError::Sink(e.to_string()))?;
            }
            self.batches.lock().push(samples.to_vec());
            Ok(())
        }

        fn finish(&mut self, _sink: &mut dyn Write) -> Result<(), CodecError> {
            *self.finishes.lock() += 1;
            Ok(())
        }
    }

    type Batches = Arc<Mutex<Vec<Vec<i16>>>>;

    fn recording(
        threshold: usize,
        channels: u16,
    ) -> (StreamingEncoder<Vec<u8>>, crossbeam_channel::Sender<Packet>, Batches) {
        let (tx, rx) = bounded(64);
        let batches = Arc::new(Mutex::new(Vec::new()));
        let encoder = RecordingEncoder {
            channels,
            batches: batches.clone(),
            finishes: Arc::new(Mutex::new(0)),
        };
        let config = EncoderConfig { buffer_threshold: threshold, ..EncoderConfig::default() };
        let streaming = StreamingEncoder::with_encoder(config, rx, Vec::new(), Box::new(encoder)).unwrap();
        (streaming, tx, batches)
    }

    struct FailingSink;

    impl Write for FailingSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (_tx, rx) = bounded::<Packet>(1);
        let config = EncoderConfig { channels: 2, ..EncoderConfig::default() };
        assert!(matches!(
            StreamingEncoder::new(config, rx.clone(), Vec::new()),
            Err(CodecError::InvalidConfig(_))
        ));

        let config = EncoderConfig { buffer_threshold: 0, ..EncoderConfig::default() };
        assert!(StreamingEncoder::new(config, rx, Vec::new()).is_err());
    }

    #[test]
    fn test_start_twice() {
        let token = CancelToken::new();
        let (mut encoder, tx, _) = recording(4, 1);
        encoder.start(&token).unwrap();
        assert_eq!(encoder.start(&token), Err(CodecError::AlreadyStarted));
        drop(tx);
        assert!(encoder.wait().is_ok());
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let (encoder, _tx, batches) = recording(4, 1);
        assert!(encoder.flush().is_ok());
        assert!(encoder.flush().is_ok());
        assert!(batches.lock().is_empty());
        assert_eq!(encoder.stats(), StreamingStats::default());
    }

    #[test]
    fn test_flush_keeps_partial_frame_pending() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(8);
        let mut encoder = StreamingEncoder::new(EncoderConfig::default(), rx, Vec::new()).unwrap();
        encoder.start(&token).unwrap();

        // 100 samples, well below one 320-sample frame
        tx.send(Bytes::from(vec![0x20u8; 200])).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while encoder.stats().pcm_bytes < 200 && std::time::Instant::now() < deadline {
            thread::sleep(std::time::Duration::from_millis(1));
        }
        encoder.flush().unwrap();
        assert_eq!(encoder.stats().batches, 1);

        tx.send(Bytes::from(vec![0x20u8; 200])).unwrap();
        drop(tx);

        assert!(encoder.wait().is_ok());
        let sink = encoder.into_sink().unwrap();
        let decoded = decode_stream(Cursor::new(sink)).unwrap().unwrap();
        // 200 samples padded once at the end, not once per flush
        assert_eq!(decoded.packets, 1);
        assert_eq!(decoded.samples.len(), 320);
    }

    #[test]
    fn test_into_sink_reports_error() {
        let token = CancelToken::new();
        let (mut encoder, tx, _) = recording(4096, 1);
        encoder.start(&token).unwrap();
        token.cancel();
        assert_eq!(encoder.into_sink(), Err(CodecError::Cancelled));
        drop(tx);
    }

    #[test]
    fn test_threshold_batches() {
        let token = CancelToken::new();
        let (mut encoder, tx, batches) = recording(8, 1);
        encoder.start(&token).unwrap();

        // 6 + 6 bytes crosses the threshold once, then 2 bytes remain
        tx.send(Bytes::from_static(&[1, 0, 2, 0, 3, 0])).unwrap();
        tx.send(Bytes::from_static(&[4, 0, 5, 0, 6, 0])).unwrap();
        tx.send(Bytes::from_static(&[7, 0])).unwrap();
        drop(tx);

        assert!(encoder.wait().is_ok());
        let batches = batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(batches[1], vec![7]);
        assert_eq!(encoder.stats(), StreamingStats { batches: 2, pcm_bytes: 14 });
    }

    #[test]
    fn test_mono_duplicated_for_stereo_encoder() {
        let token = CancelToken::new();
        let (mut encoder, tx, batches) = recording(4, 2);
        encoder.start(&token).unwrap();
        tx.send(Bytes::from_static(&[1, 0, 2, 0])).unwrap();
        drop(tx);

        assert!(encoder.wait().is_ok());
        assert_eq!(batches.lock()[0], vec![1, 1, 2, 2]);
        let sink = encoder.into_sink().unwrap();
        assert_eq!(sink, vec![1, 0, 1, 0, 2, 0, 2, 0]);
    }

    #[test]
    fn test_odd_batch_is_error_but_encoding_continues() {
        let token = CancelToken::new();
        let (mut encoder, tx, batches) = recording(3, 1);
        encoder.start(&token).unwrap();
        tx.send(Bytes::from_static(&[1, 0, 2])).unwrap();
        tx.send(Bytes::from_static(&[3, 0, 4, 0])).unwrap();
        drop(tx);

        assert_eq!(encoder.wait(), Err(CodecError::OddByteCount(3)));
        assert_eq!(batches.lock().as_slice(), &[vec![3, 4]]);
    }

    #[test]
    fn test_cancel_surfaces_error_and_flushes() {
        let token = CancelToken::new();
        let (mut encoder, tx, batches) = recording(4096, 1);
        tx.send(Bytes::from_static(&[9, 0, 8, 0])).unwrap();
        encoder.start(&token).unwrap();
        token.cancel();

        assert_eq!(encoder.wait(), Err(CodecError::Cancelled));
        assert!(encoder.wait().unwrap_err().to_string().contains("cancelled"));
        // queued audio still reaches the encoder
        assert_eq!(batches.lock().as_slice(), &[vec![9, 8]]);
        drop(tx);
    }

    #[test]
    fn test_input_close_is_clean() {
        let token = CancelToken::new();
        let (mut encoder, tx, _) = recording(4096, 1);
        encoder.start(&token).unwrap();
        drop(tx);
        assert_eq!(encoder.wait(), Ok(()));
    }

    #[test]
    fn test_sink_failure_is_terminal() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(8);
        let config = EncoderConfig { buffer_threshold: 640, ..EncoderConfig::default() };
        let mut encoder = StreamingEncoder::new(config, rx, FailingSink).unwrap();
        encoder.start(&token).unwrap();
        tx.send(Bytes::from(vec![0u8; 640])).unwrap();

        assert!(matches!(encoder.wait(), Err(CodecError::Sink(_))));
        // the loop is gone, so the input is disconnected
        assert!(tx.send(Bytes::from_static(&[0, 0])).is_err());
    }

    #[test]
    fn test_single_batch_at_threshold() {
        let token = CancelToken::new();
        let (tx, rx) = bounded(8);
        let config = EncoderConfig { buffer_threshold: 4096, ..EncoderConfig::default() };
        let mut encoder = StreamingEncoder::new(config, rx, Vec::new()).unwrap();
        encoder.start(&token).unwrap();

        for chunk in vec![0x10u8; 4096].chunks(1024) {
            tx.send(Bytes::copy_from_slice(chunk)).unwrap();
        }
        drop(tx);

        assert!(encoder.wait().is_ok());
        assert_eq!(encoder.stats().batches, 1);
        let sink = encoder.into_sink().unwrap();
        assert!(!sink.is_empty());

        let decoded = decode_stream(Cursor::new(sink)).unwrap().unwrap();
        assert_eq!(decoded.header.channels, 1);
        assert_eq!(decoded.header.sample_rate, 16000);
        // 2048 samples round up to 7 frames of 320
        assert_eq!(decoded.packets, 7);
    }
}
