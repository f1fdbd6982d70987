//! Lossless recorder
//!
//! Spools every PCM packet it receives to a temporary file, then converts
//! the spool into the final framed Opus recording and removes it.
//!
//! ```text
//! Idle -> Spooling -> Converting -> CleaningUp -> Done
//!   (any state) -> Failed
//! ```
//!
//! Spooling ends when the input closes, the token is cancelled (queued
//! packets are still written) or a configured size/duration limit is hit.
//! A failed conversion leaves the spool in place so the audio can be
//! recovered; a failed spool removal is only logged.

use crossbeam_channel::{after, never, select, Receiver};
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::Packet;
use crate::cancel::{CancelToken, FirstError};
use crate::codec::{adapt_channels, FrameEncoder, OpusFrameEncoder};
use crate::error::CodecError;
use crate::config::RecorderConfig;
use crate::constants::CONVERT_CHUNK_BYTES;
use crate::error::RecordError;

/// Recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Spooling,
    Converting,
    CleaningUp,
    Done,
    Failed,
}

/// Why spooling ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Every producer went away
    InputClosed,
    /// The token was cancelled
    Cancelled,
    /// `max_bytes` reached
    MaxBytes,
    /// `max_duration` elapsed
    MaxDuration,
}

/// Outcome of a completed recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSummary {
    pub output_path: PathBuf,
    pub bytes_spooled: u64,
    pub stop_reason: StopReason,
    /// Opus frames in the output
    pub frames: u64,
    /// Wall time from start to done
    pub elapsed: Duration,
}

struct Shared {
    bytes_written: AtomicU64,
    state: Mutex<RecorderState>,
    error: FirstError<RecordError>,
}

impl Shared {
    fn set_state(&self, state: RecorderState) {
        let mut current = self.state.lock();
        tracing::debug!("Recorder state {:?} -> {:?}", *current, state);
        *current = state;
    }
}

/// Records one packet stream to a compressed file
pub struct Recorder {
    config: RecorderConfig,
    input: Option<Receiver<Packet>>,
    shared: Arc<Shared>,
    limit_trigger: Option<CancelToken>,
    thread_handle: Option<JoinHandle<Option<RecordingSummary>>>,
    outcome: Option<Result<RecordingSummary, RecordError>>,
}

impl Recorder {
    /// Fails if `config` is invalid or its format cannot be encoded
    pub fn new(config: RecorderConfig, input: Receiver<Packet>) -> Result<Self, RecordError> {
        config.validate()?;
        output_encoder(&config).map_err(|e| RecordError::InvalidConfig(e.to_string()))?;
        Ok(Self {
            config,
            input: Some(input),
            shared: Arc::new(Shared {
                bytes_written: AtomicU64::new(0),
                state: Mutex::new(RecorderState::Idle),
                error: FirstError::new("recorder"),
            }),
            limit_trigger: None,
            thread_handle: None,
            outcome: None,
        })
    }

    /// Cancel `token` when a size or duration limit stops the recording
    pub fn with_limit_trigger(mut self, token: CancelToken) -> Self {
        self.limit_trigger = Some(token);
        self
    }

    pub fn config(&self) -> &RecorderConfig {
        &self.config
    }

    pub fn output_path(&self) -> &Path {
        &self.config.output_path
    }

    /// Temporary PCM file used while spooling
    pub fn spool_path(&self) -> PathBuf {
        self.config.resolved_spool_path()
    }

    /// Create the spool file and start spooling.
    /// Fails if already started or if the spool cannot be created.
    pub fn start(&mut self, token: &CancelToken) -> Result<(), RecordError> {
        if self.input.is_none() {
            return Err(RecordError::AlreadyStarted);
        }
        let spool_path = self.config.resolved_spool_path();
        let spool_file = File::create(&spool_path).map_err(|e| RecordError::SpoolCreate {
            path: spool_path.display().to_string(),
            reason: e.to_string(),
        })?;
        let input = self.input.take().ok_or(RecordError::AlreadyStarted)?;

        let config = self.config.clone();
        let shared = self.shared.clone();
        let token = token.clone();
        let limit_trigger = self.limit_trigger.clone();

        let handle = thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || {
                let started = Instant::now();
                let spool = Spool {
                    path: spool_path,
                    file: spool_file,
                };
                match record(&config, spool, input, &shared, &token, limit_trigger.as_ref()) {
                    Ok((stop_reason, frames)) => {
                        shared.set_state(RecorderState::Done);
                        let summary = RecordingSummary {
                            output_path: config.output_path.clone(),
                            bytes_spooled: shared.bytes_written.load(Ordering::Acquire),
                            stop_reason,
                            frames,
                            elapsed: started.elapsed(),
                        };
                        tracing::info!(
                            "Recording saved to {} ({} bytes spooled, {:?})",
                            summary.output_path.display(),
                            summary.bytes_spooled,
                            summary.stop_reason
                        );
                        Some(summary)
                    }
                    Err(e) => {
                        shared.set_state(RecorderState::Failed);
                        shared.error.set(e);
                        None
                    }
                }
            })
            .map_err(|e| RecordError::Spawn(e.to_string()))?;

        self.thread_handle = Some(handle);
        tracing::info!(
            "Recorder started: {}Hz, {} channel(s) -> {}",
            self.config.sample_rate,
            self.config.channels,
            self.config.output_path.display()
        );
        Ok(())
    }

    /// PCM bytes spooled so far. Stops growing once spooling ends.
    pub fn bytes_written(&self) -> u64 {
        self.shared.bytes_written.load(Ordering::Acquire)
    }

    pub fn state(&self) -> RecorderState {
        *self.shared.state.lock()
    }

    /// Block until spool, conversion and cleanup have finished
    pub fn wait(&mut self) -> Result<RecordingSummary, RecordError> {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let handle = self.thread_handle.take().ok_or(RecordError::NotStarted)?;

        let summary = match handle.join() {
            Ok(summary) => summary,
            Err(_) => {
                self.shared.set_state(RecorderState::Failed);
                self.shared
                    .error
                    .set(RecordError::Conversion("recorder thread panicked".to_string()));
                None
            }
        };

        let outcome = match (self.shared.error.get(), summary) {
            (Some(e), _) => Err(e),
            (None, Some(summary)) => Ok(summary),
            (None, None) => Err(RecordError::Conversion("recorder produced no result".to_string())),
        };
        self.outcome = Some(outcome.clone());
        outcome
    }
}

/// Spool file opened by `start`
struct Spool {
    path: PathBuf,
    file: File,
}

fn record(
    config: &RecorderConfig,
    spool_file: Spool,
    input: Receiver<Packet>,
    shared: &Shared,
    token: &CancelToken,
    limit_trigger: Option<&CancelToken>,
) -> Result<(StopReason, u64), RecordError> {
    let spool_path = spool_file.path.clone();

    shared.set_state(RecorderState::Spooling);
    let stop_reason = spool(config, spool_file.file, input, shared, token)?;

    if matches!(stop_reason, StopReason::MaxBytes | StopReason::MaxDuration) {
        tracing::info!("Recording limit reached: {:?}", stop_reason);
        if let Some(trigger) = limit_trigger {
            trigger.cancel();
        }
    }

    shared.set_state(RecorderState::Converting);
    let frames = convert(config, &spool_path).map_err(|e| {
        tracing::warn!("Conversion failed, PCM kept at {}", spool_path.display());
        e
    })?;

    shared.set_state(RecorderState::CleaningUp);
    if let Err(e) = fs::remove_file(&spool_path) {
        tracing::warn!("Failed to remove spool {}: {}", spool_path.display(), e);
    }

    Ok((stop_reason, frames))
}

/// Write packets to the spool until input closes, cancellation or a limit
fn spool(
    config: &RecorderConfig,
    file: File,
    input: Receiver<Packet>,
    shared: &Shared,
    token: &CancelToken,
) -> Result<StopReason, RecordError> {
    let mut writer = BufWriter::new(file);

    let deadline = match config.max_duration {
        Some(limit) => after(limit),
        None => never(),
    };

    let write = |writer: &mut BufWriter<File>, packet: &[u8]| -> Result<bool, RecordError> {
        writer
            .write_all(packet)
            .map_err(|e| RecordError::SpoolWrite(e.to_string()))?;
        let total = shared
            .bytes_written
            .fetch_add(packet.len() as u64, Ordering::AcqRel)
            + packet.len() as u64;
        Ok(config.max_bytes.map_or(false, |max| total >= max))
    };

    let reason = loop {
        select! {
            recv(input) -> msg => match msg {
                Ok(packet) => {
                    if write(&mut writer, &packet)? {
                        break StopReason::MaxBytes;
                    }
                }
                Err(_) => break StopReason::InputClosed,
            },
            recv(token.signal()) -> _ => {
                let queued = input.len();
                let mut reason = StopReason::Cancelled;
                for packet in input.try_iter().take(queued) {
                    if write(&mut writer, &packet)? {
                        reason = StopReason::MaxBytes;
                        break;
                    }
                }
                tracing::debug!("Recorder cancelled, drained up to {} queued packet(s)", queued);
                break reason;
            }
            recv(deadline) -> _ => break StopReason::MaxDuration,
        }
    };
    drop(input);

    let file = writer
        .into_inner()
        .map_err(|e| RecordError::SpoolClose(e.error().to_string()))?;
    file.sync_all()
        .map_err(|e| RecordError::SpoolClose(e.to_string()))?;

    Ok(reason)
}

/// Frame encoder for the recording's output layout
fn output_encoder(config: &RecorderConfig) -> Result<OpusFrameEncoder, CodecError> {
    let channels = if config.channels == 1 {
        config.output_channels
    } else {
        config.channels
    };
    OpusFrameEncoder::new(config.sample_rate, channels, config.bitrate)
}

/// Convert the spool into the final recording in one streaming pass
fn convert(config: &RecorderConfig, spool_path: &Path) -> Result<u64, RecordError> {
    let mut encoder = output_encoder(config)?;
    let encoder_channels = encoder.channels();

    let mut spool = File::open(spool_path)
        .map_err(|e| RecordError::Conversion(format!("open spool: {}", e)))?;
    let output = File::create(&config.output_path).map_err(|e| {
        RecordError::Conversion(format!("create {}: {}", config.output_path.display(), e))
    })?;
    let mut sink = BufWriter::new(output);

    let mut chunk = vec![0u8; CONVERT_CHUNK_BYTES];
    let mut pcm: Vec<u8> = Vec::with_capacity(CONVERT_CHUNK_BYTES + 1);

    loop {
        let n = match spool.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(RecordError::Conversion(format!("read spool: {}", e))),
        };

        pcm.extend_from_slice(&chunk[..n]);
        let even = pcm.len() & !1;
        let samples: Vec<i16> = pcm[..even]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        // an odd trailing byte waits for the next chunk
        pcm.drain(..even);

        let samples = adapt_channels(samples, config.channels, encoder_channels);
        encoder.write(&mut sink, &samples)?;
    }

    if !pcm.is_empty() {
        tracing::warn!("Discarding {} trailing byte(s) of incomplete sample", pcm.len());
    }

    encoder.finish(&mut sink)?;
    Ok(encoder.stats().frames_encoded)
}
