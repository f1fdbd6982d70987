//! # Memo Recorder
//!
//! Realtime voice-memo capture: one hardware producer, a fan-out to
//! consumers with different loss tolerance, a lossy waveform ring buffer
//! and a lossless path to a compressed recording.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────┐
//! │   Capture Device     │  native callback thread (never blocks)
//! │  (audio::capture)    │  PacketSink::push -> try_send
//! └──────────┬───────────┘
//!            │ bounded channel of S16LE packets
//!            ▼
//! ┌──────────────────────┐
//! │     Broadcaster      │  dispatch thread, per-subscriber drop policy
//! │     (broadcast)      │  drains admitted packets on cancel
//! └─────┬──────────┬─────┘
//!       │          │
//!   non-blocking   │ send timeout
//!       ▼          ▼
//! ┌───────────┐  ┌──────────────────────────────────────────┐
//! │ Visualizer│  │ Persistence                               │
//! │ feeder    │  │  recorder:  spool PCM -> convert -> clean │
//! │   │       │  │  streaming: batch PCM -> Opus frames      │
//! │   ▼       │  └──────────────────────────────────────────┘
//! │ SampleRing│
//! │ Buffer    │  <- UI reads read_samples() on a tick
//! └───────────┘
//! ```

pub mod audio;
pub mod broadcast;
pub mod cancel;
pub mod codec;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod recorder;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate (16 kHz, the native rate of speech models)
    pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

    /// Default capture channel count (mono)
    pub const DEFAULT_CHANNELS: u16 = 1;

    /// Channel layout handed to the compressed encoder by default
    pub const DEFAULT_OUTPUT_CHANNELS: u16 = 1;

    /// PCM bytes per encode batch: 2048 mono samples, 128ms at 16 kHz
    pub const DEFAULT_BUFFER_THRESHOLD: usize = 4096;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 32_000;

    /// Opus frame duration used by the encoder
    pub const OPUS_FRAME_MS: u32 = 20;

    /// Largest Opus packet we ever expect
    pub const MAX_OPUS_PACKET: usize = 4000;

    /// Capture queue capacity in packets
    pub const DEFAULT_CAPTURE_QUEUE_CAPACITY: usize = 64;

    /// Samples held for the waveform (about 2s at 16 kHz)
    pub const DEFAULT_RING_CAPACITY: usize = 32_000;

    /// Packets queued for the visualizer
    pub const DEFAULT_VISUALIZER_QUEUE: usize = 8;

    /// Packets queued for the persistence path
    pub const DEFAULT_PERSIST_QUEUE: usize = 256;

    /// How long the persistence subscriber may stall per packet
    pub const DEFAULT_PERSIST_TIMEOUT_MS: u64 = 2_000;

    /// Default recording length limit (1 hour)
    pub const DEFAULT_MAX_DURATION_SECS: u64 = 3_600;

    /// Default spool size limit (256 MB)
    pub const DEFAULT_MAX_BYTES: u64 = 256 * 1024 * 1024;

    /// Suffix of the temporary PCM spool next to the output
    pub const SPOOL_SUFFIX: &str = ".tmp.pcm";

    /// Extension of framed Opus recordings
    pub const RECORDING_EXTENSION: &str = "opf";

    /// Chunk size used when converting the spool
    pub const CONVERT_CHUNK_BYTES: usize = 64 * 1024;
}
