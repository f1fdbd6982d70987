//! Error types for the capture pipeline

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capture device errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Device enumeration failed: {0}")]
    DeviceEnumeration(String),

    #[error("Device allocation failed: {0}")]
    DeviceAllocation(String),

    #[error("Device not allocated. Call capture() before starting it")]
    NotAllocated,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Broadcaster setup errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    #[error("broadcaster already started")]
    AlreadyStarted,

    #[error("no subscribers available")]
    NoSubscribers,

    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(String),
}

/// Encoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid encoder config: {0}")]
    InvalidConfig(String),

    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("malformed PCM batch: odd byte count {0}")]
    OddByteCount(usize),

    #[error("failed to write encoded audio: {0}")]
    Sink(String),

    #[error("encoder already started")]
    AlreadyStarted,

    #[error("encoder context cancelled")]
    Cancelled,

    #[error("failed to spawn encoder thread: {0}")]
    Spawn(String),
}

/// Recorder errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid recorder config: {0}")]
    InvalidConfig(String),

    #[error("recorder already started")]
    AlreadyStarted,

    #[error("recorder not started")]
    NotStarted,

    #[error("failed to create spool file {path}: {reason}")]
    SpoolCreate { path: String, reason: String },

    #[error("failed to write PCM data: {0}")]
    SpoolWrite(String),

    #[error("failed to close spool file: {0}")]
    SpoolClose(String),

    #[error("failed to convert recording: {0}")]
    Conversion(String),

    #[error("failed to spawn recorder thread: {0}")]
    Spawn(String),
}

impl From<CodecError> for RecordError {
    fn from(e: CodecError) -> Self {
        RecordError::Conversion(e.to_string())
    }
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
