//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{CodecError, RecordError};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Capture device configuration
    pub device: DeviceConfig,

    /// Streaming encoder configuration
    pub encoder: EncoderConfig,

    /// Recording limits and output location
    pub recorder: RecorderSettings,

    /// Visualization path configuration
    pub visualizer: VisualizerConfig,

    /// Fan-out configuration
    pub broadcast: BroadcastConfig,
}

/// Sample encoding delivered by the capture callback
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PcmFormat {
    /// Signed 16-bit little-endian
    #[default]
    S16Le,
}

impl PcmFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            PcmFormat::S16Le => 2,
        }
    }
}

/// Capture device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Input device id (see `DeviceInfo::id`); `None` selects the default input
    pub device_id: Option<String>,

    /// Requested sample rate
    pub sample_rate: u32,

    /// Requested capture channels
    pub channels: u16,

    /// Sample encoding
    pub format: PcmFormat,

    /// Packets the capture queue holds before the callback starts dropping
    pub queue_capacity: usize,

    /// Hardware buffer size in frames (`None` lets the backend decide)
    pub buffer_frames: Option<u32>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            format: PcmFormat::S16Le,
            queue_capacity: DEFAULT_CAPTURE_QUEUE_CAPACITY,
            buffer_frames: None,
        }
    }
}

impl DeviceConfig {
    /// How long a consumer may stall before the capture queue overflows,
    /// given the duration of one callback packet.
    pub fn stall_tolerance(&self, packet_frames: u32) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let micros = self.queue_capacity as u64 * packet_frames as u64 * 1_000_000
            / self.sample_rate as u64;
        Duration::from_micros(micros)
    }

    /// Bytes of PCM produced per second of audio
    pub fn byte_rate(&self) -> u64 {
        self.sample_rate as u64 * self.channels as u64 * self.format.bytes_per_sample() as u64
    }
}

/// Streaming encoder configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EncoderConfig {
    /// Sample rate of the incoming PCM in Hz
    pub sample_rate: u32,

    /// Channels of the incoming PCM; only mono is supported
    pub channels: u16,

    /// PCM bytes to accumulate before a batch is encoded
    pub buffer_threshold: usize,

    /// Channel layout handed to the compressed encoder (1 or 2).
    /// With 2 every mono sample is duplicated into both channels.
    pub output_channels: u16,

    /// Target bitrate in bits per second
    pub bitrate: u32,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            output_channels: DEFAULT_OUTPUT_CHANNELS,
            bitrate: DEFAULT_BITRATE,
        }
    }
}

impl EncoderConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.sample_rate == 0 {
            return Err(CodecError::InvalidConfig("sample rate must be positive".into()));
        }
        if self.channels != 1 {
            return Err(CodecError::InvalidConfig("only mono (1 channel) is supported".into()));
        }
        if self.buffer_threshold == 0 {
            return Err(CodecError::InvalidConfig("buffer threshold must be positive".into()));
        }
        if !(1..=2).contains(&self.output_channels) {
            return Err(CodecError::InvalidConfig("output channels must be 1 or 2".into()));
        }
        Ok(())
    }

    /// Replace zero fields with defaults
    pub fn with_defaults(mut self) -> Self {
        if self.sample_rate == 0 {
            self.sample_rate = DEFAULT_SAMPLE_RATE;
        }
        if self.channels == 0 {
            self.channels = DEFAULT_CHANNELS;
        }
        if self.buffer_threshold == 0 {
            self.buffer_threshold = DEFAULT_BUFFER_THRESHOLD;
        }
        if self.output_channels == 0 {
            self.output_channels = DEFAULT_OUTPUT_CHANNELS;
        }
        if self.bitrate == 0 {
            self.bitrate = DEFAULT_BITRATE;
        }
        self
    }

    /// Duration of audio covered by one full batch
    pub fn batch_duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let samples = (self.buffer_threshold / 2) as u64 / self.channels as u64;
        Duration::from_micros(samples * 1_000_000 / self.sample_rate as u64)
    }
}

/// Recording limits and output location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderSettings {
    /// Directory for recordings when no output path is given
    pub output_dir: Option<PathBuf>,

    /// Stop after this many seconds (0 = unlimited)
    pub max_duration_secs: u64,

    /// Stop after this many PCM bytes (0 = unlimited)
    pub max_bytes: u64,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            output_dir: None,
            max_duration_secs: DEFAULT_MAX_DURATION_SECS,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

impl RecorderSettings {
    pub fn max_duration(&self) -> Option<Duration> {
        (self.max_duration_secs > 0).then(|| Duration::from_secs(self.max_duration_secs))
    }

    pub fn max_bytes(&self) -> Option<u64> {
        (self.max_bytes > 0).then_some(self.max_bytes)
    }
}

/// Configuration of a single recording
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Channels in the spooled PCM (1 or 2)
    pub channels: u16,

    /// Final compressed output path
    pub output_path: PathBuf,

    /// Temporary PCM spool; defaults to `<output>.tmp.pcm`
    pub spool_path: Option<PathBuf>,

    /// Encoder layout for mono sources (1 or 2)
    pub output_channels: u16,

    /// Target bitrate in bits per second
    pub bitrate: u32,

    /// Stop once this many bytes were spooled
    pub max_bytes: Option<u64>,

    /// Stop once recording ran this long
    pub max_duration: Option<Duration>,
}

impl RecorderConfig {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            output_path: output_path.into(),
            spool_path: None,
            output_channels: DEFAULT_OUTPUT_CHANNELS,
            bitrate: DEFAULT_BITRATE,
            max_bytes: None,
            max_duration: None,
        }
    }

    /// Build from the application config
    pub fn from_app(config: &AppConfig, output_path: impl Into<PathBuf>) -> Self {
        Self {
            sample_rate: config.device.sample_rate,
            channels: config.device.channels,
            output_path: output_path.into(),
            spool_path: None,
            output_channels: config.encoder.output_channels,
            bitrate: config.encoder.bitrate,
            max_bytes: config.recorder.max_bytes(),
            max_duration: config.recorder.max_duration(),
        }
    }

    pub fn validate(&self) -> Result<(), RecordError> {
        if self.sample_rate == 0 {
            return Err(RecordError::InvalidConfig("sample rate must be positive".into()));
        }
        if self.channels == 0 {
            return Err(RecordError::InvalidConfig("channels must be positive".into()));
        }
        if self.channels > 2 {
            return Err(RecordError::InvalidConfig(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        if !(1..=2).contains(&self.output_channels) {
            return Err(RecordError::InvalidConfig("output channels must be 1 or 2".into()));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(RecordError::InvalidConfig("output path cannot be empty".into()));
        }
        Ok(())
    }

    /// Spool location for this recording
    pub fn resolved_spool_path(&self) -> PathBuf {
        match &self.spool_path {
            Some(path) => path.clone(),
            None => {
                let mut name = self.output_path.clone().into_os_string();
                name.push(SPOOL_SUFFIX);
                PathBuf::from(name)
            }
        }
    }
}

/// Visualization path configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VisualizerConfig {
    /// Samples kept for the waveform
    pub ring_capacity: usize,

    /// Packets queued for the visualizer before drops
    pub queue_capacity: usize,
}

impl Default for VisualizerConfig {
    fn default() -> Self {
        Self {
            ring_capacity: DEFAULT_RING_CAPACITY,
            queue_capacity: DEFAULT_VISUALIZER_QUEUE,
        }
    }
}

/// Fan-out configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcastConfig {
    /// How long the persistence subscriber may take to accept a packet
    pub persist_timeout_ms: u64,

    /// Packets queued for the persistence path
    pub persist_queue_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            persist_timeout_ms: DEFAULT_PERSIST_TIMEOUT_MS,
            persist_queue_capacity: DEFAULT_PERSIST_QUEUE,
        }
    }
}

impl BroadcastConfig {
    pub fn persist_timeout(&self) -> Duration {
        Duration::from_millis(self.persist_timeout_ms)
    }
}

impl AppConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the default location, falling back to defaults
    pub fn load_or_default() -> crate::Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Check the sections against each other
    pub fn validate(&self) -> crate::Result<()> {
        if self.device.queue_capacity == 0 {
            return Err(crate::Error::Config("device queue capacity must be positive".into()));
        }
        if self.visualizer.ring_capacity == 0 {
            return Err(crate::Error::Config("ring capacity must be positive".into()));
        }
        if self.visualizer.queue_capacity == 0 || self.broadcast.persist_queue_capacity == 0 {
            return Err(crate::Error::Config("subscriber queues must be positive".into()));
        }
        if self.encoder.sample_rate != self.device.sample_rate
            || self.encoder.channels != self.device.channels
        {
            return Err(crate::Error::Config(format!(
                "encoder format {}Hz/{}ch does not match device format {}Hz/{}ch",
                self.encoder.sample_rate,
                self.encoder.channels,
                self.device.sample_rate,
                self.device.channels
            )));
        }
        self.encoder
            .validate()
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Get default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "memos", "memo-recorder")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Directory new recordings go to
    pub fn recordings_dir(&self) -> PathBuf {
        if let Some(dir) = &self.recorder.output_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("com", "memos", "memo-recorder")
            .map(|dirs| dirs.data_dir().join("recordings"))
            .unwrap_or_else(|| PathBuf::from("recordings"))
    }

    /// Timestamped output path inside `recordings_dir`
    pub fn default_output_path(&self) -> PathBuf {
        let timestamp = chrono::Local::now().format("%Y-%m-%d-%H%M%S");
        self.recordings_dir()
            .join(format!("{}.{}", timestamp, RECORDING_EXTENSION))
    }
}
