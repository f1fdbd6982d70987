//! Capture backends and device enumeration
//!
//! The capture pipeline only talks to the native audio subsystem through
//! `CaptureBackend`/`CaptureStream`: enumerate inputs, open a stream that
//! pushes packets into a `PacketSink`, then play/pause/close it. `CpalBackend`
//! is the hardware implementation; `audio::synthetic` provides a stand-in.

use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait};
use crossbeam_channel::Sender;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::broadcast::{BroadcastInput, SendError};
use crate::config::DeviceConfig;
use crate::error::AudioError;

/// One chunk of S16LE PCM as delivered by a single capture callback
pub type Packet = Bytes;

/// A supported capture format range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatInfo {
    pub channels: u16,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub sample_size_bytes: usize,
}

impl fmt::Display for FormatInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min_sample_rate == self.max_sample_rate {
            write!(
                f,
                "(SampleSizeBytes: {}, Channels: {}, SampleRate: {})",
                self.sample_size_bytes, self.channels, self.min_sample_rate
            )
        } else {
            write!(
                f,
                "(SampleSizeBytes: {}, Channels: {}, SampleRate: {}-{})",
                self.sample_size_bytes, self.channels, self.min_sample_rate, self.max_sample_rate
            )
        }
    }
}

/// Descriptor of an input device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Stable identifier accepted by `DeviceConfig::device_id`
    pub id: String,
    pub name: String,
    pub is_default: bool,
    pub formats: Vec<FormatInfo>,
}

impl DeviceInfo {
    pub fn format_count(&self) -> usize {
        self.formats.len()
    }

    /// Whether any format range covers the requested rate and channels
    pub fn supports(&self, sample_rate: u32, channels: u16) -> bool {
        self.formats.iter().any(|f| {
            f.channels == channels && f.min_sample_rate <= sample_rate && sample_rate <= f.max_sample_rate
        })
    }
}

/// Native audio subsystem seam
pub trait CaptureBackend: Send {
    /// List available input devices
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, AudioError>;

    /// Allocate a stream for `config` that delivers packets into `sink`.
    /// The stream starts paused.
    fn open(&self, config: &DeviceConfig, sink: PacketSink) -> Result<Box<dyn CaptureStream>, AudioError>;
}

/// An allocated native capture stream
pub trait CaptureStream: Send {
    fn play(&mut self) -> Result<(), AudioError>;

    fn pause(&mut self) -> Result<(), AudioError>;

    /// Release the stream. Called once; the stream is unusable afterwards.
    fn close(&mut self);
}

#[derive(Default)]
struct SinkCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
    overruns: AtomicU64,
}

/// Capture callback statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Packets enqueued
    pub packets: u64,
    /// PCM bytes enqueued
    pub bytes: u64,
    /// Packets dropped because the queue was full
    pub overruns: u64,
}

/// Destination handed to the capture callback.
///
/// Pushing never blocks: a full queue drops the packet and counts an
/// overrun, a closed queue drops it silently.
#[derive(Clone)]
pub struct PacketSink {
    tx: BroadcastInput<Packet>,
    errors: Sender<AudioError>,
    counters: Arc<SinkCounters>,
}

impl PacketSink {
    pub fn new(tx: impl Into<BroadcastInput<Packet>>, errors: Sender<AudioError>) -> Self {
        Self {
            tx: tx.into(),
            errors,
            counters: Arc::new(SinkCounters::default()),
        }
    }

    /// Enqueue a copy of `data`. Returns false if it was dropped.
    pub fn push(&self, data: &[u8]) -> bool {
        self.push_packet(Bytes::copy_from_slice(data))
    }

    /// Enqueue samples encoded as S16LE
    pub fn push_samples(&self, samples: &[i16]) -> bool {
        let mut packet = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            packet.extend_from_slice(&sample.to_le_bytes());
        }
        self.push_packet(Bytes::from(packet))
    }

    fn push_packet(&self, packet: Packet) -> bool {
        let len = packet.len() as u64;
        match self.tx.try_send(packet) {
            Ok(()) => {
                self.counters.packets.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(SendError::Full) => {
                self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(_) => false,
        }
    }

    /// Forward an asynchronous stream error; dropped if nobody is listening
    pub fn report_error(&self, err: AudioError) {
        let _ = self.errors.try_send(err);
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            packets: self.counters.packets.load(Ordering::Relaxed),
            bytes: self.counters.bytes.load(Ordering::Relaxed),
            overruns: self.counters.overruns.load(Ordering::Relaxed),
        }
    }
}

/// Hardware backend over the platform default cpal host
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureBackend for CpalBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, AudioError> {
        list_input_devices()
    }

    fn open(&self, config: &DeviceConfig, sink: PacketSink) -> Result<Box<dyn CaptureStream>, AudioError> {
        let stream = crate::audio::capture::CpalStream::open(config, sink)?;
        Ok(Box::new(stream))
    }
}

/// List all input devices of the default host
pub fn list_input_devices() -> Result<Vec<DeviceInfo>, AudioError> {
    let host = cpal::default_host();

    let default_input_name = host
        .default_input_device()
        .and_then(|d| d.name().ok());

    let input_devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceEnumeration(e.to_string()))?;

    let mut devices = Vec::new();
    for device in input_devices {
        let Ok(name) = device.name() else {
            continue;
        };
        let is_default = default_input_name.as_ref() == Some(&name);
        devices.push(DeviceInfo {
            id: format!("input:{}", name),
            formats: input_formats(&device),
            name,
            is_default,
        });
    }

    Ok(devices)
}

/// Supported input format ranges of a device
fn input_formats(device: &cpal::Device) -> Vec<FormatInfo> {
    let Ok(configs) = device.supported_input_configs() else {
        return Vec::new();
    };

    let mut formats: Vec<FormatInfo> = configs
        .map(|range| FormatInfo {
            channels: range.channels(),
            min_sample_rate: range.min_sample_rate().0,
            max_sample_rate: range.max_sample_rate().0,
            sample_size_bytes: range.sample_format().sample_size(),
        })
        .collect();
    formats.dedup();
    formats
}

/// Resolve an input device by id (`input:<name>`), bare name, or the
/// default input when `id` is `None`.
pub fn find_input_device(id: Option<&str>) -> Result<cpal::Device, AudioError> {
    let host = cpal::default_host();

    let Some(id) = id else {
        return host
            .default_input_device()
            .ok_or_else(|| AudioError::DeviceNotFound("No default input device".to_string()));
    };

    let name = id.strip_prefix("input:").unwrap_or(id);
    let devices = host
        .input_devices()
        .map_err(|e| AudioError::DeviceEnumeration(e.to_string()))?;

    for device in devices {
        if let Ok(device_name) = device.name() {
            if device_name == name {
                return Ok(device);
            }
        }
    }

    Err(AudioError::DeviceNotFound(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_sink_counts_overruns() {
        let (tx, rx) = bounded::<Packet>(2);
        let (err_tx, _err_rx) = bounded(1);
        let sink = PacketSink::new(tx, err_tx);

        assert!(sink.push(&[1, 0]));
        assert!(sink.push_samples(&[2, 3]));
        assert!(!sink.push(&[4, 0]));

        let stats = sink.stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.bytes, 6);
        assert_eq!(stats.overruns, 1);

        assert_eq!(rx.recv().unwrap().as_ref(), &[1, 0]);
        assert_eq!(rx.recv().unwrap().as_ref(), &[2, 0, 3, 0]);
    }

    #[test]
    fn test_sink_disconnected_is_not_overrun() {
        let (tx, rx) = bounded::<Packet>(1);
        let (err_tx, err_rx) = bounded(1);
        let sink = PacketSink::new(tx, err_tx);
        drop(rx);

        assert!(!sink.push(&[0, 0]));
        assert_eq!(sink.stats().overruns, 0);

        sink.report_error(AudioError::StreamError("boom".into()));
        sink.report_error(AudioError::StreamError("dropped".into()));
        assert_eq!(err_rx.try_recv().unwrap(), AudioError::StreamError("boom".into()));
    }

    #[test]
    fn test_format_display() {
        let fixed = FormatInfo {
            channels: 1,
            min_sample_rate: 16000,
            max_sample_rate: 16000,
            sample_size_bytes: 2,
        };
        assert_eq!(fixed.to_string(), "(SampleSizeBytes: 2, Channels: 1, SampleRate: 16000)");

        let range = FormatInfo { max_sample_rate: 48000, ..fixed.clone() };
        assert_eq!(range.to_string(), "(SampleSizeBytes: 2, Channels: 1, SampleRate: 16000-48000)");
    }

    #[test]
    fn test_device_supports() {
        let info = DeviceInfo {
            id: "input:mic".into(),
            name: "mic".into(),
            is_default: true,
            formats: vec![FormatInfo {
                channels: 1,
                min_sample_rate: 8000,
                max_sample_rate: 48000,
                sample_size_bytes: 2,
            }],
        };
        assert!(info.supports(16000, 1));
        assert!(!info.supports(16000, 2));
        assert!(!info.supports(96000, 1));
        assert_eq!(info.format_count(), 1);
    }
}
