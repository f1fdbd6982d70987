//! Synthetic capture backend
//!
//! Stands in for hardware in tests and demos: a producer thread plays the
//! role of the native callback thread and pushes packets into the same
//! `PacketSink` a real stream would.

use bytes::Bytes;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TryRecvError};
use std::f32::consts::PI;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::{CaptureBackend, CaptureStream, DeviceInfo, FormatInfo, Packet, PacketSink};
use crate::config::DeviceConfig;
use crate::error::AudioError;

/// What the synthetic producer emits
#[derive(Debug, Clone)]
pub enum SyntheticSource {
    /// Emit these packets once, in order, then go quiet
    Packets(Vec<Packet>),

    /// Emit a continuous sine tone
    Tone {
        frequency_hz: f32,
        amplitude: i16,
        frames_per_packet: usize,
        /// Sleep one packet duration between packets
        realtime: bool,
    },
}

impl SyntheticSource {
    /// Split a PCM buffer into packets of `packet_bytes` (the last may be shorter)
    pub fn from_pcm(pcm: &[u8], packet_bytes: usize) -> Self {
        let packet_bytes = packet_bytes.max(2);
        SyntheticSource::Packets(
            pcm.chunks(packet_bytes)
                .map(Bytes::copy_from_slice)
                .collect(),
        )
    }

    /// 440 Hz tone at 10ms packets, paced in real time
    pub fn tone(frequency_hz: f32) -> Self {
        SyntheticSource::Tone {
            frequency_hz,
            amplitude: i16::MAX / 4,
            frames_per_packet: 0,
            realtime: true,
        }
    }
}

/// Backend producing synthetic audio
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    source: SyntheticSource,
}

impl SyntheticBackend {
    pub fn new(source: SyntheticSource) -> Self {
        Self { source }
    }
}

impl CaptureBackend for SyntheticBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, AudioError> {
        Ok(vec![DeviceInfo {
            id: "synthetic".to_string(),
            name: "Synthetic input".to_string(),
            is_default: true,
            formats: vec![
                FormatInfo {
                    channels: 1,
                    min_sample_rate: 8000,
                    max_sample_rate: 48000,
                    sample_size_bytes: 2,
                },
                FormatInfo {
                    channels: 2,
                    min_sample_rate: 8000,
                    max_sample_rate: 48000,
                    sample_size_bytes: 2,
                },
            ],
        }])
    }

    fn open(&self, config: &DeviceConfig, sink: PacketSink) -> Result<Box<dyn CaptureStream>, AudioError> {
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(AudioError::DeviceAllocation(format!(
                "unsupported format: {}Hz, {} channel(s)",
                config.sample_rate, config.channels
            )));
        }

        let generator = Generator::new(self.source.clone(), config.sample_rate, config.channels);
        let (command_tx, command_rx) = unbounded();

        let handle = thread::Builder::new()
            .name("synthetic-capture".to_string())
            .spawn(move || produce(generator, sink, command_rx))
            .map_err(|e| AudioError::DeviceAllocation(e.to_string()))?;

        Ok(Box::new(SyntheticStream {
            commands: command_tx,
            thread_handle: Some(handle),
        }))
    }
}

enum Command {
    Play(Sender<()>),
    Pause(Sender<()>),
    Close,
}

struct SyntheticStream {
    commands: Sender<Command>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SyntheticStream {
    /// Returns once the producer has applied the command
    fn request(&self, make: fn(Sender<()>) -> Command) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| AudioError::StreamError("synthetic producer has exited".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::StreamError("synthetic producer has exited".to_string()))
    }
}

impl CaptureStream for SyntheticStream {
    fn play(&mut self) -> Result<(), AudioError> {
        self.request(Command::Play)
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.request(Command::Pause)
    }

    fn close(&mut self) {
        let _ = self.commands.send(Command::Close);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SyntheticStream {
    fn drop(&mut self) {
        self.close();
    }
}

struct Generator {
    source: SyntheticSource,
    sample_rate: u32,
    channels: u16,
    /// Next scripted packet, or next tone frame
    cursor: usize,
}

impl Generator {
    fn new(source: SyntheticSource, sample_rate: u32, channels: u16) -> Self {
        Self {
            source,
            sample_rate,
            channels,
            cursor: 0,
        }
    }

    /// Next packet and how long to wait before the following one
    fn next_packet(&mut self) -> Option<(Packet, Option<Duration>)> {
        match &self.source {
            SyntheticSource::Packets(packets) => {
                let packet = packets.get(self.cursor)?.clone();
                self.cursor += 1;
                Some((packet, None))
            }
            SyntheticSource::Tone {
                frequency_hz,
                amplitude,
                frames_per_packet,
                realtime,
            } => {
                let frames = if *frames_per_packet == 0 {
                    (self.sample_rate / 100) as usize
                } else {
                    *frames_per_packet
                };
                let mut pcm = Vec::with_capacity(frames * self.channels as usize * 2);
                for i in 0..frames {
                    let t = (self.cursor + i) as f32 / self.sample_rate as f32;
                    let value = ((t * frequency_hz * 2.0 * PI).sin() * *amplitude as f32) as i16;
                    for _ in 0..self.channels {
                        pcm.extend_from_slice(&value.to_le_bytes());
                    }
                }
                self.cursor = (self.cursor + frames) % self.sample_rate as usize;
                let pause = realtime
                    .then(|| Duration::from_micros(frames as u64 * 1_000_000 / self.sample_rate as u64));
                Some((Bytes::from(pcm), pause))
            }
        }
    }
}

fn produce(mut generator: Generator, sink: PacketSink, commands: Receiver<Command>) {
    let mut playing = false;

    loop {
        let command = if playing {
            match commands.try_recv() {
                Ok(command) => Some(command),
                Err(TryRecvError::Empty) => None,
                Err(TryRecvError::Disconnected) => return,
            }
        } else {
            match commands.recv() {
                Ok(command) => Some(command),
                Err(_) => return,
            }
        };

        match command {
            Some(Command::Play(reply)) => {
                playing = true;
                let _ = reply.send(());
            }
            // no push happens after the reply
            Some(Command::Pause(reply)) => {
                playing = false;
                let _ = reply.send(());
            }
            Some(Command::Close) => return,
            None => {}
        }

        if !playing {
            continue;
        }

        match generator.next_packet() {
            Some((packet, pause)) => {
                sink.push(&packet);
                if let Some(pause) = pause {
                    thread::sleep(pause);
                }
            }
            // Script exhausted: idle until told otherwise
            None => playing = false,
        }
    }
}
