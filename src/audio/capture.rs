//! Capture device lifecycle
//!
//! `CaptureDevice` owns one native capture handle and turns its
//! callback-driven delivery into a pull-able channel of packets. The
//! callback thread belongs to the audio subsystem and cannot be cancelled,
//! so the only work done there is a non-blocking enqueue.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use std::thread::{self, JoinHandle};

use crate::audio::device::{
    find_input_device, CaptureBackend, CaptureStats, CaptureStream, CpalBackend, DeviceInfo,
    Packet, PacketSink,
};
use crate::broadcast::BroadcastInput;
use crate::config::{DeviceConfig, PcmFormat};
use crate::error::AudioError;

/// Capacity of the asynchronous stream error queue
const ERROR_QUEUE_CAPACITY: usize = 16;

/// A capture handle over some backend
pub struct CaptureDevice {
    backend: Box<dyn CaptureBackend>,
    config: DeviceConfig,
    stream: Option<Box<dyn CaptureStream>>,
    started: bool,
    sink: Option<PacketSink>,
    /// Statistics of the last released allocation
    released: CaptureStats,
    error_rx: Option<Receiver<AudioError>>,
}

impl CaptureDevice {
    pub fn new(config: DeviceConfig, backend: Box<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            config,
            stream: None,
            started: false,
            sink: None,
            released: CaptureStats::default(),
            error_rx: None,
        }
    }

    /// Capture device over the platform audio host
    pub fn with_cpal(config: DeviceConfig) -> Self {
        Self::new(config, Box::new(CpalBackend::new()))
    }

    /// List available input devices
    pub fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>, AudioError> {
        self.backend.enumerate()
    }

    /// Allocate the native handle and a queue of `queue_capacity` packets
    /// it delivers into once started.
    pub fn capture(&mut self) -> Result<Receiver<Packet>, AudioError> {
        if self.config.queue_capacity == 0 {
            return Err(AudioError::DeviceAllocation(
                "capture queue capacity must be positive".to_string(),
            ));
        }
        let (tx, rx) = bounded(self.config.queue_capacity);
        self.capture_into(tx)?;
        Ok(rx)
    }

    /// Allocate the native handle delivering into a caller-owned queue
    pub fn capture_into(&mut self, tx: impl Into<BroadcastInput<Packet>>) -> Result<(), AudioError> {
        if self.stream.is_some() {
            return Err(AudioError::DeviceAllocation(
                "device already allocated, dealloc() it first".to_string(),
            ));
        }

        let (error_tx, error_rx) = bounded(ERROR_QUEUE_CAPACITY);
        let sink = PacketSink::new(tx, error_tx);
        let stream = self.backend.open(&self.config, sink.clone())?;

        tracing::info!(
            "Capture device allocated: {}Hz, {} channel(s), queue {} packets",
            self.config.sample_rate,
            self.config.channels,
            self.config.queue_capacity
        );

        self.stream = Some(stream);
        self.sink = Some(sink);
        self.error_rx = Some(error_rx);
        self.started = false;
        Ok(())
    }

    /// Begin delivery. No-op if already started.
    pub fn start(&mut self) -> Result<(), AudioError> {
        let stream = self.stream.as_mut().ok_or(AudioError::NotAllocated)?;
        if self.started {
            return Ok(());
        }
        stream.play()?;
        self.started = true;
        tracing::debug!("Capture started");
        Ok(())
    }

    /// Halt delivery. No-op if never allocated, never started or already stopped.
    pub fn stop(&mut self) -> Result<(), AudioError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        if !self.started {
            return Ok(());
        }
        stream.pause()?;
        self.started = false;
        tracing::debug!("Capture stopped");
        Ok(())
    }

    /// Start if stopped, stop if started
    pub fn toggle(&mut self) -> Result<(), AudioError> {
        if self.stream.is_none() {
            return Err(AudioError::NotAllocated);
        }
        if self.started {
            self.stop()
        } else {
            self.start()
        }
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_some() && self.started
    }

    pub fn is_allocated(&self) -> bool {
        self.stream.is_some()
    }

    /// Release the native handle and the packet queue sender. Idempotent.
    ///
    /// Once released, consumers of the queue see it close after the last
    /// delivered packet.
    pub fn dealloc(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if self.started {
                if let Err(e) = stream.pause() {
                    tracing::warn!("Failed to stop capture before release: {}", e);
                }
            }
            stream.close();
            tracing::info!("Capture device released");
        }
        if let Some(sink) = self.sink.take() {
            self.released = sink.stats();
        }
        self.started = false;
    }

    /// Callback statistics of the current (or last) allocation
    pub fn stats(&self) -> CaptureStats {
        self.sink.as_ref().map(|s| s.stats()).unwrap_or(self.released)
    }

    /// Packets dropped because the capture queue was full
    pub fn overruns(&self) -> u64 {
        self.stats().overruns
    }

    /// Next asynchronous stream error, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok())
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.dealloc();
    }
}

enum StreamCommand {
    Play(Sender<Result<(), AudioError>>),
    Pause(Sender<Result<(), AudioError>>),
    Close,
}

/// cpal input stream kept alive on a dedicated thread.
///
/// `cpal::Stream` is not `Send` on every platform, so the thread that
/// builds it also owns it and executes play/pause requests for us.
pub struct CpalStream {
    commands: Sender<StreamCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CpalStream {
    pub fn open(config: &DeviceConfig, sink: PacketSink) -> Result<Self, AudioError> {
        match config.format {
            PcmFormat::S16Le => {}
        }

        let device_id = config.device_id.clone();
        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: match config.buffer_frames {
                Some(frames) => cpal::BufferSize::Fixed(frames),
                None => cpal::BufferSize::Default,
            },
        };

        let (command_tx, command_rx) = unbounded::<StreamCommand>();
        let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

        let handle = thread::Builder::new()
            .name("capture-stream".to_string())
            .spawn(move || {
                let device = match find_input_device(device_id.as_deref()) {
                    Ok(device) => device,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::DeviceAllocation(e.to_string())));
                        return;
                    }
                };

                let data_sink = sink.clone();
                let stream = device.build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        data_sink.push_samples(data);
                    },
                    move |err| {
                        sink.report_error(AudioError::StreamError(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(AudioError::DeviceAllocation(e.to_string())));
                        return;
                    }
                };

                // Some hosts start streams as soon as they are built
                if let Err(e) = stream.pause() {
                    tracing::debug!("Initial pause not supported: {}", e);
                }
                let _ = ready_tx.send(Ok(()));

                for command in command_rx.iter() {
                    match command {
                        StreamCommand::Play(reply) => {
                            let _ = reply.send(
                                stream.play().map_err(|e| AudioError::CpalError(e.to_string())),
                            );
                        }
                        StreamCommand::Pause(reply) => {
                            let _ = reply.send(
                                stream.pause().map_err(|e| AudioError::CpalError(e.to_string())),
                            );
                        }
                        StreamCommand::Close => break,
                    }
                }
                // Stream is dropped here, releasing the device
            })
            .map_err(|e| AudioError::DeviceAllocation(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                commands: command_tx,
                thread_handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::DeviceAllocation(
                    "capture stream thread exited during setup".to_string(),
                ))
            }
        }
    }

    fn request(
        &self,
        make: fn(Sender<Result<(), AudioError>>) -> StreamCommand,
    ) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| AudioError::StreamError("capture stream thread has exited".to_string()))?;
        reply_rx
            .recv()
            .map_err(|_| AudioError::StreamError("capture stream thread has exited".to_string()))?
    }
}

impl CaptureStream for CpalStream {
    fn play(&mut self) -> Result<(), AudioError> {
        self.request(StreamCommand::Play)
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.request(StreamCommand::Pause)
    }

    fn close(&mut self) {
        let _ = self.commands.send(StreamCommand::Close);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        self.close();
    }
}
