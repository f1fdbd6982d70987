//! End-to-end capture pipeline
//!
//! Wires one capture device through a broadcaster to two subscribers:
//!
//! - the visualizer feeder (non-blocking, lossy) writing the ring buffer
//! - the persistence path (send timeout) feeding a `Recorder` or a
//!   `StreamingEncoder`
//!
//! `finish` shuts down in causal order: capture stop, cancellation,
//! broadcaster drain, persistence flush, visualizer exit, device release.
//! Persistence runs under its own token so that it keeps consuming until
//! the broadcaster has handed over every admitted packet; it then sees the
//! disconnection and finalizes normally.

use crossbeam_channel::bounded;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

use crate::audio::{
    bytes_to_samples, create_shared_buffer, CaptureBackend, CaptureDevice, CaptureStats, Packet,
    SharedRingBuffer,
};
use crate::broadcast::{Broadcaster, SubscriberStats};
use crate::cancel::CancelToken;
use crate::codec::{StreamingEncoder, StreamingStats};
use crate::config::{AppConfig, RecorderConfig};
use crate::error::{AudioError, Error};
use crate::recorder::{Recorder, RecordingSummary};

/// Where persisted audio goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistTarget {
    /// Spool PCM to disk, convert on completion
    Spool(PathBuf),
    /// Encode batches directly into the file while recording
    Stream(PathBuf),
}

/// Result of the persistence path
#[derive(Debug, Clone, PartialEq)]
pub enum PersistOutcome {
    Recorded(RecordingSummary),
    Streamed { path: PathBuf, stats: StreamingStats },
}

/// Everything known once the pipeline has shut down
#[derive(Debug)]
pub struct PipelineReport {
    pub persistence: Result<PersistOutcome, Error>,
    /// Visualizer subscriber first, persistence second
    pub subscribers: Vec<SubscriberStats>,
    pub capture: CaptureStats,
}

/// Index of the persistence subscriber in `Pipeline::stats`
pub const PERSIST_SUBSCRIBER: usize = 1;

enum Persistence {
    Recorder(Recorder),
    Stream {
        path: PathBuf,
        encoder: StreamingEncoder<BufWriter<File>>,
    },
}

impl Persistence {
    fn start(
        config: &AppConfig,
        target: PersistTarget,
        input: crossbeam_channel::Receiver<Packet>,
        token: &CancelToken,
        limit_trigger: &CancelToken,
    ) -> Result<Self, Error> {
        match target {
            PersistTarget::Spool(path) => {
                let recorder_config = RecorderConfig::from_app(config, path);
                let mut recorder =
                    Recorder::new(recorder_config, input)?.with_limit_trigger(limit_trigger.clone());
                recorder.start(token)?;
                Ok(Persistence::Recorder(recorder))
            }
            PersistTarget::Stream(path) => {
                let file = File::create(&path)?;
                let mut encoder = StreamingEncoder::new(config.encoder, input, BufWriter::new(file))?;
                encoder.start(token)?;
                Ok(Persistence::Stream { path, encoder })
            }
        }
    }

    fn bytes_persisted(&self) -> u64 {
        match self {
            Persistence::Recorder(recorder) => recorder.bytes_written(),
            Persistence::Stream { encoder, .. } => encoder.stats().pcm_bytes,
        }
    }

    fn wait(&mut self) -> Result<PersistOutcome, Error> {
        match self {
            Persistence::Recorder(recorder) => Ok(PersistOutcome::Recorded(recorder.wait()?)),
            Persistence::Stream { path, encoder } => {
                encoder.wait()?;
                Ok(PersistOutcome::Streamed {
                    path: path.clone(),
                    stats: encoder.stats(),
                })
            }
        }
    }
}

/// A running capture session
pub struct Pipeline {
    device: CaptureDevice,
    broadcaster: Broadcaster<Packet>,
    persistence: Persistence,
    ring: SharedRingBuffer,
    visualizer: Option<JoinHandle<()>>,
    token: CancelToken,
    persist_token: CancelToken,
}

impl Pipeline {
    /// Allocate and start everything; capture is running on return
    pub fn start(
        config: AppConfig,
        backend: Box<dyn CaptureBackend>,
        target: PersistTarget,
    ) -> Result<Self, Error> {
        config.validate()?;

        let token = CancelToken::new();
        let persist_token = CancelToken::new();
        let ring = create_shared_buffer(config.visualizer.ring_capacity);

        let (visual_tx, visual_rx) = bounded::<Packet>(config.visualizer.queue_capacity);
        let (persist_tx, persist_rx) = bounded::<Packet>(config.broadcast.persist_queue_capacity);

        let mut broadcaster = Broadcaster::new().with_input_capacity(config.device.queue_capacity);
        broadcaster.subscribe(visual_tx);
        broadcaster.subscribe_with_timeout(persist_tx, config.broadcast.persist_timeout());

        let mut persistence = Persistence::start(&config, target, persist_rx, &persist_token, &token)?;

        let feeder_ring = ring.clone();
        let visualizer = thread::Builder::new()
            .name("visualizer".to_string())
            .spawn(move || {
                for packet in visual_rx.iter() {
                    feeder_ring.write(&bytes_to_samples(&packet));
                }
                tracing::debug!("Visualizer feeder stopped");
            })
            .map_err(|e| Error::Config(format!("failed to spawn visualizer: {}", e)))?;

        let input = broadcaster.run(&token)?;

        let mut device = CaptureDevice::new(config.device.clone(), backend);
        let started = device.capture_into(input).and_then(|()| device.start());
        if let Err(e) = started {
            device.dealloc();
            token.cancel();
            broadcaster.wait();
            if let Err(persist_err) = persistence.wait() {
                tracing::warn!("Persistence after failed capture start: {}", persist_err);
            }
            let _ = visualizer.join();
            return Err(e.into());
        }

        tracing::info!(
            "Pipeline running: {}Hz, {} channel(s)",
            config.device.sample_rate,
            config.device.channels
        );

        Ok(Self {
            device,
            broadcaster,
            persistence,
            ring,
            visualizer: Some(visualizer),
            token,
            persist_token,
        })
    }

    /// Pause or resume capture
    pub fn toggle(&mut self) -> Result<(), AudioError> {
        self.device.toggle()
    }

    pub fn is_capturing(&self) -> bool {
        self.device.is_started()
    }

    /// Waveform samples for the UI
    pub fn ring(&self) -> SharedRingBuffer {
        self.ring.clone()
    }

    /// Cancelled on shutdown, or when a recording limit is reached
    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }

    /// PCM bytes accepted by the persistence path
    pub fn bytes_persisted(&self) -> u64 {
        self.persistence.bytes_persisted()
    }

    pub fn stats(&self) -> Vec<SubscriberStats> {
        self.broadcaster.stats()
    }

    pub fn capture_stats(&self) -> CaptureStats {
        self.device.stats()
    }

    /// Next asynchronous capture error, if any
    pub fn check_errors(&self) -> Option<AudioError> {
        self.device.check_errors()
    }

    /// Stop capture and persist everything already captured
    pub fn finish(self) -> PipelineReport {
        self.shutdown(false)
    }

    /// Stop capture and persistence right away. Packets already queued for
    /// persistence are still written.
    pub fn abort(self) -> PipelineReport {
        self.shutdown(true)
    }

    fn shutdown(mut self, abort: bool) -> PipelineReport {
        if let Err(e) = self.device.stop() {
            tracing::warn!("Failed to stop capture: {}", e);
        }

        self.token.cancel();
        if abort {
            self.persist_token.cancel();
        }
        self.broadcaster.wait();

        let persistence = self.persistence.wait();
        if let Some(handle) = self.visualizer.take() {
            if handle.join().is_err() {
                tracing::error!("Visualizer feeder panicked");
            }
        }

        let capture = self.device.stats();
        self.device.dealloc();

        let subscribers = self.broadcaster.stats();
        if let Some(persist) = subscribers.get(PERSIST_SUBSCRIBER) {
            if persist.dropped > 0 {
                tracing::warn!("Persistence path dropped {} packet(s)", persist.dropped);
            }
        }
        if capture.overruns > 0 {
            tracing::warn!("Capture queue overran {} time(s)", capture.overruns);
        }

        PipelineReport {
            persistence,
            subscribers,
            capture,
        }
    }
}
