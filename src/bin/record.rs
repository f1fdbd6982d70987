//! Voice memo recorder
//!
//! Usage:
//!   record [OUTPUT] [--stream] [--synthetic] [--config PATH]
//!   record devices
//!   record inspect FILE

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use memo_recorder::{
    audio::{
        level::{column_levels, max_abs_amplitude, LEVELS_PER_ROW},
        CaptureBackend, CpalBackend, SyntheticBackend, SyntheticSource,
    },
    codec::decode_stream,
    config::AppConfig,
    pipeline::{PersistOutcome, PersistTarget, Pipeline, PERSIST_SUBSCRIBER},
};

/// Bars used for the progress meter, lowest first
const METER: [char; 8] = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];

/// Meter columns printed with each progress line
const METER_WIDTH: usize = 24;

struct RecordArgs {
    output: Option<PathBuf>,
    stream: bool,
    synthetic: bool,
    config: Option<PathBuf>,
}

enum Command {
    Record(RecordArgs),
    Devices,
    Inspect(PathBuf),
}

fn parse_args() -> Result<Command> {
    let mut args = std::env::args().skip(1).peekable();

    match args.peek().map(String::as_str) {
        Some("devices") => return Ok(Command::Devices),
        Some("inspect") => {
            args.next();
            let file = args.next().context("inspect needs a file")?;
            return Ok(Command::Inspect(PathBuf::from(file)));
        }
        _ => {}
    }

    let mut record = RecordArgs {
        output: None,
        stream: false,
        synthetic: false,
        config: None,
    };
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stream" => record.stream = true,
            "--synthetic" => record.synthetic = true,
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                record.config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with("--") => bail!("unknown option {}", flag),
            path => record.output = Some(PathBuf::from(path)),
        }
    }
    Ok(Command::Record(record))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match parse_args()? {
        Command::Devices => list_devices(),
        Command::Inspect(path) => inspect(&path),
        Command::Record(args) => record(args).await,
    }
}

fn list_devices() -> Result<()> {
    let devices = CpalBackend::new().enumerate()?;

    println!("\n=== Available Input Devices ===");
    for device in &devices {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Formats: {}", device.format_count());
        for format in &device.formats {
            println!("      {}", format);
        }
    }
    println!();
    Ok(())
}

fn inspect(path: &Path) -> Result<()> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let Some(decoded) = decode_stream(file)? else {
        println!("{}: empty recording", path.display());
        return Ok(());
    };

    println!("{}:", path.display());
    println!("  Sample rate: {} Hz", decoded.header.sample_rate);
    println!("  Channels:    {}", decoded.header.channels);
    println!("  Frames:      {}", decoded.packets);
    println!("  Duration:    {:.2}s", decoded.duration_secs());
    println!("  Peak:        {}", max_abs_amplitude(&decoded.samples));
    Ok(())
}

fn meter(samples: &[i16]) -> String {
    column_levels(samples, METER_WIDTH, 1)
        .into_iter()
        .map(|level| METER[level.min(LEVELS_PER_ROW - 1)])
        .collect()
}

async fn record(args: RecordArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default()?,
    };

    let output = args.output.unwrap_or_else(|| config.default_output_path());
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }

    let backend: Box<dyn CaptureBackend> = if args.synthetic {
        tracing::info!("Using synthetic 440 Hz input");
        Box::new(SyntheticBackend::new(SyntheticSource::tone(440.0)))
    } else {
        Box::new(CpalBackend::new())
    };

    let target = if args.stream {
        PersistTarget::Stream(output.clone())
    } else {
        PersistTarget::Spool(output.clone())
    };

    let window = (config.device.sample_rate / 10) as usize;
    let pipeline = Pipeline::start(config, backend, target)?;
    tracing::info!("Recording to {} (Ctrl+C to stop)", output.display());

    let token = pipeline.token();
    let mut limit = tokio::task::spawn_blocking(move || token.wait());
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let ring = pipeline.ring();
    let started = Instant::now();
    let mut progress = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Stopping recording");
                break;
            }
            _ = &mut limit => {
                tracing::info!("Recording limit reached");
                break;
            }
            _ = progress.tick() => {
                if let Some(err) = pipeline.check_errors() {
                    tracing::warn!("Capture error: {}", err);
                }
                let stats = pipeline.stats();
                tracing::info!(
                    "{:>5.1}s  {} bytes  {}  dropped {}",
                    started.elapsed().as_secs_f32(),
                    pipeline.bytes_persisted(),
                    meter(&ring.read_samples(window)),
                    stats.get(PERSIST_SUBSCRIBER).map(|s| s.dropped).unwrap_or(0)
                );
            }
        }
    }

    let report = tokio::task::spawn_blocking(move || pipeline.finish()).await?;

    match report.persistence? {
        PersistOutcome::Recorded(summary) => {
            println!(
                "Saved {} ({} frames, {} PCM bytes, {:.1}s)",
                summary.output_path.display(),
                summary.frames,
                summary.bytes_spooled,
                summary.elapsed.as_secs_f32()
            );
        }
        PersistOutcome::Streamed { path, stats } => {
            println!(
                "Saved {} ({} batches, {} PCM bytes)",
                path.display(),
                stats.batches,
                stats.pcm_bytes
            );
        }
    }
    if report.capture.overruns > 0 {
        println!("Warning: {} capture packets were lost to overruns", report.capture.overruns);
    }

    Ok(())
}
