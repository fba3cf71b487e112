//! Command-line frontend: generate synthetic drop movies and replay them
//! through the full counting pipeline.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use hopper_cam::{synth, PipelineEvent, Processor, ProcessorCommand};
use hopper_config::{HopperConfig, SharedConfig};
use hopper_frame::PixFmt;
use hopper_rec::RawMovieWriter;
use hopper_source::{
    event_channel, CameraSource, ConnectionState, FileSource, FrameSlot, GrabSettings, SimDriver,
    SimScene, SourceEvent,
};

#[derive(Parser)]
#[command(name = "hopper-cam", about = "Vibratory-feeder part counter")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a synthetic drop-test movie.
    Synth {
        /// Output movie path.
        #[arg(long, default_value = "drop-test.hprv")]
        out: PathBuf,
        /// Number of parts to drop.
        #[arg(long, default_value_t = 6)]
        parts: u32,
        /// Frame rate declared in the movie.
        #[arg(long, default_value_t = 60.0)]
        fps: f64,
    },
    /// Replay a movie through the counting pipeline.
    Run {
        /// Input movie path.
        movie: PathBuf,
        /// Configuration file (JSON); defaults apply when absent.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Override packaging.target_count.
        #[arg(long)]
        target: Option<u32>,
        /// Re-record processed frames to this movie.
        #[arg(long)]
        record: Option<PathBuf>,
        /// Print every processed frame, not just counting events.
        #[arg(long)]
        verbose: bool,
    },
    /// Count parts from the simulated live camera until the batch
    /// completes.
    Live {
        /// Parts per package.
        #[arg(long, default_value_t = 20)]
        target: u32,
        /// Simulated camera frame rate.
        #[arg(long, default_value_t = 120.0)]
        fps: f64,
    },
    /// Print the default configuration tree as JSON.
    PrintConfig,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Synth { out, parts, fps } => {
            let spec = synth::SynthSpec {
                n_parts: parts,
                fps,
                ..synth::SynthSpec::default()
            };
            let n = synth::write_drop_movie(&out, &spec)?;
            info!("wrote {n} frames ({parts} parts) to {}", out.display());
            Ok(())
        }
        Command::PrintConfig => {
            println!("{}", HopperConfig::default().to_json_pretty()?);
            Ok(())
        }
        Command::Live { target, fps } => live(target, fps),
        Command::Run {
            movie,
            config,
            target,
            record,
            verbose,
        } => run(movie, config, target, record, verbose),
    }
}

/// Drive the simulated camera through the same path a hardware source
/// would take: enumerate, open, configure, grab.
fn live(target: u32, fps: f64) -> anyhow::Result<()> {
    let mut cfg = HopperConfig::default();
    cfg.packaging.target_count = target;
    cfg.validate()?;
    let shared = SharedConfig::new(cfg);

    let slot = Arc::new(FrameSlot::new());
    let (src_tx, src_rx) = event_channel();
    let (evt_tx, evt_rx) = event_channel();

    let driver = SimDriver::new(SimScene::default(), fps);
    let mut source = CameraSource::new(driver, slot.clone(), src_tx);
    for device in source.detect()? {
        info!("device {}: {} ({})", device.index, device.name, device.model);
    }
    source.open(0)?;
    // Wait for the off-thread open to land.
    let deadline = Instant::now() + Duration::from_secs(5);
    while source.state() != ConnectionState::Connected {
        anyhow::ensure!(Instant::now() < deadline, "open timed out");
        std::thread::sleep(Duration::from_millis(10));
    }
    source.configure(&GrabSettings {
        target_fps: fps,
        ..GrabSettings::default()
    })?;

    let processor = Processor::new(shared, slot, evt_tx);
    let handle = processor.spawn()?;
    handle
        .commands
        .send(ProcessorCommand::StartBatch)
        .context("processor command channel closed")?;
    source.start()?;

    let mut last_count = 0u64;
    loop {
        while let Ok(ev) = src_rx.try_recv() {
            if let SourceEvent::Fps(value) = ev {
                info!("camera fps: {value:.1}");
            }
        }
        match evt_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(PipelineEvent::CountChanged { count, .. }) => {
                last_count = count;
                println!("count {count:>5}");
            }
            Ok(PipelineEvent::VibratorSpeedChanged { level, percent }) => {
                println!("speed -> {level} ({percent}%)");
            }
            Ok(PipelineEvent::PackagingCompleted) => {
                println!("package complete at {last_count} parts");
                break;
            }
            Ok(PipelineEvent::ActuatorError(msg)) => println!("vibrator error: {msg}"),
            _ => {}
        }
    }

    source.stop()?;
    source.close()?;
    handle.control.stop();
    let _ = handle.join.join();
    Ok(())
}

fn run(
    movie: PathBuf,
    config: Option<PathBuf>,
    target: Option<u32>,
    record: Option<PathBuf>,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut cfg = match &config {
        Some(path) => HopperConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => HopperConfig::default(),
    };
    if let Some(target) = target {
        cfg.packaging.target_count = target;
    }
    cfg.validate()?;
    let shared = SharedConfig::new(cfg);

    let slot = Arc::new(FrameSlot::new());
    let (src_tx, src_rx) = event_channel();
    let (evt_tx, evt_rx) = event_channel();

    let mut source = FileSource::open(&movie, slot.clone(), src_tx, None)
        .with_context(|| format!("opening movie {}", movie.display()))?;
    info!(
        "replaying {} ({} frames at {} fps)",
        movie.display(),
        source.n_frames(),
        source.fps()
    );

    let mut processor = Processor::new(shared, slot, evt_tx);
    if let Some(path) = &record {
        // Same geometry as the input movie.
        let reader = hopper_rec::RawMovieReader::open(&movie)?;
        let writer = RawMovieWriter::create(
            path,
            reader.width(),
            reader.height(),
            PixFmt::Mono8,
            reader.nominal_fps(),
        )?;
        processor = processor.with_recorder(Arc::new(writer));
    }

    let handle = processor.spawn()?;
    handle
        .commands
        .send(ProcessorCommand::StartBatch)
        .context("processor command channel closed")?;
    source.start()?;

    let mut last_count = 0u64;
    let mut completed = false;
    let mut playback_finished: Option<Instant> = None;
    loop {
        while let Ok(ev) = src_rx.try_recv() {
            match ev {
                SourceEvent::PlaybackFinished => {
                    info!("playback finished");
                    playback_finished = Some(Instant::now());
                }
                SourceEvent::GrabError { fatal, msg } => {
                    println!("source error (fatal={fatal}): {msg}");
                }
                _ => {}
            }
        }
        match evt_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(PipelineEvent::CountChanged { count, track_id, frame }) => {
                last_count = count;
                println!("count {count:>5}  (track {track_id}, frame {frame})");
            }
            Ok(PipelineEvent::VibratorSpeedChanged { level, percent }) => {
                println!("speed -> {level} ({percent}%)");
            }
            Ok(PipelineEvent::PackagingCompleted) => {
                println!("package complete at {last_count} parts");
                completed = true;
            }
            Ok(PipelineEvent::ActuatorError(msg)) => println!("vibrator error: {msg}"),
            Ok(PipelineEvent::RecorderError(msg)) => println!("recorder error: {msg}"),
            Ok(PipelineEvent::TickSkipped { reason, total_skipped }) => {
                println!("tick skipped ({total_skipped} total): {reason}");
            }
            Ok(PipelineEvent::FrameProcessed { frame, n_objects, n_tracks, .. }) => {
                if verbose {
                    println!("frame {frame:>6}: {n_objects} objects, {n_tracks} tracks");
                }
            }
            Err(_) => {}
        }
        if completed {
            break;
        }
        // Give in-flight frames a moment to drain after the movie ends.
        if let Some(at) = playback_finished {
            if at.elapsed() > Duration::from_millis(500) {
                break;
            }
        }
    }

    source.stop()?;
    handle.control.stop();
    let _ = handle.join.join();
    println!("final count: {last_count}");
    Ok(())
}
