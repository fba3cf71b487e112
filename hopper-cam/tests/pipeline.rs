//! Whole-pipeline runs over synthetic drop movies.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hopper_cam::{synth, PipelineEvent, Processor, ProcessorCommand};
use hopper_config::{HopperConfig, SharedConfig};
use hopper_frame::PixFmt;
use hopper_rec::{RawMovieReader, RawMovieWriter};
use hopper_source::{event_channel, FileSource, FrameSlot, SourceEvent};
use hopper_vib::SpeedLevel;

fn drop_movie(dir: &tempfile::TempDir, n_parts: u32) -> std::path::PathBuf {
    let path = dir.path().join("drop.hprv");
    let spec = synth::SynthSpec {
        n_parts,
        ..synth::SynthSpec::default()
    };
    synth::write_drop_movie(&path, &spec).unwrap();
    path
}

fn shared_config(target: u32, advance: u32) -> SharedConfig {
    let mut cfg = HopperConfig::default();
    cfg.packaging.target_count = target;
    cfg.packaging.advance_stop_count = advance;
    SharedConfig::new(cfg)
}

/// Deterministic single-thread run: every movie frame goes through the
/// processor once; every part is counted exactly once.
#[test]
fn every_part_counts_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = drop_movie(&dir, 6);

    let slot = Arc::new(FrameSlot::new());
    let (evt_tx, evt_rx) = event_channel();
    // Large target: the batch never completes, pure counting.
    let mut processor = Processor::new(shared_config(100, 2), slot, evt_tx);
    processor.handle_command(ProcessorCommand::StartBatch);

    let mut reader = RawMovieReader::open(&path).unwrap();
    while let Some(frame) = reader.next_frame() {
        processor.process_frame(&frame.unwrap());
    }
    assert_eq!(processor.skipped_ticks(), 0);
    assert_eq!(processor.count(), 6);

    let mut counts = Vec::new();
    while let Ok(ev) = evt_rx.try_recv() {
        if let PipelineEvent::CountChanged { count, .. } = ev {
            counts.push(count);
        }
    }
    assert_eq!(counts, vec![1, 2, 3, 4, 5, 6]);
}

/// Completion ordering: the STOP speed change precedes the single
/// PackagingCompleted, and the speed schedule never accelerates.
#[test]
fn batch_completes_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = drop_movie(&dir, 6);

    let slot = Arc::new(FrameSlot::new());
    let (evt_tx, evt_rx) = event_channel();
    // Target 5, advance stop 1: completion at the 4th count.
    let mut processor = Processor::new(shared_config(5, 1), slot, evt_tx);
    processor.handle_command(ProcessorCommand::StartBatch);

    let mut reader = RawMovieReader::open(&path).unwrap();
    while let Some(frame) = reader.next_frame() {
        processor.process_frame(&frame.unwrap());
    }

    let mut speed_log = Vec::new();
    let mut completions = 0;
    let mut count_at_completion = None;
    let mut last_count = 0;
    while let Ok(ev) = evt_rx.try_recv() {
        match ev {
            PipelineEvent::VibratorSpeedChanged { level, .. } => speed_log.push(level),
            PipelineEvent::PackagingCompleted => {
                completions += 1;
                count_at_completion = Some(last_count);
            }
            PipelineEvent::CountChanged { count, .. } => last_count = count,
            _ => {}
        }
    }
    assert_eq!(completions, 1);
    assert_eq!(count_at_completion, Some(4));
    // Fastest-first ordering makes "never accelerates" non-decreasing.
    assert!(speed_log.windows(2).all(|w| w[0] <= w[1]), "{speed_log:?}");
    assert_eq!(*speed_log.last().unwrap(), SpeedLevel::Stop);
    // The gate keeps counting parts that fall after the batch closed.
    assert_eq!(processor.count(), 6);
}

/// The recorder tap sees every processed frame.
#[test]
fn recorder_tap_records_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let path = drop_movie(&dir, 2);
    let rec_path = dir.path().join("rerecorded.hprv");

    let writer = Arc::new(
        RawMovieWriter::create(&rec_path, 320, 240, PixFmt::Mono8, 60.0).unwrap(),
    );
    let slot = Arc::new(FrameSlot::new());
    let (evt_tx, _evt_rx) = event_channel();
    let mut processor =
        Processor::new(shared_config(100, 2), slot, evt_tx).with_recorder(writer.clone());

    let mut reader = RawMovieReader::open(&path).unwrap();
    let mut n_in = 0;
    while let Some(frame) = reader.next_frame() {
        processor.process_frame(&frame.unwrap());
        n_in += 1;
    }
    assert_eq!(writer.finish().unwrap(), n_in);

    let copy = RawMovieReader::open(&rec_path).unwrap();
    assert_eq!(copy.n_frames(), n_in);
}

/// Full two-thread run: file source feeding the spawned processor through
/// the latest-frame slot until the batch completes.
#[test]
fn threaded_pipeline_completes_a_batch() {
    let dir = tempfile::tempdir().unwrap();
    let path = drop_movie(&dir, 3);

    let slot = Arc::new(FrameSlot::new());
    let (src_tx, src_rx) = event_channel();
    let (evt_tx, evt_rx) = event_channel();

    // Target 3, advance 1: two counted parts close the batch; the third
    // is headroom against frames skipped by the latest-only slot.
    let processor = Processor::new(shared_config(3, 1), slot.clone(), evt_tx);
    let handle = processor.spawn().unwrap();
    handle.commands.send(ProcessorCommand::StartBatch).unwrap();

    let mut source = FileSource::open(&path, slot, src_tx, None).unwrap();
    source.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(60);
    let mut completed = false;
    let mut finished = false;
    while !completed && Instant::now() < deadline {
        if let Ok(ev) = evt_rx.recv_timeout(Duration::from_millis(20)) {
            if matches!(ev, PipelineEvent::PackagingCompleted) {
                completed = true;
            }
        }
        while let Ok(ev) = src_rx.try_recv() {
            if matches!(ev, SourceEvent::PlaybackFinished) {
                finished = true;
            }
        }
        if finished && !completed {
            // Allow the processor to drain the last frame.
            std::thread::sleep(Duration::from_millis(200));
        }
    }
    assert!(completed, "batch never completed");

    source.stop().unwrap();
    handle.control.stop();
    handle.join.join().unwrap();
}
