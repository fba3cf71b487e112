use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use tracing::{info, warn};

use hopper_config::SharedConfig;
use hopper_detect::{ClassicalDetector, Detector};
use hopper_frame::Frame;
use hopper_pack::{PackagingController, PackagingEvent};
use hopper_rec::RawMovieWriter;
use hopper_source::{FpsEstimator, FrameSlot};
use hopper_track::{gate_line_y, GateCounter, Tracker};
use hopper_vib::VibratorPair;

use crate::events::PipelineEvent;

/// How long one tick waits for a frame before re-checking for commands
/// and cancellation.
const FRAME_WAIT: Duration = Duration::from_millis(100);

/// Control requests accepted while the loop runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorCommand {
    StartBatch,
    ResetBatch,
    PausePackaging,
    ResumePackaging,
}

/// The processing stage: detector, tracker, gate and packaging run in
/// order on every frame taken from the slot.
///
/// All pipeline state is confined to this struct and, once
/// [spawn](Self::spawn)ed, to its thread. Configuration is re-read as an
/// immutable snapshot at the start of every tick.
pub struct Processor {
    detector: Box<dyn Detector + Send>,
    tracker: Tracker,
    gate: GateCounter,
    packaging: PackagingController,
    vibrators: VibratorPair,
    shared: SharedConfig,
    slot: Arc<FrameSlot>,
    events: Sender<PipelineEvent>,
    commands: (Sender<ProcessorCommand>, Receiver<ProcessorCommand>),
    recorder: Option<Arc<RawMovieWriter>>,
    fps: FpsEstimator,
    frame_index: u64,
    skipped_ticks: u64,
}

pub struct ProcessorHandle {
    pub control: thread_control::Control,
    pub join: std::thread::JoinHandle<()>,
    pub commands: Sender<ProcessorCommand>,
}

impl Processor {
    pub fn new(
        shared: SharedConfig,
        slot: Arc<FrameSlot>,
        events: Sender<PipelineEvent>,
    ) -> Self {
        let packaging = PackagingController::new(shared.snapshot().packaging.clone());
        Self {
            detector: Box::new(ClassicalDetector::new()),
            tracker: Tracker::new(),
            gate: GateCounter::new(),
            packaging,
            vibrators: VibratorPair::simulated(),
            shared,
            slot,
            events,
            commands: crossbeam_channel::unbounded(),
            recorder: None,
            fps: FpsEstimator::new(),
            frame_index: 0,
            skipped_ticks: 0,
        }
    }

    /// Replace the simulated actuators (e.g. with hardware-backed ones).
    pub fn with_vibrators(mut self, vibrators: VibratorPair) -> Self {
        self.vibrators = vibrators;
        self
    }

    /// Tap every processed frame into a movie writer.
    pub fn with_recorder(mut self, recorder: Arc<RawMovieWriter>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Swap in a different detector implementation.
    pub fn with_detector(mut self, detector: Box<dyn Detector + Send>) -> Self {
        self.detector = detector;
        self
    }

    pub fn command_sender(&self) -> Sender<ProcessorCommand> {
        self.commands.0.clone()
    }

    pub fn skipped_ticks(&self) -> u64 {
        self.skipped_ticks
    }

    pub fn count(&self) -> u64 {
        self.gate.count()
    }

    /// Apply one control request immediately.
    pub fn handle_command(&mut self, cmd: ProcessorCommand) {
        match cmd {
            ProcessorCommand::StartBatch => {
                self.packaging
                    .set_config(self.shared.snapshot().packaging.clone());
                let events = self.packaging.start(&mut self.vibrators);
                self.forward_packaging(events);
            }
            ProcessorCommand::ResetBatch => {
                self.gate.reset(&mut self.tracker);
                self.packaging.reset(&mut self.vibrators);
            }
            ProcessorCommand::PausePackaging => {
                let events = self.packaging.pause(&mut self.vibrators);
                self.forward_packaging(events);
            }
            ProcessorCommand::ResumePackaging => {
                let events = self.packaging.resume(&mut self.vibrators);
                self.forward_packaging(events);
            }
        }
    }

    /// Run one frame through detector, tracker, gate and packaging.
    pub fn process_frame(&mut self, frame: &Frame) {
        let cfg = self.shared.snapshot();
        let current_frame = self.frame_index;
        self.frame_index += 1;
        self.fps.tick(frame.monotonic_ns());

        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.write_frame(frame) {
                warn!("recorder write failed: {e}");
                let _ = self
                    .events
                    .send(PipelineEvent::RecorderError(e.to_string()));
            }
        }

        let det_cfg = cfg.detection.effective(self.fps.current());
        let detections = match self.detector.process(frame, &det_cfg) {
            Ok(d) => d,
            Err(e) => {
                self.skipped_ticks += 1;
                warn!("tick {current_frame} skipped: {e}");
                let _ = self.events.send(PipelineEvent::TickSkipped {
                    reason: e.to_string(),
                    total_skipped: self.skipped_ticks,
                });
                return;
            }
        };

        self.tracker
            .update(&detections.objects, current_frame, &cfg.tracking);

        let gate_y = gate_line_y(cfg.gate.gate_line_position_ratio, frame.height());
        let crossings = self.gate.process_tick(
            &mut self.tracker,
            current_frame,
            gate_y,
            &cfg.tracking,
            &cfg.gate,
        );
        for crossing in crossings {
            let _ = self.events.send(PipelineEvent::CountChanged {
                count: crossing.count,
                track_id: crossing.track_id,
                frame: crossing.frame,
            });
            let events = self
                .packaging
                .on_count(crossing.count, &mut self.vibrators);
            self.forward_packaging(events);
        }

        let _ = self.events.send(PipelineEvent::FrameProcessed {
            frame: current_frame,
            n_objects: detections.objects.len(),
            n_tracks: self.tracker.len(),
            roi: detections.roi,
        });
    }

    fn forward_packaging(&mut self, events: Vec<PackagingEvent>) {
        for ev in events {
            let mapped = match ev {
                PackagingEvent::SpeedChanged { level, percent } => {
                    PipelineEvent::VibratorSpeedChanged { level, percent }
                }
                PackagingEvent::Completed => PipelineEvent::PackagingCompleted,
                PackagingEvent::ActuatorError(msg) => PipelineEvent::ActuatorError(msg),
            };
            let _ = self.events.send(mapped);
        }
        for ev in self.vibrators.take_events() {
            if let hopper_vib::VibratorEvent::Error(msg) = ev {
                let _ = self.events.send(PipelineEvent::ActuatorError(msg));
            }
        }
    }

    /// The processing loop; returns when the control flag is lowered.
    pub fn run(mut self, flag: thread_control::Flag) {
        info!("processor started");
        while flag.is_alive() {
            while let Ok(cmd) = self.commands.1.try_recv() {
                self.handle_command(cmd);
            }
            if let Some(frame) = self.slot.take_timeout(FRAME_WAIT) {
                self.process_frame(&frame);
            }
        }
        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.finish() {
                warn!("recorder finish failed: {e}");
            }
        }
        info!(
            "processor exited after {} frames ({} skipped)",
            self.frame_index, self.skipped_ticks
        );
    }

    pub fn spawn(self) -> std::io::Result<ProcessorHandle> {
        let commands = self.commands.0.clone();
        let (flag, control) = thread_control::make_pair();
        let join = std::thread::Builder::new()
            .name("hopper-process".to_string())
            .spawn(move || self.run(flag))?;
        Ok(ProcessorHandle {
            control,
            join,
            commands,
        })
    }
}
