use hopper_detect::Roi;
use hopper_vib::SpeedLevel;

/// Everything the processing thread tells the outside world.
///
/// Events are emitted in processing order; within one batch the count is
/// strictly increasing and the speed schedule never accelerates.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    CountChanged {
        count: u64,
        track_id: u64,
        frame: u64,
    },
    VibratorSpeedChanged {
        level: SpeedLevel,
        percent: u8,
    },
    PackagingCompleted,
    ActuatorError(String),
    RecorderError(String),
    /// A tick was abandoned (malformed frame or detector fault); the
    /// running total is attached.
    TickSkipped {
        reason: String,
        total_skipped: u64,
    },
    FrameProcessed {
        frame: u64,
        n_objects: usize,
        n_tracks: usize,
        roi: Roi,
    },
}
