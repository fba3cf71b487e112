use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info};

use hopper_config::{GateConfig, TrackingConfig};

use crate::tracker::Tracker;

/// Absolute gate scan-line for a frame height.
pub fn gate_line_y(position_ratio: f64, frame_height: u32) -> f64 {
    (position_ratio * frame_height as f64).round()
}

/// Dedup memory of one counted crossing.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CountedRecord {
    pub center: (f64, f64),
    pub frame: u64,
}

/// One emitted counting event.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CountEvent {
    /// Batch count after this crossing.
    pub count: u64,
    pub track_id: u64,
    pub center: (f64, f64),
    pub frame: u64,
}

/// Counts each track's gate crossing at most once, with a spatio-temporal
/// dedup net under the tracker in case it fragments an identity.
#[derive(Debug, Default)]
pub struct GateCounter {
    count: u64,
    counted_history: VecDeque<CountedRecord>,
}

impl GateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Examine all alive tracks against the gate line and emit an event
    /// per fresh crossing. Call once per processed frame.
    pub fn process_tick(
        &mut self,
        tracker: &mut Tracker,
        current_frame: u64,
        gate_y: f64,
        tracking: &TrackingConfig,
        gate: &GateConfig,
    ) -> Vec<CountEvent> {
        let mut events = Vec::new();
        if !gate.enable_gate_counting {
            return events;
        }

        // Trim dedup memory to the configured horizon.
        let horizon = current_frame.saturating_sub(gate.gate_history_frames as u64);
        while let Some(front) = self.counted_history.front() {
            if front.frame < horizon {
                self.counted_history.pop_front();
            } else {
                break;
            }
        }

        for track in tracker.tracks_mut() {
            if track.counted {
                continue;
            }
            let (cx, cy) = track.center();
            if cy < gate_y {
                continue;
            }
            if !track.is_eligible(current_frame, tracking) {
                continue;
            }
            let duplicate = self.counted_history.iter().any(|rec| {
                current_frame.saturating_sub(rec.frame) <= tracking.temporal_tolerance as u64
                    && (cx - rec.center.0).abs() <= tracking.crossing_tolerance_x
                    && (cy - rec.center.1).abs() <= tracking.crossing_tolerance_y
            });
            if duplicate {
                debug!(
                    "track {} at ({cx:.1},{cy:.1}) suppressed as duplicate crossing",
                    track.id
                );
                track.counted = true;
                continue;
            }

            self.count += 1;
            track.counted = true;
            self.counted_history.push_back(CountedRecord {
                center: (cx, cy),
                frame: current_frame,
            });
            info!("count {} (track {})", self.count, track.id);
            events.push(CountEvent {
                count: self.count,
                track_id: track.id,
                center: (cx, cy),
                frame: current_frame,
            });
        }
        events
    }

    /// Zero the batch: count and dedup memory cleared, counted flags
    /// lifted, tracks left alive so in-flight parts keep their identity.
    pub fn reset(&mut self, tracker: &mut Tracker) {
        info!("batch reset after {} counts", self.count);
        self.count = 0;
        self.counted_history.clear();
        tracker.clear_counted_flags();
    }
}
