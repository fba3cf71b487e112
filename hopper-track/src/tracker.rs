use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tracing::{debug, trace};

use hopper_config::TrackingConfig;
use hopper_detect::{Bbox, DetectedObject};

/// Predictions never extrapolate faster than this, whatever the history
/// says (px/frame).
const VELOCITY_CAP: f64 = 200.0;

/// Score ties closer than this resolve toward the smaller detection.
const SCORE_TIE_EPS: f64 = 1e-6;

/// A persistent identity for one physical part.
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: u64,
    pub bbox: Bbox,
    pub area: f64,
    pub first_frame: u64,
    pub last_frame: u64,
    pub first_y: f64,
    pub min_y: f64,
    pub max_y: f64,
    /// Ticks on which this track was matched to a detection.
    pub in_roi_frames: u32,
    /// Set once by the gate counter; never reverts within a batch.
    pub counted: bool,
    pub missed_frames: u32,
    pub vx: f64,
    pub vy: f64,
    positions: VecDeque<(f64, f64)>,
    areas: VecDeque<f64>,
}

impl Track {
    fn new(id: u64, det: &DetectedObject, frame: u64, history_length: usize) -> Self {
        let (cx, cy) = det.centroid;
        let mut positions = VecDeque::with_capacity(history_length);
        positions.push_back((cx, cy));
        let mut areas = VecDeque::with_capacity(history_length);
        areas.push_back(det.area);
        Self {
            id,
            bbox: det.bbox,
            area: det.area,
            first_frame: frame,
            last_frame: frame,
            first_y: cy,
            min_y: cy,
            max_y: cy,
            in_roi_frames: 1,
            counted: false,
            missed_frames: 0,
            vx: 0.0,
            vy: 0.0,
            positions,
            areas,
        }
    }

    pub fn center(&self) -> (f64, f64) {
        match self.positions.back() {
            Some(&p) => p,
            None => self.bbox.center(),
        }
    }

    /// Expected position this tick, advancing by the mean per-frame delta
    /// for every frame the track went unmatched.
    pub fn predicted(&self) -> (f64, f64) {
        let (cx, cy) = self.center();
        let steps = self.missed_frames as f64;
        let speed = (self.vx * self.vx + self.vy * self.vy).sqrt();
        let scale = if speed > VELOCITY_CAP {
            VELOCITY_CAP / speed
        } else {
            1.0
        };
        (cx + self.vx * scale * steps, cy + self.vy * scale * steps)
    }

    fn absorb(&mut self, det: &DetectedObject, frame: u64, history_length: usize) {
        let (cx, cy) = det.centroid;
        if self.positions.len() == history_length {
            self.positions.pop_front();
        }
        self.positions.push_back((cx, cy));
        if self.areas.len() == history_length {
            self.areas.pop_front();
        }
        self.areas.push_back(det.area);
        self.bbox = det.bbox;
        self.area = det.area;
        self.last_frame = frame;
        self.missed_frames = 0;
        self.in_roi_frames += 1;
        self.min_y = self.min_y.min(cy);
        self.max_y = self.max_y.max(cy);
        self.recompute_velocity();
    }

    fn recompute_velocity(&mut self) {
        if self.positions.len() < 2 {
            self.vx = 0.0;
            self.vy = 0.0;
            return;
        }
        let n = (self.positions.len() - 1) as f64;
        let (mut sx, mut sy) = (0.0, 0.0);
        for pair in self.positions.iter().zip(self.positions.iter().skip(1)) {
            sx += pair.1 .0 - pair.0 .0;
            sy += pair.1 .1 - pair.0 .1;
        }
        self.vx = sx / n;
        self.vy = sy / n;
    }

    /// Fraction of history steps with non-decreasing y.
    pub fn direction_consistency(&self) -> f64 {
        if self.positions.len() < 2 {
            return 1.0;
        }
        let steps = self.positions.len() - 1;
        let downward = self
            .positions
            .iter()
            .zip(self.positions.iter().skip(1))
            .filter(|(a, b)| b.1 >= a.1)
            .count();
        downward as f64 / steps as f64
    }

    /// Whether the gate may count this track: old enough, actually moved
    /// down, and did so consistently.
    pub fn is_eligible(&self, current_frame: u64, cfg: &TrackingConfig) -> bool {
        current_frame.saturating_sub(self.first_frame) >= cfg.min_track_frames as u64
            && self.max_y - self.min_y >= cfg.min_y_travel
            && self.direction_consistency() >= cfg.direction_consistency_ratio
    }
}

struct Candidate {
    score: f64,
    area: f64,
    det_idx: usize,
    track_id: u64,
}

/// Greedy multi-feature tracker.
#[derive(Default)]
pub struct Tracker {
    tracks: BTreeMap<u64, Track>,
    next_id: u64,
}

impl Tracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn tracks_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.values_mut()
    }

    pub fn clear_counted_flags(&mut self) {
        for track in self.tracks.values_mut() {
            track.counted = false;
        }
    }

    /// Associate this tick's detections, create tracks for the leftovers,
    /// age the unmatched, and retire the stale.
    pub fn update(
        &mut self,
        detections: &[DetectedObject],
        current_frame: u64,
        cfg: &TrackingConfig,
    ) {
        let d_max = (cfg.crossing_tolerance_x * cfg.crossing_tolerance_x
            + cfg.crossing_tolerance_y * cfg.crossing_tolerance_y)
            .sqrt();

        let mut candidates: Vec<Candidate> = Vec::new();
        for (det_idx, det) in detections.iter().enumerate() {
            for track in self.tracks.values() {
                let (px, py) = track.predicted();
                let (cx, cy) = det.centroid;
                let dist = ((cx - px).powi(2) + (cy - py).powi(2)).sqrt();
                let area_max = det.area.max(track.area);
                let area_term = if area_max > 0.0 {
                    1.0 - (det.area - track.area).abs() / area_max
                } else {
                    0.0
                };
                let score = cfg.weight_distance * (1.0 - dist / d_max)
                    + cfg.weight_area * area_term
                    + cfg.weight_iou * det.bbox.iou(&track.bbox);
                if score >= cfg.match_threshold {
                    candidates.push(Candidate {
                        score,
                        area: det.area,
                        det_idx,
                        track_id: track.id,
                    });
                }
            }
        }

        // Highest score first; ties within SCORE_TIE_EPS prefer the
        // smaller detection. Quantizing keeps the comparator a total order.
        let quantize = |score: f64| (score / SCORE_TIE_EPS).round() as i64;
        candidates.sort_by(|a, b| {
            quantize(b.score)
                .cmp(&quantize(a.score))
                .then(a.area.total_cmp(&b.area))
        });

        let mut det_used = vec![false; detections.len()];
        let mut track_used: Vec<u64> = Vec::new();
        for cand in candidates {
            if det_used[cand.det_idx] || track_used.contains(&cand.track_id) {
                continue;
            }
            det_used[cand.det_idx] = true;
            track_used.push(cand.track_id);
            if let Some(track) = self.tracks.get_mut(&cand.track_id) {
                trace!(
                    "track {} matched detection {} (score {:.3})",
                    track.id,
                    cand.det_idx,
                    cand.score
                );
                track.absorb(&detections[cand.det_idx], current_frame, cfg.history_length);
            }
        }

        for track in self.tracks.values_mut() {
            if !track_used.contains(&track.id) {
                track.missed_frames += 1;
            }
        }

        for (det_idx, det) in detections.iter().enumerate() {
            if det_used[det_idx] {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            debug!("new track {id} at {:?}", det.centroid);
            self.tracks.insert(id, Track::new(id, det, current_frame, cfg.history_length));
        }

        let max_missed = cfg.max_missed_frames;
        let lifetime = cfg.track_lifetime as u64;
        self.tracks.retain(|id, track| {
            let stale = track.missed_frames > max_missed
                || (!track.counted && current_frame.saturating_sub(track.first_frame) > lifetime);
            if stale {
                debug!("retiring track {id} (missed {})", track.missed_frames);
            }
            !stale
        });
    }
}
