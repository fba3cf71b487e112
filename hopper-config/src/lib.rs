//! Configuration for the part-counting pipeline.
//!
//! All tunables live in one serde tree persisted as JSON. Components never
//! read the live configuration directly: the processing loop takes an
//! immutable [snapshot](SharedConfig::snapshot) at the start of each tick,
//! and mutations swap in a new validated snapshot which becomes visible on
//! the next tick.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> Error {
    Error::InvalidValue {
        key,
        reason: reason.into(),
    }
}

// ---------------------------
// detection

fn default_min_area() -> u32 {
    10
}
fn default_max_area() -> u32 {
    5000
}
fn default_min_aspect_ratio() -> f64 {
    0.2
}
fn default_max_aspect_ratio() -> f64 {
    5.0
}
fn default_min_extent() -> f64 {
    0.2
}
fn default_max_solidity() -> f64 {
    1.0
}
fn default_bg_history() -> u32 {
    500
}
fn default_bg_var_threshold() -> u32 {
    16
}
fn default_bg_learning_rate() -> f64 {
    0.001
}
fn default_canny_low() -> u32 {
    3
}
fn default_canny_high() -> u32 {
    10
}
fn default_gaussian_blur_kernel_size() -> u32 {
    1
}
fn default_connectivity() -> u8 {
    4
}
fn default_roi_height() -> u32 {
    200
}
fn default_roi_position_ratio() -> f64 {
    0.5
}
fn default_target_fps() -> u32 {
    280
}
fn default_high_speed_fps_threshold() -> u32 {
    220
}
fn default_true() -> bool {
    true
}

/// Parameters of the classical segmentation pipeline.
///
/// The detector combines a background-subtraction mask, an edge map and a
/// binary threshold, then filters connected components by shape. Fields
/// mirror that pipeline stage by stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    /// Smallest accepted component area, in pixels.
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    /// Largest accepted component area, in pixels.
    #[serde(default = "default_max_area")]
    pub max_area: u32,
    /// Lower bound on bounding-box width/height.
    #[serde(default = "default_min_aspect_ratio")]
    pub min_aspect_ratio: f64,
    /// Upper bound on bounding-box width/height.
    #[serde(default = "default_max_aspect_ratio")]
    pub max_aspect_ratio: f64,
    /// Lower bound on area / bounding-box area.
    #[serde(default = "default_min_extent")]
    pub min_extent: f64,
    /// Upper bound on area / convex-hull area.
    #[serde(default = "default_max_solidity")]
    pub max_solidity: f64,
    /// Background-model history length, in frames.
    #[serde(default = "default_bg_history")]
    pub bg_history: u32,
    /// Squared Mahalanobis distance above which a pixel is foreground.
    #[serde(default = "default_bg_var_threshold")]
    pub bg_var_threshold: u32,
    /// Shadow detection is not used by the reference pipeline.
    #[serde(default)]
    pub detect_shadows: bool,
    /// Background update weight per frame. 0 selects 1/min(frames,history).
    #[serde(default = "default_bg_learning_rate")]
    pub bg_learning_rate: f64,
    /// Canny hysteresis low threshold on the gradient magnitude.
    #[serde(default = "default_canny_low")]
    pub canny_low: u32,
    /// Canny hysteresis high threshold on the gradient magnitude.
    #[serde(default = "default_canny_high")]
    pub canny_high: u32,
    /// Fixed binary threshold (0..=255). 0 selects Otsu's method.
    #[serde(default)]
    pub binary_threshold: u8,
    /// Odd Gaussian kernel size; 1 disables blurring.
    #[serde(default = "default_gaussian_blur_kernel_size")]
    pub gaussian_blur_kernel_size: u32,
    /// Dilation structuring-element size; effective when iterations > 0.
    #[serde(default)]
    pub dilate_kernel_size: u32,
    #[serde(default)]
    pub dilate_iterations: u32,
    /// Closing structuring-element size; 0 skips closing.
    #[serde(default)]
    pub close_kernel_size: u32,
    /// Opening structuring-element size; effective when iterations > 0.
    #[serde(default)]
    pub opening_kernel_size: u32,
    #[serde(default)]
    pub opening_iterations: u32,
    /// Connected-component connectivity, 4 or 8.
    #[serde(default = "default_connectivity")]
    pub connectivity: u8,
    /// Restrict detection to a horizontal band of the frame.
    #[serde(default = "default_true")]
    pub roi_enabled: bool,
    /// Left edge of the band.
    #[serde(default)]
    pub roi_x: u32,
    /// Band width; 0 extends to the right frame edge.
    #[serde(default)]
    pub roi_width: u32,
    /// Band height, clamped to the frame height.
    #[serde(default = "default_roi_height")]
    pub roi_height: u32,
    /// Vertical placement of the band: 0 is the top, 1 the bottom.
    #[serde(default = "default_roi_position_ratio")]
    pub roi_position_ratio: f64,
    /// Drop components whose bounding box touches the band border.
    #[serde(default)]
    pub reject_border: bool,
    /// Force the high-speed parameter preset regardless of measured FPS.
    #[serde(default)]
    pub ultra_high_speed_mode: bool,
    /// Nominal source frame rate.
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,
    /// Measured FPS above which the high-speed preset engages on its own.
    #[serde(default = "default_high_speed_fps_threshold")]
    pub high_speed_fps_threshold: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_area: default_min_area(),
            max_area: default_max_area(),
            min_aspect_ratio: default_min_aspect_ratio(),
            max_aspect_ratio: default_max_aspect_ratio(),
            min_extent: default_min_extent(),
            max_solidity: default_max_solidity(),
            bg_history: default_bg_history(),
            bg_var_threshold: default_bg_var_threshold(),
            detect_shadows: false,
            bg_learning_rate: default_bg_learning_rate(),
            canny_low: default_canny_low(),
            canny_high: default_canny_high(),
            binary_threshold: 0,
            gaussian_blur_kernel_size: default_gaussian_blur_kernel_size(),
            dilate_kernel_size: 0,
            dilate_iterations: 0,
            close_kernel_size: 0,
            opening_kernel_size: 0,
            opening_iterations: 0,
            connectivity: default_connectivity(),
            roi_enabled: true,
            roi_x: 0,
            roi_width: 0,
            roi_height: default_roi_height(),
            roi_position_ratio: default_roi_position_ratio(),
            reject_border: false,
            ultra_high_speed_mode: false,
            target_fps: default_target_fps(),
            high_speed_fps_threshold: default_high_speed_fps_threshold(),
        }
    }
}

impl DetectionConfig {
    /// The parameter set actually applied on a tick.
    ///
    /// Returns a copy with the high-speed preset substituted when the mode
    /// is forced on or the measured frame rate exceeds the threshold. The
    /// preset trades background-model stability for latency.
    pub fn effective(&self, measured_fps: Option<f64>) -> DetectionConfig {
        let fast = self.ultra_high_speed_mode
            || measured_fps.is_some_and(|fps| fps > self.high_speed_fps_threshold as f64);
        if !fast {
            return self.clone();
        }
        DetectionConfig {
            bg_history: 100,
            bg_var_threshold: 8,
            min_area: 1,
            max_area: 2000,
            binary_threshold: 3,
            dilate_iterations: 0,
            close_kernel_size: 0,
            opening_iterations: 0,
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.min_area < 1 {
            return Err(invalid("detection.min_area", "must be >= 1"));
        }
        if self.max_area < self.min_area {
            return Err(invalid("detection.max_area", "must be >= min_area"));
        }
        if self.min_aspect_ratio <= 0.0 || self.max_aspect_ratio < self.min_aspect_ratio {
            return Err(invalid(
                "detection.max_aspect_ratio",
                "aspect bounds must be positive and ordered",
            ));
        }
        if !(0.0..=1.0).contains(&self.min_extent) {
            return Err(invalid("detection.min_extent", "must be in 0..1"));
        }
        if self.max_solidity <= 0.0 {
            return Err(invalid("detection.max_solidity", "must be positive"));
        }
        if self.bg_history < 1 {
            return Err(invalid("detection.bg_history", "must be >= 1"));
        }
        if self.bg_var_threshold < 1 {
            return Err(invalid("detection.bg_var_threshold", "must be >= 1"));
        }
        if self.bg_learning_rate < 0.0 || self.bg_learning_rate > 1.0 {
            return Err(invalid("detection.bg_learning_rate", "must be in 0..1"));
        }
        if self.canny_high < self.canny_low {
            return Err(invalid("detection.canny_high", "must be >= canny_low"));
        }
        if self.gaussian_blur_kernel_size % 2 == 0 {
            return Err(invalid(
                "detection.gaussian_blur_kernel_size",
                "must be odd (1 disables)",
            ));
        }
        if self.connectivity != 4 && self.connectivity != 8 {
            return Err(invalid("detection.connectivity", "must be 4 or 8"));
        }
        if !(0.0..=1.0).contains(&self.roi_position_ratio) {
            return Err(invalid("detection.roi_position_ratio", "must be in 0..1"));
        }
        if self.roi_enabled && self.roi_height == 0 {
            return Err(invalid("detection.roi_height", "must be >= 1"));
        }
        if self.target_fps == 0 {
            return Err(invalid("detection.target_fps", "must be >= 1"));
        }
        Ok(())
    }
}

// ---------------------------
// gate

fn default_gate_line_position_ratio() -> f64 {
    0.5
}
fn default_gate_history_frames() -> u32 {
    30
}

/// Virtual-gate counting parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GateConfig {
    #[serde(default = "default_true")]
    pub enable_gate_counting: bool,
    /// Gate scan-line position as a fraction of the frame height.
    #[serde(default = "default_gate_line_position_ratio")]
    pub gate_line_position_ratio: f64,
    /// How long counted-crossing records are kept, in frames.
    #[serde(default = "default_gate_history_frames")]
    pub gate_history_frames: u32,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enable_gate_counting: true,
            gate_line_position_ratio: default_gate_line_position_ratio(),
            gate_history_frames: default_gate_history_frames(),
        }
    }
}

impl GateConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.gate_line_position_ratio) {
            return Err(invalid("gate.gate_line_position_ratio", "must be in 0..1"));
        }
        if self.gate_history_frames == 0 {
            return Err(invalid("gate.gate_history_frames", "must be >= 1"));
        }
        Ok(())
    }
}

// ---------------------------
// packaging

fn default_target_count() -> u32 {
    150
}
fn default_speed_full_threshold() -> f64 {
    0.85
}
fn default_speed_medium_threshold() -> f64 {
    0.93
}
fn default_speed_slow_threshold() -> f64 {
    0.97
}
fn default_advance_stop_count() -> u32 {
    2
}
fn default_vibrator_speed_full() -> u8 {
    100
}
fn default_vibrator_speed_medium() -> u8 {
    60
}
fn default_vibrator_speed_slow() -> u8 {
    30
}
fn default_vibrator_speed_creep() -> u8 {
    10
}

/// Batch target and the discrete vibrator speed schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PackagingConfig {
    /// Parts per package.
    #[serde(default = "default_target_count")]
    pub target_count: u32,
    /// Progress ratio below which the feeder runs at full speed.
    #[serde(default = "default_speed_full_threshold")]
    pub speed_full_threshold: f64,
    #[serde(default = "default_speed_medium_threshold")]
    pub speed_medium_threshold: f64,
    #[serde(default = "default_speed_slow_threshold")]
    pub speed_slow_threshold: f64,
    /// Stop this many parts before the nominal target to absorb
    /// mechanical latency.
    #[serde(default = "default_advance_stop_count")]
    pub advance_stop_count: u32,
    #[serde(default = "default_vibrator_speed_full")]
    pub vibrator_speed_full: u8,
    #[serde(default = "default_vibrator_speed_medium")]
    pub vibrator_speed_medium: u8,
    #[serde(default = "default_vibrator_speed_slow")]
    pub vibrator_speed_slow: u8,
    #[serde(default = "default_vibrator_speed_creep")]
    pub vibrator_speed_creep: u8,
}

impl Default for PackagingConfig {
    fn default() -> Self {
        Self {
            target_count: default_target_count(),
            speed_full_threshold: default_speed_full_threshold(),
            speed_medium_threshold: default_speed_medium_threshold(),
            speed_slow_threshold: default_speed_slow_threshold(),
            advance_stop_count: default_advance_stop_count(),
            vibrator_speed_full: default_vibrator_speed_full(),
            vibrator_speed_medium: default_vibrator_speed_medium(),
            vibrator_speed_slow: default_vibrator_speed_slow(),
            vibrator_speed_creep: default_vibrator_speed_creep(),
        }
    }
}

impl PackagingConfig {
    fn validate(&self) -> Result<()> {
        if self.target_count < 1 {
            return Err(invalid("packaging.target_count", "must be >= 1"));
        }
        let (full, medium, slow) = (
            self.speed_full_threshold,
            self.speed_medium_threshold,
            self.speed_slow_threshold,
        );
        if !(0.0 < full && full < medium && medium < slow && slow < 1.0) {
            return Err(invalid(
                "packaging.speed_full_threshold",
                "thresholds must satisfy 0 < full < medium < slow < 1",
            ));
        }
        for (key, pct) in [
            ("packaging.vibrator_speed_full", self.vibrator_speed_full),
            ("packaging.vibrator_speed_medium", self.vibrator_speed_medium),
            ("packaging.vibrator_speed_slow", self.vibrator_speed_slow),
            ("packaging.vibrator_speed_creep", self.vibrator_speed_creep),
        ] {
            if pct > 100 {
                return Err(invalid(key, "must be in 0..100"));
            }
        }
        Ok(())
    }
}

// ---------------------------
// tracking

fn default_crossing_tolerance_x() -> f64 {
    35.0
}
fn default_crossing_tolerance_y() -> f64 {
    50.0
}
fn default_min_track_frames() -> u32 {
    2
}
fn default_track_lifetime() -> u32 {
    20
}
fn default_min_y_travel() -> f64 {
    2.0
}
fn default_history_length() -> usize {
    10
}
fn default_temporal_tolerance() -> u32 {
    6
}
fn default_max_missed_frames() -> u32 {
    5
}
fn default_match_threshold() -> f64 {
    0.15
}
fn default_weight_distance() -> f64 {
    0.8
}
fn default_weight_area() -> f64 {
    0.2
}
fn default_weight_iou() -> f64 {
    0.0
}
fn default_direction_consistency_ratio() -> f64 {
    0.7
}

/// Tracker association and counting-eligibility parameters.
///
/// The default weights suit small parts: frame-to-frame IoU of a 10 px part
/// falling 14 px per frame is zero, so distance dominates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingConfig {
    /// Horizontal dedup window around a counted crossing, in pixels.
    #[serde(default = "default_crossing_tolerance_x")]
    pub crossing_tolerance_x: f64,
    /// Vertical dedup window around a counted crossing, in pixels.
    #[serde(default = "default_crossing_tolerance_y")]
    pub crossing_tolerance_y: f64,
    /// Minimum track age before it may count.
    #[serde(default = "default_min_track_frames")]
    pub min_track_frames: u32,
    /// Frames after which an uncounted track is retired.
    #[serde(default = "default_track_lifetime")]
    pub track_lifetime: u32,
    /// Minimum downward travel before a track may count, in pixels.
    #[serde(default = "default_min_y_travel")]
    pub min_y_travel: f64,
    /// Length of the per-track position/area history.
    #[serde(default = "default_history_length")]
    pub history_length: usize,
    /// Dedup window around a counted crossing, in frames.
    #[serde(default = "default_temporal_tolerance")]
    pub temporal_tolerance: u32,
    /// Consecutive missed frames after which a track is retired.
    #[serde(default = "default_max_missed_frames")]
    pub max_missed_frames: u32,
    /// Minimum association score for a detection/track match.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f64,
    #[serde(default = "default_weight_distance")]
    pub weight_distance: f64,
    #[serde(default = "default_weight_area")]
    pub weight_area: f64,
    #[serde(default = "default_weight_iou")]
    pub weight_iou: f64,
    /// Fraction of history steps that must move downward.
    #[serde(default = "default_direction_consistency_ratio")]
    pub direction_consistency_ratio: f64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            crossing_tolerance_x: default_crossing_tolerance_x(),
            crossing_tolerance_y: default_crossing_tolerance_y(),
            min_track_frames: default_min_track_frames(),
            track_lifetime: default_track_lifetime(),
            min_y_travel: default_min_y_travel(),
            history_length: default_history_length(),
            temporal_tolerance: default_temporal_tolerance(),
            max_missed_frames: default_max_missed_frames(),
            match_threshold: default_match_threshold(),
            weight_distance: default_weight_distance(),
            weight_area: default_weight_area(),
            weight_iou: default_weight_iou(),
            direction_consistency_ratio: default_direction_consistency_ratio(),
        }
    }
}

impl TrackingConfig {
    fn validate(&self) -> Result<()> {
        if self.crossing_tolerance_x < 0.0 || self.crossing_tolerance_y < 0.0 {
            return Err(invalid(
                "tracking.crossing_tolerance_x",
                "tolerances must be non-negative",
            ));
        }
        if self.history_length < 2 {
            return Err(invalid("tracking.history_length", "must be >= 2"));
        }
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(invalid("tracking.match_threshold", "must be in 0..1"));
        }
        for (key, w) in [
            ("tracking.weight_distance", self.weight_distance),
            ("tracking.weight_area", self.weight_area),
            ("tracking.weight_iou", self.weight_iou),
        ] {
            if w < 0.0 {
                return Err(invalid(key, "must be non-negative"));
            }
        }
        if !(0.0..=1.0).contains(&self.direction_consistency_ratio) {
            return Err(invalid(
                "tracking.direction_consistency_ratio",
                "must be in 0..1",
            ));
        }
        Ok(())
    }
}

// ---------------------------
// root

/// The full on-disk configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HopperConfig {
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub gate: GateConfig,
    #[serde(default)]
    pub packaging: PackagingConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
}

impl HopperConfig {
    pub fn validate(&self) -> Result<()> {
        self.detection.validate()?;
        self.gate.validate()?;
        self.packaging.validate()?;
        self.tracking.validate()
    }

    /// Parse and validate a JSON document.
    pub fn from_json(buf: &str) -> Result<Self> {
        let cfg: HopperConfig = serde_json::from_str(buf)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::from_json(&buf)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_json_pretty()?)?;
        Ok(())
    }
}

/// Shared handle to the live configuration.
///
/// Readers take an `Arc` snapshot and keep it for the duration of a tick.
/// [update](Self::update) validates the modified tree before swapping it
/// in; on failure the previous configuration stays live.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<HopperConfig>>>,
}

impl SharedConfig {
    pub fn new(cfg: HopperConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(cfg))),
        }
    }

    pub fn snapshot(&self) -> Arc<HopperConfig> {
        self.inner.read().clone()
    }

    /// Apply `mutate` to a copy, validate, and swap the copy in.
    pub fn update<F>(&self, mutate: F) -> Result<Arc<HopperConfig>>
    where
        F: FnOnce(&mut HopperConfig),
    {
        let mut guard = self.inner.write();
        let mut cfg = HopperConfig::clone(&guard);
        mutate(&mut cfg);
        cfg.validate()?;
        let cfg = Arc::new(cfg);
        *guard = cfg.clone();
        Ok(cfg)
    }
}
