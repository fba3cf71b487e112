//! Classical part detector: background subtraction ∪ edges ∪ threshold,
//! morphology, connected components, and a shape filter, all restricted to
//! a configurable region of interest.
//!
//! The detector owns its background model and is confined to the
//! processing thread; the debug latches are the only state other threads
//! may read.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use hopper_config::DetectionConfig;
use hopper_frame::{Frame, PixFmt};

mod background;
mod components;
mod edges;
pub mod imops;

pub use background::BackgroundModel;
pub use components::{Component, Connectivity};
pub use edges::canny;
pub use imops::GrayImage;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(PixFmt),
}

/// Active detection sub-rectangle, in full-frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl Roi {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x as f64
            && x < (self.x + self.w) as f64
            && y >= self.y as f64
            && y < (self.y + self.h) as f64
    }
}

/// Compute the ROI for a frame size; the bool reports whether any
/// configured value had to be clamped.
pub fn roi_for_frame(cfg: &DetectionConfig, frame_w: u32, frame_h: u32) -> (Roi, bool) {
    if !cfg.roi_enabled {
        return (
            Roi {
                x: 0,
                y: 0,
                w: frame_w,
                h: frame_h,
            },
            false,
        );
    }
    let mut clamped = false;
    let h = if cfg.roi_height > frame_h {
        clamped = true;
        frame_h
    } else {
        cfg.roi_height
    };
    let y = (cfg.roi_position_ratio * (frame_h - h) as f64).round() as u32;
    let x = if cfg.roi_x >= frame_w {
        clamped = true;
        0
    } else {
        cfg.roi_x
    };
    let mut w = if cfg.roi_width > 0 {
        cfg.roi_width
    } else {
        frame_w - x
    };
    if x + w > frame_w {
        clamped = true;
        w = frame_w - x;
    }
    (Roi { x, y, w, h }, clamped)
}

/// Axis-aligned box in full-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bbox {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl Bbox {
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.w / 2.0, self.y + self.h / 2.0)
    }

    /// Intersection over union; 0 for disjoint boxes.
    pub fn iou(&self, other: &Bbox) -> f64 {
        let ix = (self.x + self.w).min(other.x + other.w) - self.x.max(other.x);
        let iy = (self.y + self.h).min(other.y + other.h) - self.y.max(other.y);
        if ix <= 0.0 || iy <= 0.0 {
            return 0.0;
        }
        let inter = ix * iy;
        let union = self.w * self.h + other.w * other.h - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// A blob that passed the shape gates, in full-frame coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedObject {
    pub bbox: Bbox,
    pub centroid: (f64, f64),
    pub area: f64,
}

/// Result of one detector tick.
#[derive(Debug, Clone)]
pub struct Detections {
    pub objects: Vec<DetectedObject>,
    pub roi: Roi,
}

/// Latest-value slots the display side reads without touching the
/// detector. Each store replaces the previous image wholesale.
#[derive(Clone, Default)]
pub struct DebugLatches {
    foreground: Arc<Mutex<Option<Arc<GrayImage>>>>,
    edges: Arc<Mutex<Option<Arc<GrayImage>>>>,
    combined: Arc<Mutex<Option<Arc<GrayImage>>>>,
    annotated: Arc<Mutex<Option<Arc<GrayImage>>>>,
}

impl DebugLatches {
    pub fn latest_foreground(&self) -> Option<Arc<GrayImage>> {
        self.foreground.lock().clone()
    }

    pub fn latest_edges(&self) -> Option<Arc<GrayImage>> {
        self.edges.lock().clone()
    }

    pub fn latest_combined(&self) -> Option<Arc<GrayImage>> {
        self.combined.lock().clone()
    }

    pub fn latest_annotated(&self) -> Option<Arc<GrayImage>> {
        self.annotated.lock().clone()
    }
}

/// The detector capability.
///
/// The learned-model variant implements the same contract; the processing
/// loop neither knows nor cares which one it drives.
pub trait Detector {
    fn process(&mut self, frame: &Frame, cfg: &DetectionConfig) -> Result<Detections>;
    fn reset(&mut self);
    fn debug_latches(&self) -> &DebugLatches;
}

/// Reference detector combining MOG2 foreground, Canny edges and a binary
/// threshold.
pub struct ClassicalDetector {
    model: Option<BackgroundModel>,
    last_frame_dims: Option<(u32, u32)>,
    latches: DebugLatches,
    roi_warned: bool,
}

impl Default for ClassicalDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassicalDetector {
    pub fn new() -> Self {
        Self {
            model: None,
            last_frame_dims: None,
            latches: DebugLatches::default(),
            roi_warned: false,
        }
    }

    fn ensure_model(&mut self, roi: &Roi, cfg: &DetectionConfig) -> &mut BackgroundModel {
        let dims = (roi.w as usize, roi.h as usize);
        let params = (cfg.bg_history, cfg.bg_var_threshold);
        let stale = match &self.model {
            Some(m) => m.dims() != dims || m.params() != params,
            None => true,
        };
        if stale {
            self.model = None;
        }
        self.model.get_or_insert_with(|| {
            BackgroundModel::new(dims.0, dims.1, cfg.bg_history, cfg.bg_var_threshold)
        })
    }
}

impl Detector for ClassicalDetector {
    fn process(&mut self, frame: &Frame, cfg: &DetectionConfig) -> Result<Detections> {
        let (roi, clamped) = roi_for_frame(cfg, frame.width(), frame.height());
        if clamped && !self.roi_warned {
            warn!(
                "configured ROI exceeds the {}x{} frame; clamped to {:?}",
                frame.width(),
                frame.height(),
                roi
            );
            self.roi_warned = true;
        }

        // A changed frame geometry invalidates the background model; skip
        // this tick and start re-learning.
        let dims = (frame.width(), frame.height());
        if let Some(last) = self.last_frame_dims {
            if last != dims {
                warn!("frame dimensions changed {last:?} -> {dims:?}; background model reset");
                self.last_frame_dims = Some(dims);
                self.model = None;
                return Ok(Detections {
                    objects: Vec::new(),
                    roi,
                });
            }
        }
        self.last_frame_dims = Some(dims);

        let gray = GrayImage::from_frame_roi(frame, &roi)?;
        let work = if cfg.gaussian_blur_kernel_size > 1 {
            imops::gaussian_blur(&gray, cfg.gaussian_blur_kernel_size as usize)
        } else {
            gray
        };

        let mut fg = GrayImage::new(work.width, work.height);
        self.ensure_model(&roi, cfg)
            .apply(&work, &mut fg, cfg.bg_learning_rate);

        let ed = canny(&work, cfg.canny_low as f32, cfg.canny_high as f32);

        let threshold = if cfg.binary_threshold == 0 {
            imops::otsu_threshold(&work)
        } else {
            cfg.binary_threshold
        };
        let bi = imops::threshold_binary(&work, threshold);

        let mut mask = imops::or3(&fg, &ed, &bi);
        if cfg.dilate_iterations > 0 && cfg.dilate_kernel_size > 1 {
            mask = imops::dilate(
                &mask,
                cfg.dilate_kernel_size as usize,
                cfg.dilate_iterations as usize,
            );
        }
        if cfg.close_kernel_size > 1 {
            mask = imops::close(&mask, cfg.close_kernel_size as usize);
        }
        if cfg.opening_iterations > 0 && cfg.opening_kernel_size > 1 {
            mask = imops::open(
                &mask,
                cfg.opening_kernel_size as usize,
                cfg.opening_iterations as usize,
            );
        }

        let comps =
            components::connected_components(&mask, Connectivity::from_config(cfg.connectivity));
        let mut objects = Vec::new();
        let mut annotated = mask.clone();
        for comp in &comps {
            if !accept(comp, cfg, &roi) {
                continue;
            }
            imops::draw_rect(
                &mut annotated,
                comp.min_x,
                comp.min_y,
                comp.bbox_w(),
                comp.bbox_h(),
                128,
            );
            objects.push(DetectedObject {
                bbox: Bbox {
                    x: (roi.x as usize + comp.min_x) as f64,
                    y: (roi.y as usize + comp.min_y) as f64,
                    w: comp.bbox_w() as f64,
                    h: comp.bbox_h() as f64,
                },
                centroid: (roi.x as f64 + comp.cx, roi.y as f64 + comp.cy),
                area: comp.area,
            });
        }

        *self.latches.foreground.lock() = Some(Arc::new(fg));
        *self.latches.edges.lock() = Some(Arc::new(ed));
        *self.latches.combined.lock() = Some(Arc::new(mask));
        *self.latches.annotated.lock() = Some(Arc::new(annotated));

        Ok(Detections { objects, roi })
    }

    fn reset(&mut self) {
        self.model = None;
        self.last_frame_dims = None;
    }

    fn debug_latches(&self) -> &DebugLatches {
        &self.latches
    }
}

fn accept(comp: &Component, cfg: &DetectionConfig, roi: &Roi) -> bool {
    if comp.area < cfg.min_area as f64 || comp.area > cfg.max_area as f64 {
        return false;
    }
    let aspect = comp.bbox_w() as f64 / comp.bbox_h() as f64;
    if aspect < cfg.min_aspect_ratio || aspect > cfg.max_aspect_ratio {
        return false;
    }
    let extent = comp.area / (comp.bbox_w() * comp.bbox_h()) as f64;
    if extent < cfg.min_extent {
        return false;
    }
    if comp.solidity() > cfg.max_solidity {
        return false;
    }
    if cfg.reject_border
        && (comp.min_x == 0
            || comp.min_y == 0
            || comp.max_x + 1 == roi.w as usize
            || comp.max_y + 1 == roi.h as usize)
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use hopper_config::DetectionConfig;

    #[test]
    fn roi_band_is_ratio_positioned() {
        let mut cfg = DetectionConfig::default();
        cfg.roi_height = 100;
        cfg.roi_position_ratio = 0.5;
        let (roi, clamped) = roi_for_frame(&cfg, 640, 480);
        assert!(!clamped);
        assert_eq!(roi, Roi { x: 0, y: 190, w: 640, h: 100 });

        cfg.roi_position_ratio = 0.0;
        assert_eq!(roi_for_frame(&cfg, 640, 480).0.y, 0);
        cfg.roi_position_ratio = 1.0;
        assert_eq!(roi_for_frame(&cfg, 640, 480).0.y, 380);
    }

    #[test]
    fn oversized_roi_is_clamped_with_flag() {
        let mut cfg = DetectionConfig::default();
        cfg.roi_height = 5000;
        let (roi, clamped) = roi_for_frame(&cfg, 640, 480);
        assert!(clamped);
        assert_eq!((roi.y, roi.h), (0, 480));

        let mut cfg = DetectionConfig::default();
        cfg.roi_x = 600;
        cfg.roi_width = 100;
        let (roi, clamped) = roi_for_frame(&cfg, 640, 480);
        assert!(clamped);
        assert!(roi.x + roi.w <= 640);
    }

    #[test]
    fn disabled_roi_is_full_frame() {
        let mut cfg = DetectionConfig::default();
        cfg.roi_enabled = false;
        let (roi, _) = roi_for_frame(&cfg, 640, 480);
        assert_eq!(roi, Roi { x: 0, y: 0, w: 640, h: 480 });
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = Bbox { x: 0.0, y: 0.0, w: 10.0, h: 10.0 };
        let b = Bbox { x: 20.0, y: 0.0, w: 10.0, h: 10.0 };
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-9);
    }
}
