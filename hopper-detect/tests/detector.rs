use chrono::{DateTime, Utc};

use hopper_config::DetectionConfig;
use hopper_detect::{ClassicalDetector, Detector, Roi};
use hopper_frame::Frame;

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

fn stamp() -> DateTime<Utc> {
    DateTime::from_timestamp(1_431_648_000, 0).unwrap()
}

const W: u32 = 640;
const H: u32 = 480;

fn black_frame(w: u32, h: u32, n: u64) -> Frame {
    Frame::mono8(w, h, vec![0; (w * h) as usize], stamp(), n).unwrap()
}

/// Black frame with white squares at the given top-left corners.
fn frame_with_squares(squares: &[(u32, u32, u32)], n: u64) -> Frame {
    let mut buf = vec![0u8; (W * H) as usize];
    for &(x0, y0, size) in squares {
        for y in y0..(y0 + size).min(H) {
            for x in x0..(x0 + size).min(W) {
                buf[(y * W + x) as usize] = 255;
            }
        }
    }
    Frame::mono8(W, H, buf, stamp(), n).unwrap()
}

fn warm_up(det: &mut ClassicalDetector, cfg: &DetectionConfig, n: usize) {
    for i in 0..n {
        det.process(&black_frame(W, H, i as u64), cfg).unwrap();
    }
}

#[test]
fn detects_an_injected_square() {
    init();
    let cfg = DetectionConfig::default();
    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &cfg, 5);

    // Default band: 200 px tall, centered -> y in 140..340.
    let found = det
        .process(&frame_with_squares(&[(315, 235, 10)], 5), &cfg)
        .unwrap();
    assert_eq!(found.roi, Roi { x: 0, y: 140, w: W, h: 200 });
    assert_eq!(found.objects.len(), 1);
    let obj = &found.objects[0];
    // The edge map adds up to one pixel of rind around the thresholded core.
    assert!((100.0..=170.0).contains(&obj.area), "area={}", obj.area);
    assert!((obj.centroid.0 - 319.5).abs() < 1.5);
    assert!((obj.centroid.1 - 239.5).abs() < 1.5);
    // Full-frame coordinates: the bbox sits where the square was drawn.
    assert!((obj.bbox.x - 315.0).abs() <= 2.0);
    assert!((obj.bbox.y - 235.0).abs() <= 2.0);

    // Debug latches hold this tick's masks.
    let latches = det.debug_latches();
    assert!(latches.latest_foreground().is_some());
    assert!(latches.latest_edges().is_some());
    assert!(latches.latest_combined().is_some());
    assert!(latches.latest_annotated().is_some());
}

#[test]
fn centroids_stay_inside_the_roi() {
    init();
    let cfg = DetectionConfig::default();
    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &cfg, 5);

    // One square inside the band, one far above it.
    let found = det
        .process(&frame_with_squares(&[(100, 200, 10), (100, 20, 10)], 5), &cfg)
        .unwrap();
    assert_eq!(found.objects.len(), 1);
    for obj in &found.objects {
        assert!(
            found.roi.contains(obj.centroid.0, obj.centroid.1),
            "centroid {:?} outside {:?}",
            obj.centroid,
            found.roi
        );
    }
}

#[test]
fn dimension_change_resets_the_model() {
    init();
    let cfg = DetectionConfig::default();
    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &cfg, 5);

    // A resized frame yields an empty list for that tick.
    let small = Frame::mono8(320, 240, vec![0; 320 * 240], stamp(), 10).unwrap();
    let found = det.process(&small, &cfg).unwrap();
    assert!(found.objects.is_empty());

    // Detection recovers at the new geometry.
    for i in 0..5u64 {
        det.process(
            &Frame::mono8(320, 240, vec![0; 320 * 240], stamp(), 11 + i).unwrap(),
            &cfg,
        )
        .unwrap();
    }
    let mut buf = vec![0u8; 320 * 240];
    for y in 115..125u32 {
        for x in 155..165u32 {
            buf[(y * 320 + x) as usize] = 255;
        }
    }
    let found = det
        .process(&Frame::mono8(320, 240, buf, stamp(), 16).unwrap(), &cfg)
        .unwrap();
    assert_eq!(found.objects.len(), 1);
}

#[test]
fn border_touching_blobs_can_be_rejected() {
    init();
    let mut cfg = DetectionConfig::default();
    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &cfg, 5);

    // Square straddling the top edge of the band (band starts at y=140).
    let frame = frame_with_squares(&[(300, 140, 10)], 5);
    let found = det.process(&frame, &cfg).unwrap();
    assert_eq!(found.objects.len(), 1);

    cfg.reject_border = true;
    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &cfg, 5);
    let found = det.process(&frame, &cfg).unwrap();
    assert!(found.objects.is_empty());
}

#[test]
fn high_speed_preset_narrows_the_area_window() {
    init();
    let base = DetectionConfig::default();
    let mut fast_src = base.clone();
    fast_src.ultra_high_speed_mode = true;
    let fast = fast_src.effective(None);

    // A 60 px square (~3600 px) passes the normal window but exceeds the
    // preset's max_area of 2000.
    let big = frame_with_squares(&[(300, 200, 60)], 5);
    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &base, 5);
    assert_eq!(det.process(&big, &base).unwrap().objects.len(), 1);

    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &fast, 5);
    assert!(det.process(&big, &fast).unwrap().objects.is_empty());

    // A 2x2 part sits near the normal minimum but is comfortably above
    // the preset's min_area of 1.
    let tiny = frame_with_squares(&[(320, 240, 2)], 5);
    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &fast, 5);
    let found = det.process(&tiny, &fast).unwrap();
    assert_eq!(found.objects.len(), 1);
    assert!(found.objects[0].area >= 4.0);
}

#[test]
fn track_reset_clears_state() {
    init();
    let cfg = DetectionConfig::default();
    let mut det = ClassicalDetector::new();
    warm_up(&mut det, &cfg, 5);
    det.reset();
    // First frame after reset: model re-learns, whole band is foreground,
    // which the area filter rejects. No detections, no panic.
    let found = det.process(&black_frame(W, H, 6), &cfg).unwrap();
    assert!(found.objects.is_empty());
}
