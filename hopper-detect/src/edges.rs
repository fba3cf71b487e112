//! Canny edge detection: Sobel gradients, non-maximum suppression and
//! hysteresis. The magnitude is the L1 norm of the gradient, so the
//! configured thresholds are in those units.

use crate::imops::GrayImage;

const TAN_22_5: f32 = 0.414_213_56;
const TAN_67_5: f32 = 2.414_213_6;

#[derive(Clone, Copy, PartialEq)]
enum Sector {
    Horizontal, // gradient points left/right: compare left & right
    Vertical,
    DiagonalUp,   // gradient along y = x
    DiagonalDown, // gradient along y = -x
}

pub fn canny(src: &GrayImage, low: f32, high: f32) -> GrayImage {
    let (w, h) = (src.width, src.height);
    let mut out = GrayImage::new(w, h);
    if w < 3 || h < 3 {
        return out;
    }

    let mut mag = vec![0f32; w * h];
    let mut sector = vec![Sector::Horizontal; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let p = |dx: isize, dy: isize| {
                src.pixel((x as isize + dx) as usize, (y as isize + dy) as usize) as i32
            };
            let gx = (p(1, -1) + 2 * p(1, 0) + p(1, 1)) - (p(-1, -1) + 2 * p(-1, 0) + p(-1, 1));
            let gy = (p(-1, 1) + 2 * p(0, 1) + p(1, 1)) - (p(-1, -1) + 2 * p(0, -1) + p(1, -1));
            let idx = y * w + x;
            mag[idx] = (gx.abs() + gy.abs()) as f32;
            let (ax, ay) = (gx.abs() as f32, gy.abs() as f32);
            sector[idx] = if ay <= TAN_22_5 * ax {
                Sector::Horizontal
            } else if ay >= TAN_67_5 * ax {
                Sector::Vertical
            } else if (gx >= 0) == (gy >= 0) {
                Sector::DiagonalDown
            } else {
                Sector::DiagonalUp
            };
        }
    }

    // Non-maximum suppression against the two neighbors along the gradient.
    let mut strong: Vec<usize> = Vec::new();
    let mut kept = vec![0u8; w * h]; // 1 weak, 2 strong
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let idx = y * w + x;
            let m = mag[idx];
            if m < low {
                continue;
            }
            let (n1, n2) = match sector[idx] {
                Sector::Horizontal => (mag[idx - 1], mag[idx + 1]),
                Sector::Vertical => (mag[idx - w], mag[idx + w]),
                Sector::DiagonalDown => (mag[idx - w - 1], mag[idx + w + 1]),
                Sector::DiagonalUp => (mag[idx - w + 1], mag[idx + w - 1]),
            };
            if m < n1 || m < n2 {
                continue;
            }
            if m >= high {
                kept[idx] = 2;
                strong.push(idx);
            } else {
                kept[idx] = 1;
            }
        }
    }

    // Hysteresis: grow strong edges through connected weak pixels.
    let mut stack = strong;
    while let Some(idx) = stack.pop() {
        out.data[idx] = 255;
        let (x, y) = (idx % w, idx / w);
        for dy in -1isize..=1 {
            for dx in -1isize..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let (nx, ny) = (x as isize + dx, y as isize + dy);
                if nx < 0 || ny < 0 || nx >= w as isize || ny >= h as isize {
                    continue;
                }
                let nidx = ny as usize * w + nx as usize;
                if kept[nidx] == 1 && out.data[nidx] == 0 {
                    kept[nidx] = 2;
                    stack.push(nidx);
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_image_has_no_edges() {
        let mut im = GrayImage::new(16, 16);
        im.data.fill(77);
        let edges = canny(&im, 3.0, 10.0);
        assert!(edges.data.iter().all(|&v| v == 0));
    }

    #[test]
    fn step_edge_is_found_once() {
        // Vertical step at x = 8.
        let mut im = GrayImage::new(16, 16);
        for y in 0..16 {
            for x in 8..16 {
                im.set_pixel(x, y, 200);
            }
        }
        let edges = canny(&im, 3.0, 10.0);
        // Some edge response near the step on interior rows...
        for y in 2..14 {
            let hits: Vec<usize> = (0..16).filter(|&x| edges.pixel(x, y) == 255).collect();
            assert!(!hits.is_empty(), "row {y} has no edge");
            // ...and thinned to the step neighborhood, not smeared across.
            assert!(hits.iter().all(|&x| (6..=9).contains(&x)), "row {y}: {hits:?}");
        }
    }

    #[test]
    fn weak_edges_survive_only_when_connected_to_strong() {
        // Gradient-magnitude ramp would be contrived here; instead check
        // that a low-contrast isolated step below `high` is dropped.
        let mut im = GrayImage::new(16, 16);
        for y in 0..16 {
            for x in 8..16 {
                im.set_pixel(x, y, 2); // step of 2: |g| = 8 < high
            }
        }
        let edges = canny(&im, 3.0, 100.0);
        assert!(edges.data.iter().all(|&v| v == 0));
    }
}
