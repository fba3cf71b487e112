//! Packed single-channel image operations.
//!
//! Everything here works on plain `Vec<u8>` buffers with stride equal to
//! width. Loops are written over row slices so the optimizer can vectorize
//! them; none of these functions allocate except for their output image.

use hopper_frame::{Frame, PixFmt};

use crate::{Error, Result, Roi};

/// Packed 8-bit single-channel image. Masks use 0/255 values.
#[derive(Clone, PartialEq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl std::fmt::Debug for GrayImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrayImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set_pixel(&mut self, x: usize, y: usize, value: u8) {
        self.data[y * self.width + x] = value;
    }

    pub fn row(&self, y: usize) -> &[u8] {
        &self.data[y * self.width..(y + 1) * self.width]
    }

    /// Crop the ROI out of a frame, converting to single channel if needed.
    pub fn from_frame_roi(frame: &Frame, roi: &Roi) -> Result<Self> {
        let (w, h) = (roi.w as usize, roi.h as usize);
        let mut data = Vec::with_capacity(w * h);
        match frame.pixel_format() {
            PixFmt::Mono8 => {
                for y in 0..h {
                    let row = frame.row(roi.y + y as u32);
                    data.extend_from_slice(&row[roi.x as usize..roi.x as usize + w]);
                }
            }
            PixFmt::RGB8 => {
                // Integer rec.601 luma.
                for y in 0..h {
                    let row = frame.row(roi.y + y as u32);
                    for x in 0..w {
                        let off = (roi.x as usize + x) * 3;
                        let (r, g, b) = (row[off] as u32, row[off + 1] as u32, row[off + 2] as u32);
                        data.push(((77 * r + 150 * g + 29 * b) >> 8) as u8);
                    }
                }
            }
            other => return Err(Error::UnsupportedPixelFormat(other)),
        }
        Ok(Self {
            width: w,
            height: h,
            data,
        })
    }
}

/// Separable Gaussian blur with an odd kernel size.
///
/// Sigma follows the usual size heuristic so a single knob controls both.
pub fn gaussian_blur(src: &GrayImage, kernel_size: usize) -> GrayImage {
    debug_assert!(kernel_size % 2 == 1 && kernel_size > 1);
    let sigma = 0.3 * ((kernel_size as f64 - 1.0) * 0.5 - 1.0) + 0.8;
    let half = kernel_size / 2;
    let kernel: Vec<f64> = (0..kernel_size)
        .map(|i| {
            let d = i as f64 - half as f64;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let norm: f64 = kernel.iter().sum();

    let (w, h) = (src.width, src.height);
    let clamp_x = |x: isize| x.clamp(0, w as isize - 1) as usize;
    let clamp_y = |y: isize| y.clamp(0, h as isize - 1) as usize;

    // Horizontal pass into f64, vertical pass back to u8.
    let mut tmp = vec![0f64; w * h];
    for y in 0..h {
        let row = src.row(y);
        for x in 0..w {
            let mut acc = 0.0;
            for (i, k) in kernel.iter().enumerate() {
                let sx = clamp_x(x as isize + i as isize - half as isize);
                acc += *k * row[sx] as f64;
            }
            tmp[y * w + x] = acc / norm;
        }
    }
    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0.0;
            for (i, k) in kernel.iter().enumerate() {
                let sy = clamp_y(y as isize + i as isize - half as isize);
                acc += *k * tmp[sy * w + x];
            }
            out.data[y * w + x] = (acc / norm).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Fixed binary threshold: strictly-above pixels become 255.
pub fn threshold_binary(src: &GrayImage, threshold: u8) -> GrayImage {
    let mut out = GrayImage::new(src.width, src.height);
    for (dst, &px) in out.data.iter_mut().zip(src.data.iter()) {
        *dst = if px > threshold { 255 } else { 0 };
    }
    out
}

/// Otsu's threshold: maximize inter-class variance over the histogram.
pub fn otsu_threshold(src: &GrayImage) -> u8 {
    let mut hist = [0u64; 256];
    for &px in &src.data {
        hist[px as usize] += 1;
    }
    let total = src.data.len() as f64;
    let sum_all: f64 = hist
        .iter()
        .enumerate()
        .map(|(v, &n)| v as f64 * n as f64)
        .sum();

    let mut best = 0u8;
    let mut best_var = 0.0f64;
    let mut w0 = 0.0f64;
    let mut sum0 = 0.0f64;
    for t in 0..256usize {
        w0 += hist[t] as f64;
        if w0 == 0.0 {
            continue;
        }
        let w1 = total - w0;
        if w1 == 0.0 {
            break;
        }
        sum0 += t as f64 * hist[t] as f64;
        let mu0 = sum0 / w0;
        let mu1 = (sum_all - sum0) / w1;
        let between = w0 * w1 * (mu0 - mu1) * (mu0 - mu1);
        if between > best_var {
            best_var = between;
            best = t as u8;
        }
    }
    best
}

/// Pixel-wise OR of three 0/255 masks.
pub fn or3(a: &GrayImage, b: &GrayImage, c: &GrayImage) -> GrayImage {
    debug_assert!(a.width == b.width && b.width == c.width);
    debug_assert!(a.height == b.height && b.height == c.height);
    let mut out = GrayImage::new(a.width, a.height);
    for i in 0..out.data.len() {
        out.data[i] = a.data[i] | b.data[i] | c.data[i];
    }
    out
}

fn square_morph(src: &GrayImage, kernel_size: usize, take_max: bool) -> GrayImage {
    let half = (kernel_size / 2) as isize;
    let (w, h) = (src.width as isize, src.height as isize);
    let mut out = GrayImage::new(src.width, src.height);
    for y in 0..h {
        for x in 0..w {
            let mut acc: u8 = if take_max { 0 } else { 255 };
            for ky in -half..=half {
                for kx in -half..=half {
                    let sx = (x + kx).clamp(0, w - 1) as usize;
                    let sy = (y + ky).clamp(0, h - 1) as usize;
                    let px = src.pixel(sx, sy);
                    acc = if take_max { acc.max(px) } else { acc.min(px) };
                }
            }
            out.set_pixel(x as usize, y as usize, acc);
        }
    }
    out
}

pub fn dilate(src: &GrayImage, kernel_size: usize, iterations: usize) -> GrayImage {
    let mut out = src.clone();
    for _ in 0..iterations {
        out = square_morph(&out, kernel_size, true);
    }
    out
}

pub fn erode(src: &GrayImage, kernel_size: usize, iterations: usize) -> GrayImage {
    let mut out = src.clone();
    for _ in 0..iterations {
        out = square_morph(&out, kernel_size, false);
    }
    out
}

/// Dilate then erode: bridges small gaps.
pub fn close(src: &GrayImage, kernel_size: usize) -> GrayImage {
    erode(&dilate(src, kernel_size, 1), kernel_size, 1)
}

/// Erode then dilate: removes speckle.
pub fn open(src: &GrayImage, kernel_size: usize, iterations: usize) -> GrayImage {
    dilate(&erode(src, kernel_size, iterations), kernel_size, iterations)
}

/// Draw a 1 px rectangle outline, clipped to the image.
pub fn draw_rect(im: &mut GrayImage, x: usize, y: usize, w: usize, h: usize, value: u8) {
    if w == 0 || h == 0 {
        return;
    }
    let x1 = (x + w - 1).min(im.width - 1);
    let y1 = (y + h - 1).min(im.height - 1);
    for xx in x..=x1 {
        im.set_pixel(xx, y, value);
        im.set_pixel(xx, y1, value);
    }
    for yy in y..=y1 {
        im.set_pixel(x, yy, value);
        im.set_pixel(x1, yy, value);
    }
}
