//! Synthetic drop-test movies: parts falling one after another through
//! the frame, for demos and pipeline tests.

use std::path::Path;

use chrono::DateTime;

use hopper_frame::{Frame, PixFmt};
use hopper_rec::{Error, RawMovieWriter, Result};

/// Geometry of a generated drop test.
#[derive(Debug, Clone)]
pub struct SynthSpec {
    pub width: u32,
    pub height: u32,
    /// Parts dropped, one at a time.
    pub n_parts: u32,
    /// Edge length of the square part.
    pub part_size: u32,
    /// Vertical speed in px/frame.
    pub fall_step: u32,
    /// Blank frames before the first part and between parts.
    pub gap_frames: u32,
    pub fps: f64,
}

impl Default for SynthSpec {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            n_parts: 6,
            part_size: 10,
            fall_step: 6,
            gap_frames: 10,
            fps: 60.0,
        }
    }
}

/// Write a movie of `spec.n_parts` squares falling past the frame center.
///
/// Parts enter near the top, leave near the bottom, and are horizontally
/// staggered so consecutive parts do not share an x position. Returns the
/// number of frames written.
pub fn write_drop_movie<P: AsRef<Path>>(path: P, spec: &SynthSpec) -> Result<u64> {
    let writer = RawMovieWriter::create(path, spec.width, spec.height, PixFmt::Mono8, spec.fps)?;
    let dt_ns = (1e9 / spec.fps) as u64;
    let mut n: u64 = 0;
    let epoch = DateTime::from_timestamp(1_431_648_000, 0).ok_or(Error::BadTimestamp)?;

    let write = |buf: Vec<u8>, n: &mut u64| -> Result<()> {
        let stamp = epoch + chrono::Duration::milliseconds((*n * dt_ns / 1_000_000) as i64);
        let frame = Frame::mono8(spec.width, spec.height, buf, stamp, *n * dt_ns)?;
        writer.write_frame(&frame)?;
        *n += 1;
        Ok(())
    };

    let blank = || vec![0u8; (spec.width * spec.height) as usize];

    // Let the background model settle before the first part.
    for _ in 0..spec.gap_frames.max(10) {
        write(blank(), &mut n)?;
    }

    let y_start = 20;
    let y_end = spec.height - spec.part_size - 10;
    for part in 0..spec.n_parts {
        let x = 40 + (part * 37) % (spec.width - 80);
        let mut y = y_start;
        while y <= y_end {
            let mut buf = blank();
            for yy in y..y + spec.part_size {
                for xx in x..x + spec.part_size {
                    buf[(yy * spec.width + xx) as usize] = 255;
                }
            }
            write(buf, &mut n)?;
            y += spec.fall_step;
        }
        for _ in 0..spec.gap_frames {
            write(blank(), &mut n)?;
        }
    }

    writer.finish()?;
    Ok(n)
}
