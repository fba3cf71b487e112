//! Owned image frames as acquired from a camera or a movie file.
//!
//! A [Frame] carries a strided pixel buffer together with both timestamps
//! the rest of the pipeline needs: a wall-clock stamp for logging and
//! recording, and a monotonic nanosecond counter for rate estimation.

use chrono::{DateTime, Utc};
use machine_vision_formats as formats;

pub use formats::PixFmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("zero-byte image buffer")]
    EmptyBuffer,
    #[error("zero-sized image ({width}x{height})")]
    ZeroDimension { width: u32, height: u32 },
    #[error("stride {stride} too small for width {width} ({pixel_format})")]
    StrideTooSmall {
        stride: u32,
        width: u32,
        pixel_format: PixFmt,
    },
    #[error("buffer holds {actual} bytes, {height} rows of stride {stride} need {expected}")]
    BufferTooSmall {
        actual: usize,
        expected: usize,
        height: u32,
        stride: u32,
    },
    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(PixFmt),
}

/// One captured image.
///
/// The buffer is row-major with `stride` bytes per row; `stride` may exceed
/// the packed row width. Cloning is a deep copy and is only done where a
/// component must outlive the processing tick that handed it the frame
/// (e.g. the recorder tap).
#[derive(Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    stride: u32,
    image_data: Vec<u8>,
    pixel_format: PixFmt,
    host_timestamp: DateTime<Utc>,
    monotonic_ns: u64,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("pixel_format", &self.pixel_format)
            .field("monotonic_ns", &self.monotonic_ns)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// Validate geometry and wrap an existing buffer.
    pub fn new(
        width: u32,
        height: u32,
        stride: u32,
        image_data: Vec<u8>,
        pixel_format: PixFmt,
        host_timestamp: DateTime<Utc>,
        monotonic_ns: u64,
    ) -> Result<Self> {
        if image_data.is_empty() {
            return Err(Error::EmptyBuffer);
        }
        if width == 0 || height == 0 {
            return Err(Error::ZeroDimension { width, height });
        }
        let min_stride = width as usize * pixel_format.bits_per_pixel() as usize / 8;
        if (stride as usize) < min_stride {
            return Err(Error::StrideTooSmall {
                stride,
                width,
                pixel_format,
            });
        }
        // The final row may be trimmed to the packed width.
        let expected = stride as usize * (height as usize - 1) + min_stride;
        if image_data.len() < expected {
            return Err(Error::BufferTooSmall {
                actual: image_data.len(),
                expected,
                height,
                stride,
            });
        }
        Ok(Self {
            width,
            height,
            stride,
            image_data,
            pixel_format,
            host_timestamp,
            monotonic_ns,
        })
    }

    /// Packed Mono8 frame (stride equals width).
    pub fn mono8(
        width: u32,
        height: u32,
        image_data: Vec<u8>,
        host_timestamp: DateTime<Utc>,
        monotonic_ns: u64,
    ) -> Result<Self> {
        Self::new(
            width,
            height,
            width,
            image_data,
            PixFmt::Mono8,
            host_timestamp,
            monotonic_ns,
        )
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn pixel_format(&self) -> PixFmt {
        self.pixel_format
    }

    pub fn image_data(&self) -> &[u8] {
        &self.image_data
    }

    pub fn host_timestamp(&self) -> DateTime<Utc> {
        self.host_timestamp
    }

    pub fn monotonic_ns(&self) -> u64 {
        self.monotonic_ns
    }

    /// Number of channels implied by the pixel format.
    pub fn channels(&self) -> u8 {
        (self.pixel_format.bits_per_pixel() / 8) as u8
    }

    /// One image row, trimmed from stride to the packed pixel width.
    pub fn row(&self, y: u32) -> &[u8] {
        debug_assert!(y < self.height);
        let row_bytes = self.width as usize * self.pixel_format.bits_per_pixel() as usize / 8;
        let start = y as usize * self.stride as usize;
        &self.image_data[start..start + row_bytes]
    }

    pub fn into_data(self) -> Vec<u8> {
        self.image_data
    }
}

impl PartialEq for Frame {
    /// Pixel-wise comparison; padding bytes beyond the packed row width are
    /// ignored, as are the timestamps.
    fn eq(&self, other: &Frame) -> bool {
        if self.width != other.width
            || self.height != other.height
            || self.pixel_format != other.pixel_format
        {
            return false;
        }
        (0..self.height).all(|y| self.row(y) == other.row(y))
    }
}

fn _test_frame_is_send() {
    // Compile-time test to ensure Frame implements Send trait.
    fn implements<T: Send>() {}
    implements::<Frame>();
}
