//! Raw-movie container used by the recorder and for file playback.
//!
//! The format is deliberately simple: a fixed little-endian header (magic,
//! version, pixel format, dimensions, nominal frame rate) followed by
//! fixed-size frame records of `(monotonic_ns, wall_ms, packed pixels)`.
//! Fixed records make seeking to an arbitrary frame index an O(1) file
//! seek, which the file source relies on for scrubbing.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use hopper_frame::{Frame, PixFmt};

pub type Result<T> = std::result::Result<T, Error>;

const MAGIC: &[u8; 4] = b"HPRV";
const FORMAT_VERSION: u32 = 1;
const HEADER_BYTES: u64 = 28;
const RECORD_STAMP_BYTES: u64 = 16;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unexpected frame size {got_width}x{got_height}, container is {width}x{height}")]
    UnexpectedSize {
        got_width: u32,
        got_height: u32,
        width: u32,
        height: u32,
    },
    #[error("unexpected pixel format {0} (container holds {1})")]
    UnexpectedEncoding(PixFmt, PixFmt),
    #[error("unimplemented pixel format {0}")]
    UnimplementedPixelFormat(PixFmt),
    #[error("not a hopper raw movie")]
    BadMagic,
    #[error("unimplemented container version {0}")]
    UnimplementedVersion(u32),
    #[error("unknown pixel format code {0}")]
    UnknownPixelFormatCode(u32),
    #[error("reading past the end of the file")]
    ReadingPastEnd,
    #[error("timestamp out of range")]
    BadTimestamp,
    #[error("already closed")]
    AlreadyClosed,
    #[error("{source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Frame {
        #[from]
        source: hopper_frame::Error,
    },
}

fn pixfmt_code(pixfmt: PixFmt) -> Result<u32> {
    match pixfmt {
        PixFmt::Mono8 => Ok(1),
        PixFmt::RGB8 => Ok(2),
        other => Err(Error::UnimplementedPixelFormat(other)),
    }
}

fn pixfmt_from_code(code: u32) -> Result<PixFmt> {
    match code {
        1 => Ok(PixFmt::Mono8),
        2 => Ok(PixFmt::RGB8),
        other => Err(Error::UnknownPixelFormatCode(other)),
    }
}

fn packed_row_bytes(width: u32, pixfmt: PixFmt) -> usize {
    width as usize * pixfmt.bits_per_pixel() as usize / 8
}

// ---------------------------
// writer

struct WriterInner {
    fd: BufWriter<File>,
    n_frames: u64,
    closed: bool,
}

/// Append-only movie writer.
///
/// Thread safe: writes serialize on an internal mutex, and every accepted
/// frame is written — there is no drop policy. Callers that cannot afford
/// the file-system cost on their thread must not record.
pub struct RawMovieWriter {
    width: u32,
    height: u32,
    pixel_format: PixFmt,
    inner: Mutex<WriterInner>,
}

impl RawMovieWriter {
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: u32,
        height: u32,
        pixel_format: PixFmt,
        nominal_fps: f64,
    ) -> Result<Self> {
        let mut fd = BufWriter::new(File::create(path)?);
        fd.write_all(MAGIC)?;
        fd.write_u32::<LittleEndian>(FORMAT_VERSION)?;
        fd.write_u32::<LittleEndian>(pixfmt_code(pixel_format)?)?;
        fd.write_u32::<LittleEndian>(width)?;
        fd.write_u32::<LittleEndian>(height)?;
        fd.write_f64::<LittleEndian>(nominal_fps)?;
        Ok(Self {
            width,
            height,
            pixel_format,
            inner: Mutex::new(WriterInner {
                fd,
                n_frames: 0,
                closed: false,
            }),
        })
    }

    pub fn write_frame(&self, frame: &Frame) -> Result<()> {
        if frame.pixel_format() != self.pixel_format {
            return Err(Error::UnexpectedEncoding(
                frame.pixel_format(),
                self.pixel_format,
            ));
        }
        if frame.width() != self.width || frame.height() != self.height {
            return Err(Error::UnexpectedSize {
                got_width: frame.width(),
                got_height: frame.height(),
                width: self.width,
                height: self.height,
            });
        }
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::AlreadyClosed);
        }
        inner.fd.write_u64::<LittleEndian>(frame.monotonic_ns())?;
        inner
            .fd
            .write_i64::<LittleEndian>(frame.host_timestamp().timestamp_millis())?;
        for y in 0..frame.height() {
            inner.fd.write_all(frame.row(y))?;
        }
        inner.n_frames += 1;
        Ok(())
    }

    pub fn n_frames(&self) -> u64 {
        self.inner.lock().n_frames
    }

    /// Flush and refuse further writes.
    pub fn finish(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::AlreadyClosed);
        }
        inner.fd.flush()?;
        inner.closed = true;
        Ok(inner.n_frames)
    }
}

// ---------------------------
// reader

/// Random-access movie reader.
pub struct RawMovieReader {
    fd: BufReader<File>,
    width: u32,
    height: u32,
    pixel_format: PixFmt,
    nominal_fps: f64,
    n_frames: u64,
    next_index: u64,
}

impl RawMovieReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut fd = BufReader::new(file);

        let mut magic = [0u8; 4];
        fd.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(Error::BadMagic);
        }
        let version = fd.read_u32::<LittleEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::UnimplementedVersion(version));
        }
        let pixel_format = pixfmt_from_code(fd.read_u32::<LittleEndian>()?)?;
        let width = fd.read_u32::<LittleEndian>()?;
        let height = fd.read_u32::<LittleEndian>()?;
        let nominal_fps = fd.read_f64::<LittleEndian>()?;

        let record_bytes =
            RECORD_STAMP_BYTES + (packed_row_bytes(width, pixel_format) * height as usize) as u64;
        let n_frames = file_len.saturating_sub(HEADER_BYTES) / record_bytes;

        Ok(Self {
            fd,
            width,
            height,
            pixel_format,
            nominal_fps,
            n_frames,
            next_index: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixFmt {
        self.pixel_format
    }

    pub fn nominal_fps(&self) -> f64 {
        self.nominal_fps
    }

    pub fn n_frames(&self) -> u64 {
        self.n_frames
    }

    fn record_bytes(&self) -> u64 {
        RECORD_STAMP_BYTES
            + (packed_row_bytes(self.width, self.pixel_format) * self.height as usize) as u64
    }

    /// Read the frame at `index`; subsequent [next_frame](Self::next_frame)
    /// calls continue from there.
    pub fn frame(&mut self, index: u64) -> Result<Frame> {
        if index >= self.n_frames {
            return Err(Error::ReadingPastEnd);
        }
        self.fd
            .seek(SeekFrom::Start(HEADER_BYTES + index * self.record_bytes()))?;
        self.next_index = index;
        match self.next_frame() {
            Some(res) => res,
            None => Err(Error::ReadingPastEnd),
        }
    }

    /// Sequential read; `None` at end of file.
    pub fn next_frame(&mut self) -> Option<Result<Frame>> {
        if self.next_index >= self.n_frames {
            return None;
        }
        Some(self.read_record())
    }

    fn read_record(&mut self) -> Result<Frame> {
        let monotonic_ns = self.fd.read_u64::<LittleEndian>()?;
        let wall_ms = self.fd.read_i64::<LittleEndian>()?;
        let host_timestamp: DateTime<Utc> =
            DateTime::from_timestamp_millis(wall_ms).ok_or(Error::BadTimestamp)?;
        let n_bytes = packed_row_bytes(self.width, self.pixel_format) * self.height as usize;
        let mut buf = vec![0u8; n_bytes];
        self.fd.read_exact(&mut buf)?;
        self.next_index += 1;
        let stride = packed_row_bytes(self.width, self.pixel_format) as u32;
        Ok(Frame::new(
            self.width,
            self.height,
            stride,
            buf,
            self.pixel_format,
            host_timestamp,
            monotonic_ns,
        )?)
    }
}
