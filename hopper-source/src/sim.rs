//! Simulated capture device: an endless drop test paced in real time.
//!
//! Stands in for a vendor SDK wherever no hardware is attached — the
//! demo binary drives it through [CameraSource](crate::CameraSource)
//! exactly as it would a real camera.

use std::time::{Duration, Instant};

use chrono::Utc;

use hopper_frame::{Frame, PixFmt};

use crate::camera::{DeviceInfo, GrabSettings, SourceDriver};
use crate::{Error, Result};

/// Scene geometry for the simulated feeder.
#[derive(Debug, Clone)]
pub struct SimScene {
    pub width: u32,
    pub height: u32,
    pub part_size: u32,
    /// Vertical speed in px/frame.
    pub fall_step: u32,
    /// Blank frames between parts.
    pub gap_frames: u32,
}

impl Default for SimScene {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            part_size: 10,
            fall_step: 6,
            gap_frames: 10,
        }
    }
}

/// Software device dropping one part after another, forever.
pub struct SimDriver {
    scene: SimScene,
    fps: f64,
    opened: bool,
    acquiring: bool,
    frame_n: u64,
    acquisition_start: Option<Instant>,
}

impl SimDriver {
    pub fn new(scene: SimScene, fps: f64) -> Self {
        Self {
            scene,
            fps,
            opened: false,
            acquiring: false,
            frame_n: 0,
            acquisition_start: None,
        }
    }

    fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1.0))
    }

    fn render(&self, frame_n: u64) -> Vec<u8> {
        let s = &self.scene;
        let mut buf = vec![0u8; (s.width * s.height) as usize];
        let y_start = 20u64;
        let y_end = (s.height - s.part_size - 10) as u64;
        let steps = (y_end - y_start) / s.fall_step as u64 + 1;
        let cycle = steps + s.gap_frames as u64;
        // Blank lead-in so the background model can settle.
        let warmup = s.gap_frames.max(10) as u64;
        if frame_n < warmup {
            return buf;
        }
        let n = frame_n - warmup;
        let step_in_cycle = n % cycle;
        if step_in_cycle >= steps {
            return buf;
        }
        let part = n / cycle;
        let x = 40 + (part as u32 * 37) % (s.width - 80);
        let y = (y_start + step_in_cycle * s.fall_step as u64) as u32;
        for yy in y..y + s.part_size {
            for xx in x..x + s.part_size {
                buf[(yy * s.width + xx) as usize] = 255;
            }
        }
        buf
    }
}

impl SourceDriver for SimDriver {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            index: 0,
            model: "sim-feeder".to_string(),
            serial: "0000".to_string(),
            name: "simulated feeder camera".to_string(),
        }])
    }

    fn open(&mut self, index: usize) -> Result<DeviceInfo> {
        if index != 0 {
            return Err(Error::DeviceNotFound(index));
        }
        if self.opened {
            return Err(Error::DeviceBusy("sim-feeder already open".to_string()));
        }
        self.opened = true;
        let mut infos = self.enumerate()?;
        Ok(infos.remove(0))
    }

    fn configure(&mut self, settings: &GrabSettings) -> Result<()> {
        if settings.pixel_format != PixFmt::Mono8 {
            return Err(Error::Driver(format!(
                "sim-feeder only provides Mono8, not {}",
                settings.pixel_format
            )));
        }
        self.fps = settings.target_fps;
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<()> {
        self.acquiring = true;
        self.frame_n = 0;
        self.acquisition_start = Some(Instant::now());
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> Result<Frame> {
        let start = match (self.acquiring, self.acquisition_start) {
            (true, Some(start)) => start,
            _ => return Err(Error::GrabFatal("not acquiring".to_string())),
        };
        let interval = self.interval();
        let due = start + interval * self.frame_n as u32;
        let now = Instant::now();
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Err(Error::Timeout);
            }
            std::thread::sleep(wait);
        }
        let buf = self.render(self.frame_n);
        let monotonic_ns = self.frame_n * interval.as_nanos() as u64;
        let frame = Frame::mono8(
            self.scene.width,
            self.scene.height,
            buf,
            Utc::now(),
            monotonic_ns,
        )?;
        self.frame_n += 1;
        Ok(frame)
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        self.acquiring = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.opened = false;
        self.acquiring = false;
        Ok(())
    }
}
