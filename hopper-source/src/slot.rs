use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use hopper_frame::Frame;

/// Single-slot most-recent-frame handoff between the acquisition thread
/// and the processing thread.
///
/// The acquisition side overwrites an undrained slot (latest-image-only),
/// which bounds memory at one frame and latency at one frame interval.
pub struct FrameSlot {
    slot: Mutex<Option<Frame>>,
    cond: Condvar,
}

impl Default for FrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSlot {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Publish a frame, replacing any undrained one.
    ///
    /// Returns `true` when a previous frame was overwritten.
    pub fn publish(&self, frame: Frame) -> bool {
        let mut guard = self.slot.lock();
        let dropped = guard.replace(frame).is_some();
        drop(guard);
        self.cond.notify_one();
        dropped
    }

    /// Take the current frame, blocking up to `timeout` for one to arrive.
    pub fn take_timeout(&self, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.slot.lock();
        loop {
            if let Some(frame) = guard.take() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if self.cond.wait_for(&mut guard, deadline - now).timed_out() {
                return guard.take();
            }
        }
    }

    /// Non-blocking take.
    pub fn try_take(&self) -> Option<Frame> {
        self.slot.lock().take()
    }

    pub fn clear(&self) {
        self.slot.lock().take();
    }
}
