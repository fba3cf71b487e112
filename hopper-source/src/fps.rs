use std::collections::VecDeque;

const WINDOW: usize = 60;

/// Sliding-window frame-rate estimate over monotonic frame stamps.
#[derive(Debug, Default)]
pub struct FpsEstimator {
    stamps: VecDeque<u64>,
}

impl FpsEstimator {
    pub fn new() -> Self {
        Self {
            stamps: VecDeque::with_capacity(WINDOW),
        }
    }

    pub fn tick(&mut self, monotonic_ns: u64) {
        if self.stamps.len() == WINDOW {
            self.stamps.pop_front();
        }
        self.stamps.push_back(monotonic_ns);
    }

    /// Frames per second over the current window; `None` before two frames.
    pub fn current(&self) -> Option<f64> {
        let first = *self.stamps.front()?;
        let last = *self.stamps.back()?;
        if last <= first {
            return None;
        }
        let span_s = (last - first) as f64 * 1e-9;
        Some(self.stamps.len() as f64 / span_s)
    }

    pub fn reset(&mut self) {
        self.stamps.clear();
    }
}
