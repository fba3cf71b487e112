//! Per-pixel Gaussian-mixture background model (Zivkovic's adaptive MOG).
//!
//! Each pixel carries up to [MAX_MODES] weighted Gaussians sorted by
//! weight. A pixel is background when it matches one of the heaviest modes
//! whose cumulative weight stays below [BACKGROUND_RATIO]; unmatched
//! pixels spawn a new mode and come out as foreground. Shadow detection is
//! intentionally absent.

use crate::imops::GrayImage;

const MAX_MODES: usize = 5;
const BACKGROUND_RATIO: f32 = 0.9;
const VAR_INIT: f32 = 15.0;
const VAR_MIN: f32 = 4.0;
const VAR_MAX: f32 = 5.0 * VAR_INIT;
/// Complexity-reduction prior: negative weight drift that starves modes
/// which stop receiving support.
const COMPLEXITY_PRUNE: f32 = 0.05;

#[derive(Debug)]
pub struct BackgroundModel {
    width: usize,
    height: usize,
    history: u32,
    var_threshold: f32,
    weights: Vec<f32>,
    means: Vec<f32>,
    vars: Vec<f32>,
    n_modes: Vec<u8>,
    frames_seen: u32,
}

impl BackgroundModel {
    pub fn new(width: usize, height: usize, history: u32, var_threshold: u32) -> Self {
        let n = width * height * MAX_MODES;
        Self {
            width,
            height,
            history: history.max(1),
            var_threshold: var_threshold.max(1) as f32,
            weights: vec![0.0; n],
            means: vec![0.0; n],
            vars: vec![0.0; n],
            n_modes: vec![0; width * height],
            frames_seen: 0,
        }
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    pub fn params(&self) -> (u32, u32) {
        (self.history, self.var_threshold as u32)
    }

    pub fn reset(&mut self) {
        self.weights.fill(0.0);
        self.means.fill(0.0);
        self.vars.fill(0.0);
        self.n_modes.fill(0);
        self.frames_seen = 0;
    }

    /// Classify `src` into `fg` (0 background, 255 foreground) and update
    /// the model.
    ///
    /// A positive `learning_rate` is used as-is; zero selects the
    /// 1/min(frames, history) warm-up schedule.
    pub fn apply(&mut self, src: &GrayImage, fg: &mut GrayImage, learning_rate: f64) {
        debug_assert_eq!((src.width, src.height), (self.width, self.height));
        self.frames_seen = self.frames_seen.saturating_add(1);
        let alpha = if learning_rate > 0.0 {
            learning_rate as f32
        } else {
            1.0 / self.frames_seen.min(self.history) as f32
        };
        let alpha_prune = alpha * COMPLEXITY_PRUNE;

        for (idx, &px) in src.data.iter().enumerate() {
            let value = px as f32;
            let base = idx * MAX_MODES;
            let mut n_modes = self.n_modes[idx] as usize;

            let mut fitted = false;
            let mut is_background = false;
            let mut cum_weight = 0.0f32;
            let mut m = 0;
            while m < n_modes {
                let slot = base + m;
                let mut weight = (1.0 - alpha) * self.weights[slot] - alpha_prune;
                if !fitted {
                    let d = value - self.means[slot];
                    if d * d < self.var_threshold * self.vars[slot] {
                        fitted = true;
                        if cum_weight < BACKGROUND_RATIO {
                            is_background = true;
                        }
                        weight += alpha;
                        let k = alpha / weight.max(1e-6);
                        self.means[slot] += k * d;
                        self.vars[slot] =
                            (self.vars[slot] + k * (d * d - self.vars[slot])).clamp(VAR_MIN, VAR_MAX);
                    }
                }
                if weight < alpha_prune {
                    // Mode starved out: drop it, shifting the tail down.
                    for j in m..n_modes - 1 {
                        self.weights[base + j] = self.weights[base + j + 1];
                        self.means[base + j] = self.means[base + j + 1];
                        self.vars[base + j] = self.vars[base + j + 1];
                    }
                    n_modes -= 1;
                    continue;
                }
                self.weights[slot] = weight;
                cum_weight += weight;
                m += 1;
            }

            if !fitted {
                if n_modes < MAX_MODES {
                    n_modes += 1;
                }
                let slot = base + n_modes - 1;
                self.weights[slot] = if n_modes == 1 { 1.0 } else { alpha };
                self.means[slot] = value;
                self.vars[slot] = VAR_INIT;
            }

            // Renormalize and restore the weight ordering (n_modes <= 5, so
            // insertion sort is the right tool).
            let total: f32 = self.weights[base..base + n_modes].iter().sum();
            if total > 0.0 {
                for w in &mut self.weights[base..base + n_modes] {
                    *w /= total;
                }
            }
            for i in 1..n_modes {
                let mut j = i;
                while j > 0 && self.weights[base + j] > self.weights[base + j - 1] {
                    self.weights.swap(base + j, base + j - 1);
                    self.means.swap(base + j, base + j - 1);
                    self.vars.swap(base + j, base + j - 1);
                    j -= 1;
                }
            }
            self.n_modes[idx] = n_modes as u8;

            fg.data[idx] = if is_background { 0 } else { 255 };
        }
    }
}
