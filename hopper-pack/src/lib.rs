//! Packaging controller: maps batch progress to a discrete vibrator speed
//! and terminates the batch ahead of the nominal target.
//!
//! The speed is a pure function of `count / target` and the configured
//! thresholds — no hysteresis. Counts cannot regress within a batch, and a
//! reset re-enters the schedule from the top through `Idle`.

use serde::Serialize;
use tracing::{info, warn};

use hopper_config::PackagingConfig;
use hopper_vib::{SpeedLevel, VibratorPair};

/// Batch lifecycle. `Paused` is orthogonal and lives next to the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PackagingPhase {
    Idle,
    Running,
    Completed,
}

/// Controller outputs, emitted in occurrence order.
#[derive(Debug, Clone, PartialEq)]
pub enum PackagingEvent {
    SpeedChanged { level: SpeedLevel, percent: u8 },
    Completed,
    ActuatorError(String),
}

/// Snapshot of the batch for displays.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PackagingState {
    pub target: u32,
    pub current: u64,
    pub speed: Option<SpeedLevel>,
    pub completed: bool,
}

pub struct PackagingController {
    cfg: PackagingConfig,
    phase: PackagingPhase,
    paused: bool,
    current: u64,
    applied: Option<SpeedLevel>,
}

impl PackagingController {
    pub fn new(cfg: PackagingConfig) -> Self {
        Self {
            cfg,
            phase: PackagingPhase::Idle,
            paused: false,
            current: 0,
            applied: None,
        }
    }

    pub fn phase(&self) -> PackagingPhase {
        self.phase
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn state(&self) -> PackagingState {
        PackagingState {
            target: self.cfg.target_count,
            current: self.current,
            speed: self.applied,
            completed: self.phase == PackagingPhase::Completed,
        }
    }

    /// Swap in new thresholds; takes effect on the next count event.
    pub fn set_config(&mut self, cfg: PackagingConfig) {
        self.cfg = cfg;
    }

    /// The speed the schedule prescribes at `count` parts.
    pub fn speed_for(&self, count: u64) -> SpeedLevel {
        let target = self.cfg.target_count as u64;
        if count >= target.saturating_sub(self.cfg.advance_stop_count as u64) {
            return SpeedLevel::Stop;
        }
        let ratio = count as f64 / target as f64;
        if ratio < self.cfg.speed_full_threshold {
            SpeedLevel::Full
        } else if ratio < self.cfg.speed_medium_threshold {
            SpeedLevel::Medium
        } else if ratio < self.cfg.speed_slow_threshold {
            SpeedLevel::Slow
        } else {
            SpeedLevel::Creep
        }
    }

    fn percent_for(&self, level: SpeedLevel) -> u8 {
        match level {
            SpeedLevel::Full => self.cfg.vibrator_speed_full,
            SpeedLevel::Medium => self.cfg.vibrator_speed_medium,
            SpeedLevel::Slow => self.cfg.vibrator_speed_slow,
            SpeedLevel::Creep => self.cfg.vibrator_speed_creep,
            SpeedLevel::Stop => 0,
        }
    }

    /// Begin a batch: start both actuators at full speed.
    pub fn start(&mut self, pair: &mut VibratorPair) -> Vec<PackagingEvent> {
        let mut events = Vec::new();
        if self.phase != PackagingPhase::Idle {
            warn!("start ignored in phase {:?}", self.phase);
            return events;
        }
        info!("batch started, target {}", self.cfg.target_count);
        self.phase = PackagingPhase::Running;
        self.paused = false;
        self.current = 0;
        self.applied = None;
        if let Err(e) = pair.start() {
            events.push(PackagingEvent::ActuatorError(e.to_string()));
        }
        self.apply_speed(SpeedLevel::Full, pair, &mut events);
        events
    }

    /// Feed one count event into the schedule.
    pub fn on_count(&mut self, count: u64, pair: &mut VibratorPair) -> Vec<PackagingEvent> {
        let mut events = Vec::new();
        if self.phase != PackagingPhase::Running {
            return events;
        }
        self.current = count;
        if self.paused {
            return events;
        }

        let intended = self.speed_for(count);
        if intended == SpeedLevel::Stop {
            // Completion only follows a delivered STOP; a refused command
            // is retried on the next count event.
            if self.apply_speed(SpeedLevel::Stop, pair, &mut events) {
                if let Err(e) = pair.stop() {
                    events.push(PackagingEvent::ActuatorError(e.to_string()));
                }
                info!(
                    "batch completed at {count}/{} (advance stop {})",
                    self.cfg.target_count, self.cfg.advance_stop_count
                );
                self.phase = PackagingPhase::Completed;
                events.push(PackagingEvent::Completed);
            }
        } else if self.applied != Some(intended) {
            self.apply_speed(intended, pair, &mut events);
        }
        events
    }

    /// Halt the feeder, preserving count and speed for resume.
    pub fn pause(&mut self, pair: &mut VibratorPair) -> Vec<PackagingEvent> {
        let mut events = Vec::new();
        if self.phase != PackagingPhase::Running || self.paused {
            return events;
        }
        self.paused = true;
        if let Err(e) = pair.stop() {
            events.push(PackagingEvent::ActuatorError(e.to_string()));
        }
        events
    }

    /// Resume at the preserved speed.
    pub fn resume(&mut self, pair: &mut VibratorPair) -> Vec<PackagingEvent> {
        let mut events = Vec::new();
        if self.phase != PackagingPhase::Running || !self.paused {
            return events;
        }
        self.paused = false;
        if let Err(e) = pair.start() {
            events.push(PackagingEvent::ActuatorError(e.to_string()));
        }
        if let Some(level) = self.applied {
            if let Err(e) = pair.set_speed_percent(self.percent_for(level)) {
                events.push(PackagingEvent::ActuatorError(e.to_string()));
            }
        }
        events
    }

    /// Abort or conclude the batch and return to `Idle`.
    pub fn reset(&mut self, pair: &mut VibratorPair) {
        if let Err(e) = pair.set_speed_percent(0) {
            warn!("reset: speed zero refused: {e}");
        }
        if let Err(e) = pair.stop() {
            warn!("reset: stop refused: {e}");
        }
        self.phase = PackagingPhase::Idle;
        self.paused = false;
        self.current = 0;
        self.applied = None;
    }

    /// Returns true when the pair acknowledged the new level.
    fn apply_speed(
        &mut self,
        level: SpeedLevel,
        pair: &mut VibratorPair,
        events: &mut Vec<PackagingEvent>,
    ) -> bool {
        let percent = self.percent_for(level);
        match pair.set_speed_percent(percent) {
            Ok(()) => {
                self.applied = Some(level);
                events.push(PackagingEvent::SpeedChanged { level, percent });
                true
            }
            Err(e) => {
                warn!("speed {level} refused: {e}");
                events.push(PackagingEvent::ActuatorError(e.to_string()));
                false
            }
        }
    }
}
