//! Vibrator actuator contract and the simulated device.
//!
//! Hardware and simulated feeders speak the same message protocol and
//! implement the same [Vibrator] trait; the packaging controller drives a
//! [VibratorPair] and never knows which variant sits behind it.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, Error>;

/// Communication protocol version.
pub const COMM_VERSION: u16 = 1;
/// Largest accepted speed command.
pub const MAX_SPEED_PERCENT: u8 = 100;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("speed {0} out of range 0..=100")]
    SpeedOutOfRange(u8),
    #[error("actuator refused: {0}")]
    Refused(String),
    #[error("actuator {which} failed: {source}")]
    Channel {
        which: &'static str,
        #[source]
        source: Box<Error>,
    },
}

/// Discrete feeder speeds of the packaging schedule, fastest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SpeedLevel {
    Full,
    Medium,
    Slow,
    Creep,
    Stop,
}

impl std::fmt::Display for SpeedLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpeedLevel::Full => "FULL",
            SpeedLevel::Medium => "MEDIUM",
            SpeedLevel::Slow => "SLOW",
            SpeedLevel::Creep => "CREEP",
            SpeedLevel::Stop => "STOP",
        };
        f.write_str(name)
    }
}

/// Messages sent to a vibrator channel.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub enum ToDevice {
    Start,
    Stop,
    SetSpeed(u8),
    VersionRequest,
}

/// Messages received from a vibrator channel.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub enum FromDevice {
    Ack,
    Refused,
    State(ChannelState),
    VersionResponse(u16),
}

/// Reported state of one vibrator channel.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
pub struct ChannelState {
    pub running: bool,
    pub speed_percent: u8,
}

/// Actuator events mirrored to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VibratorEvent {
    RunningChanged(bool),
    SpeedChanged(u8),
    Error(String),
}

/// The actuator capability.
pub trait Vibrator: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    fn set_speed_percent(&mut self, percent: u8) -> Result<()>;
    fn is_running(&self) -> bool;
    fn speed_percent(&self) -> u8;
    /// Drain events accumulated since the last call.
    fn take_events(&mut self) -> Vec<VibratorEvent>;
}

/// In-process vibrator that answers the device protocol directly.
///
/// Tests script refusals through [refuse_next](Self::refuse_next) to
/// exercise the controller's retry path.
pub struct SimVibrator {
    state: ChannelState,
    refuse_next: u32,
    events: Vec<VibratorEvent>,
}

impl Default for SimVibrator {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVibrator {
    pub fn new() -> Self {
        Self {
            state: ChannelState {
                running: false,
                speed_percent: 0,
            },
            refuse_next: 0,
            events: Vec::new(),
        }
    }

    /// Refuse the next `n` commands.
    pub fn refuse_next(&mut self, n: u32) {
        self.refuse_next = n;
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// The device side of the protocol.
    pub fn handle(&mut self, msg: ToDevice) -> FromDevice {
        if self.refuse_next > 0 {
            self.refuse_next -= 1;
            self.events
                .push(VibratorEvent::Error(format!("refused {msg:?}")));
            return FromDevice::Refused;
        }
        match msg {
            ToDevice::Start => {
                if !self.state.running {
                    self.state.running = true;
                    self.events.push(VibratorEvent::RunningChanged(true));
                }
                FromDevice::Ack
            }
            ToDevice::Stop => {
                if self.state.running {
                    self.state.running = false;
                    self.events.push(VibratorEvent::RunningChanged(false));
                }
                FromDevice::Ack
            }
            ToDevice::SetSpeed(percent) => {
                if self.state.speed_percent != percent {
                    self.state.speed_percent = percent;
                    self.events.push(VibratorEvent::SpeedChanged(percent));
                }
                FromDevice::Ack
            }
            ToDevice::VersionRequest => FromDevice::VersionResponse(COMM_VERSION),
        }
    }

    fn command(&mut self, msg: ToDevice) -> Result<()> {
        match self.handle(msg) {
            FromDevice::Ack | FromDevice::VersionResponse(_) | FromDevice::State(_) => Ok(()),
            FromDevice::Refused => Err(Error::Refused(format!("{msg:?}"))),
        }
    }
}

impl Vibrator for SimVibrator {
    fn start(&mut self) -> Result<()> {
        self.command(ToDevice::Start)
    }

    fn stop(&mut self) -> Result<()> {
        self.command(ToDevice::Stop)
    }

    fn set_speed_percent(&mut self, percent: u8) -> Result<()> {
        if percent > MAX_SPEED_PERCENT {
            return Err(Error::SpeedOutOfRange(percent));
        }
        self.command(ToDevice::SetSpeed(percent))
    }

    fn is_running(&self) -> bool {
        self.state.running
    }

    fn speed_percent(&self) -> u8 {
        self.state.speed_percent
    }

    fn take_events(&mut self) -> Vec<VibratorEvent> {
        std::mem::take(&mut self.events)
    }
}

/// The two feeder actuators, driven in lockstep.
///
/// Both channels always receive the same command; the pair reports
/// running only when both acknowledge. A failure on either channel is
/// surfaced but does not roll back the command already applied to the
/// other.
pub struct VibratorPair {
    primary: Box<dyn Vibrator>,
    secondary: Box<dyn Vibrator>,
}

impl VibratorPair {
    pub fn new(primary: Box<dyn Vibrator>, secondary: Box<dyn Vibrator>) -> Self {
        Self { primary, secondary }
    }

    pub fn simulated() -> Self {
        Self::new(Box::new(SimVibrator::new()), Box::new(SimVibrator::new()))
    }

    pub fn start(&mut self) -> Result<()> {
        self.both(|v| v.start())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.both(|v| v.stop())
    }

    pub fn set_speed_percent(&mut self, percent: u8) -> Result<()> {
        debug!("pair speed -> {percent}%");
        self.both(|v| v.set_speed_percent(percent))
    }

    pub fn is_running(&self) -> bool {
        self.primary.is_running() && self.secondary.is_running()
    }

    pub fn take_events(&mut self) -> Vec<VibratorEvent> {
        let mut events = self.primary.take_events();
        events.extend(self.secondary.take_events());
        events
    }

    fn both(&mut self, mut op: impl FnMut(&mut dyn Vibrator) -> Result<()>) -> Result<()> {
        // Issue to both channels before reporting either failure.
        let first = op(self.primary.as_mut()).map_err(|e| Error::Channel {
            which: "primary",
            source: Box::new(e),
        });
        let second = op(self.secondary.as_mut()).map_err(|e| Error::Channel {
            which: "secondary",
            source: Box::new(e),
        });
        if let Err(e) = &first {
            warn!("{e}");
        }
        if let Err(e) = &second {
            warn!("{e}");
        }
        first.and(second)
    }
}
