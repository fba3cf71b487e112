//! Frame sources: a camera driven by a vendor SDK worker, and file
//! playback over recorded movies.
//!
//! Both variants share one contract: they publish `(frame, monotonic_ns)`
//! into a single-slot [FrameSlot] with a latest-image-only policy and
//! report lifecycle through a [SourceEvent] channel. A connection state
//! machine rejects non-adjacent transitions, so misuse surfaces as an
//! error instead of a wedged acquisition thread.

use std::time::Duration;

pub use crossbeam_channel::{unbounded as event_channel, Receiver, Sender};

mod camera;
mod file;
mod fps;
mod sim;
mod slot;
mod state;

pub use camera::{CameraSource, DeviceInfo, GrabSettings, SourceDriver};
pub use file::FileSource;
pub use fps::FpsEstimator;
pub use sim::{SimDriver, SimScene};
pub use slot::FrameSlot;
pub use state::{check_transition, ConnectionState};

pub type Result<T> = std::result::Result<T, Error>;

/// Worker retrieval timeout; bounds how long cancellation can go unobserved.
pub const RETRIEVE_TIMEOUT: Duration = Duration::from_millis(500);

/// Hard ceiling on how long [CameraSource::stop] may block its caller.
pub const STOP_CEILING: Duration = Duration::from_secs(2);

/// Transient retrievals retried before the grab is declared fatal.
pub const MAX_GRAB_RETRIES: u32 = 2;

/// Backoff between grab retries.
pub const GRAB_RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("device {0} not found")]
    DeviceNotFound(usize),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("retrieve timeout")]
    Timeout,
    #[error("transient grab failure: {0}")]
    GrabTransient(String),
    #[error("fatal grab failure: {0}")]
    GrabFatal(String),
    #[error("concurrent frame retrieval detected")]
    ThreadInvariantBroken,
    #[error("invalid state transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: ConnectionState,
        to: ConnectionState,
    },
    #[error("operation requires state {expected:?}, current state is {actual:?}")]
    WrongState {
        expected: ConnectionState,
        actual: ConnectionState,
    },
    #[error("grab worker did not stop within {0:?}")]
    StopTimeout(Duration),
    #[error("worker already running")]
    AlreadyRunning,
    #[error("driver error: {0}")]
    Driver(String),
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("{source}")]
    Frame {
        #[from]
        source: hopper_frame::Error,
    },
    #[error("{source}")]
    Movie {
        #[from]
        source: hopper_rec::Error,
    },
}

impl Error {
    /// Whether the grab worker may retry after this retrieval error.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Timeout | Error::GrabTransient(_))
    }
}

/// Lifecycle events surfaced to whoever drives the source.
///
/// Frames do not travel on this channel; they go through the [FrameSlot].
#[derive(Debug, Clone)]
pub enum SourceEvent {
    Connected(DeviceInfo),
    StateChanged(ConnectionState),
    Fps(f64),
    GrabError { fatal: bool, msg: String },
    PlaybackFinished,
}

fn _test_event_is_send() {
    // Compile-time test to ensure SourceEvent implements Send trait.
    fn implements<T: Send>() {}
    implements::<SourceEvent>();
    implements::<Error>();
}
