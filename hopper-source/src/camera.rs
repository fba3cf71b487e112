use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use hopper_frame::{Frame, PixFmt};

use crate::fps::FpsEstimator;
use crate::slot::FrameSlot;
use crate::state::{check_transition, ConnectionState};
use crate::{
    Error, Result, SourceEvent, GRAB_RETRY_BACKOFF, MAX_GRAB_RETRIES, RETRIEVE_TIMEOUT,
    STOP_CEILING,
};

/// One enumerable capture device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub index: usize,
    pub model: String,
    pub serial: String,
    pub name: String,
}

/// Acquisition settings applied while `Connected`.
#[derive(Debug, Clone, PartialEq)]
pub struct GrabSettings {
    pub exposure_us: f64,
    pub target_fps: f64,
    pub pixel_format: PixFmt,
}

impl Default for GrabSettings {
    fn default() -> Self {
        Self {
            exposure_us: 500.0,
            target_fps: 280.0,
            pixel_format: PixFmt::Mono8,
        }
    }
}

/// The capability contract a vendor SDK must provide.
///
/// `retrieve` blocks until the next frame or `timeout`; the bounded timeout
/// is what keeps cancellation observable. Implementations signal a
/// concurrent-retrieval bug with [Error::ThreadInvariantBroken] and
/// transient delivery hiccups with [Error::GrabTransient].
pub trait SourceDriver: Send + 'static {
    fn enumerate(&mut self) -> Result<Vec<DeviceInfo>>;
    fn open(&mut self, index: usize) -> Result<DeviceInfo>;
    fn configure(&mut self, settings: &GrabSettings) -> Result<()>;
    fn start_acquisition(&mut self) -> Result<()>;
    fn retrieve(&mut self, timeout: Duration) -> Result<Frame>;
    fn stop_acquisition(&mut self) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

struct WorkerHandle {
    control: thread_control::Control,
    join: std::thread::JoinHandle<()>,
    exited: Arc<(Mutex<bool>, Condvar)>,
}

/// A camera source: owns the driver handle and the grab worker.
///
/// The driver sits behind a mutex which the worker releases between
/// retrievals, so `configure` and `stop_acquisition` from the caller
/// thread interleave with acquisition rather than deadlocking against it.
pub struct CameraSource<D> {
    driver: Arc<Mutex<D>>,
    state: Arc<Mutex<ConnectionState>>,
    slot: Arc<FrameSlot>,
    events: Sender<SourceEvent>,
    retrieval_busy: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
}

fn transition(
    state: &Mutex<ConnectionState>,
    events: &Sender<SourceEvent>,
    to: ConnectionState,
) -> Result<()> {
    {
        let mut guard = state.lock();
        check_transition(*guard, to)?;
        *guard = to;
    }
    let _ = events.send(SourceEvent::StateChanged(to));
    Ok(())
}

impl<D: SourceDriver> CameraSource<D> {
    pub fn new(driver: D, slot: Arc<FrameSlot>, events: Sender<SourceEvent>) -> Self {
        Self {
            driver: Arc::new(Mutex::new(driver)),
            state: Arc::new(Mutex::new(ConnectionState::Disconnected)),
            slot,
            events,
            retrieval_busy: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// List available devices.
    pub fn detect(&self) -> Result<Vec<DeviceInfo>> {
        self.driver.lock().enumerate()
    }

    /// Open the device at `index` off the caller thread.
    ///
    /// Completion is delivered as [SourceEvent::Connected] or as a
    /// [SourceEvent::GrabError] with the state reverted to `Disconnected`.
    pub fn open(&mut self, index: usize) -> Result<()> {
        transition(&self.state, &self.events, ConnectionState::Connecting)?;
        let driver = self.driver.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        std::thread::Builder::new()
            .name("hopper-source-open".to_string())
            .spawn(move || match driver.lock().open(index) {
                Ok(info) => {
                    info!("opened device {} ({})", info.index, info.name);
                    if transition(&state, &events, ConnectionState::Connected).is_ok() {
                        let _ = events.send(SourceEvent::Connected(info));
                    }
                }
                Err(e) => {
                    warn!("open({index}) failed: {e}");
                    let _ = transition(&state, &events, ConnectionState::Disconnected);
                    let _ = events.send(SourceEvent::GrabError {
                        fatal: false,
                        msg: e.to_string(),
                    });
                }
            })?;
        Ok(())
    }

    /// Apply acquisition settings; valid only while `Connected`.
    pub fn configure(&self, settings: &GrabSettings) -> Result<()> {
        let actual = self.state();
        if actual != ConnectionState::Connected {
            return Err(Error::WrongState {
                expected: ConnectionState::Connected,
                actual,
            });
        }
        self.driver.lock().configure(settings)
    }

    /// Begin grabbing: start SDK acquisition and spawn the grab worker.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        transition(&self.state, &self.events, ConnectionState::StartingGrab)?;
        if let Err(e) = self.driver.lock().start_acquisition() {
            let _ = transition(&self.state, &self.events, ConnectionState::Error);
            return Err(e);
        }

        let (flag, control) = thread_control::make_pair();
        let exited = Arc::new((Mutex::new(false), Condvar::new()));
        let ctx = WorkerCtx {
            driver: self.driver.clone(),
            state: self.state.clone(),
            slot: self.slot.clone(),
            events: self.events.clone(),
            retrieval_busy: self.retrieval_busy.clone(),
            exited: exited.clone(),
        };
        let join = std::thread::Builder::new()
            .name("hopper-grab".to_string())
            .spawn(move || grab_worker(flag, ctx))?;
        self.worker = Some(WorkerHandle {
            control,
            join,
            exited,
        });
        transition(&self.state, &self.events, ConnectionState::Grabbing)?;
        Ok(())
    }

    /// Stop grabbing.
    ///
    /// Blocks the caller at most [STOP_CEILING]; if the worker has not
    /// observed cancellation by then, the handle is deliberately leaked and
    /// the source parks in `Error` rather than hanging or crashing. A
    /// second call with no worker running returns immediately.
    pub fn stop(&mut self) -> Result<()> {
        let worker = match self.worker.take() {
            Some(w) => w,
            None => return Ok(()),
        };
        // The worker may race us into Error; reap it either way and let
        // the final transition sort out which path we took.
        if self.state() == ConnectionState::Grabbing {
            let _ = transition(&self.state, &self.events, ConnectionState::StoppingGrab);
        }
        worker.control.stop();

        let (lock, cvar) = &*worker.exited;
        let deadline = Instant::now() + STOP_CEILING;
        let mut done = lock.lock();
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let _ = cvar.wait_for(&mut done, deadline - now);
        }
        let worker_exited = *done;
        drop(done);

        if !worker_exited {
            error!(
                "grab worker did not exit within {:?}; leaking its handle",
                STOP_CEILING
            );
            *self.state.lock() = ConnectionState::Error;
            let _ = self
                .events
                .send(SourceEvent::StateChanged(ConnectionState::Error));
            // Dropping the JoinHandle detaches the thread; that is the leak.
            return Err(Error::StopTimeout(STOP_CEILING));
        }
        let _ = worker.join.join();

        if let Err(e) = self.driver.lock().stop_acquisition() {
            warn!("stop_acquisition failed: {e}");
        }
        // From StoppingGrab on the clean path, or from Error after a
        // fatal grab reaped by this stop().
        transition(&self.state, &self.events, ConnectionState::Connected)?;
        Ok(())
    }

    /// Disconnect; implies `stop()` when grabbing.
    pub fn close(&mut self) -> Result<()> {
        match self.state() {
            ConnectionState::Disconnected => return Ok(()),
            ConnectionState::Grabbing | ConnectionState::Error => {
                self.stop()?;
            }
            _ => {}
        }
        transition(&self.state, &self.events, ConnectionState::Disconnecting)?;
        self.driver.lock().close()?;
        self.slot.clear();
        transition(&self.state, &self.events, ConnectionState::Disconnected)?;
        Ok(())
    }
}

struct WorkerCtx<D> {
    driver: Arc<Mutex<D>>,
    state: Arc<Mutex<ConnectionState>>,
    slot: Arc<FrameSlot>,
    events: Sender<SourceEvent>,
    retrieval_busy: Arc<AtomicBool>,
    exited: Arc<(Mutex<bool>, Condvar)>,
}

fn grab_worker<D: SourceDriver>(flag: thread_control::Flag, ctx: WorkerCtx<D>) {
    info!("grab worker started");
    let mut fps = FpsEstimator::new();
    let mut consecutive_failures = 0u32;
    let mut n_frames: u64 = 0;

    while flag.is_alive() {
        if ctx.retrieval_busy.swap(true, Ordering::SeqCst) {
            // A second retrieval while one is in flight is a hard bug in
            // the caller, not a recoverable grab error.
            error!("concurrent retrieval detected; grab worker exiting");
            fatal(&ctx, Error::ThreadInvariantBroken.to_string());
            break;
        }
        let started = Instant::now();
        let res = {
            // Release the driver lock every cycle so the caller thread can
            // reconfigure or stop acquisition between retrievals.
            let mut driver = ctx.driver.lock();
            driver.retrieve(RETRIEVE_TIMEOUT)
        };
        ctx.retrieval_busy.store(false, Ordering::SeqCst);

        match res {
            Ok(frame) => {
                consecutive_failures = 0;
                n_frames += 1;
                debug!(
                    "frame {} retrieved in {} us",
                    n_frames,
                    started.elapsed().as_micros()
                );
                fps.tick(frame.monotonic_ns());
                if n_frames % 30 == 0 {
                    if let Some(value) = fps.current() {
                        let _ = ctx.events.send(SourceEvent::Fps(value));
                    }
                }
                if ctx.slot.publish(frame) {
                    debug!("processor lagging; overwrote undrained frame");
                }
            }
            Err(Error::Timeout) => {
                // No frame inside the bound; loop to re-check the flag.
                continue;
            }
            Err(Error::ThreadInvariantBroken) => {
                error!("driver reported a concurrent retrieval; grab worker exiting");
                fatal(&ctx, Error::ThreadInvariantBroken.to_string());
                break;
            }
            Err(e) if e.is_transient() && consecutive_failures < MAX_GRAB_RETRIES => {
                consecutive_failures += 1;
                warn!(
                    "transient grab failure ({consecutive_failures}/{MAX_GRAB_RETRIES}): {e}"
                );
                let _ = ctx.events.send(SourceEvent::GrabError {
                    fatal: false,
                    msg: e.to_string(),
                });
                std::thread::sleep(GRAB_RETRY_BACKOFF);
            }
            Err(e) => {
                error!("fatal grab failure: {e}");
                fatal(&ctx, e.to_string());
                break;
            }
        }
    }

    let (lock, cvar) = &*ctx.exited;
    *lock.lock() = true;
    cvar.notify_all();
    info!("grab worker exited after {n_frames} frames");
}

fn fatal<D>(ctx: &WorkerCtx<D>, msg: String) {
    let entered_error = {
        let mut guard = ctx.state.lock();
        let ok = check_transition(*guard, ConnectionState::Error).is_ok();
        if ok {
            *guard = ConnectionState::Error;
        }
        ok
    };
    if entered_error {
        let _ = ctx
            .events
            .send(SourceEvent::StateChanged(ConnectionState::Error));
    }
    let _ = ctx.events.send(SourceEvent::GrabError { fatal: true, msg });
}
