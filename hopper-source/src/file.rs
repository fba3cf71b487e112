use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use hopper_rec::RawMovieReader;

use crate::slot::FrameSlot;
use crate::state::{check_transition, ConnectionState};
use crate::{Error, Result, SourceEvent};

const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
enum Request {
    Seek(u64),
    StepNext,
    StepPrev,
    /// Re-deliver the current frame (used while paused).
    Refresh,
}

#[derive(Debug)]
struct PlayState {
    paused: bool,
    pos: u64,
    request: Option<Request>,
    finished: bool,
}

struct PlayCtrl {
    inner: Mutex<PlayState>,
    cond: Condvar,
}

/// File-backed source replaying a recorded movie at its declared rate.
///
/// Implements the same slot-and-events contract as the camera source, with
/// the extras a recording affords: restart, frame-index seek, single-step
/// in both directions, and pause/resume. A paused source re-delivers its
/// current frame on request.
pub struct FileSource {
    reader: Arc<Mutex<RawMovieReader>>,
    ctrl: Arc<PlayCtrl>,
    state: Arc<Mutex<ConnectionState>>,
    slot: Arc<FrameSlot>,
    events: Sender<SourceEvent>,
    worker: Option<(thread_control::Control, std::thread::JoinHandle<()>)>,
    fps: f64,
    n_frames: u64,
}

impl FileSource {
    pub fn open<P: AsRef<Path>>(
        path: P,
        slot: Arc<FrameSlot>,
        events: Sender<SourceEvent>,
        fps_override: Option<f64>,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(ConnectionState::Disconnected));
        transition(&state, &events, ConnectionState::Connecting)?;
        let reader = match RawMovieReader::open(&path) {
            Ok(r) => r,
            Err(e) => {
                let _ = transition(&state, &events, ConnectionState::Disconnected);
                return Err(e.into());
            }
        };
        let n_frames = reader.n_frames();
        let mut fps = fps_override.unwrap_or_else(|| reader.nominal_fps());
        if !(fps.is_finite() && fps > 0.0) {
            warn!("movie declares no usable fps; defaulting to 30");
            fps = 30.0;
        }
        transition(&state, &events, ConnectionState::Connected)?;
        info!(
            "opened movie: {} frames, {}x{}, {fps} fps",
            n_frames,
            reader.width(),
            reader.height()
        );
        Ok(Self {
            reader: Arc::new(Mutex::new(reader)),
            ctrl: Arc::new(PlayCtrl {
                inner: Mutex::new(PlayState {
                    paused: false,
                    pos: 0,
                    request: None,
                    finished: n_frames == 0,
                }),
                cond: Condvar::new(),
            }),
            state,
            slot,
            events,
            worker: None,
            fps,
            n_frames,
        })
    }

    pub fn n_frames(&self) -> u64 {
        self.n_frames
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn position(&self) -> u64 {
        self.ctrl.inner.lock().pos
    }

    pub fn is_paused(&self) -> bool {
        self.ctrl.inner.lock().paused
    }

    /// Begin playback from the current position.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::AlreadyRunning);
        }
        transition(&self.state, &self.events, ConnectionState::StartingGrab)?;
        let (flag, control) = thread_control::make_pair();
        let ctx = PlaybackCtx {
            reader: self.reader.clone(),
            ctrl: self.ctrl.clone(),
            slot: self.slot.clone(),
            events: self.events.clone(),
            interval: Duration::from_secs_f64(1.0 / self.fps),
            n_frames: self.n_frames,
        };
        let join = std::thread::Builder::new()
            .name("hopper-playback".to_string())
            .spawn(move || playback_worker(flag, ctx))?;
        self.worker = Some((control, join));
        transition(&self.state, &self.events, ConnectionState::Grabbing)?;
        let _ = self.events.send(SourceEvent::Fps(self.fps));
        Ok(())
    }

    /// Stop playback; position is retained. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let (control, join) = match self.worker.take() {
            Some(w) => w,
            None => return Ok(()),
        };
        if self.state() == ConnectionState::Grabbing {
            transition(&self.state, &self.events, ConnectionState::StoppingGrab)?;
        }
        control.stop();
        self.ctrl.cond.notify_all();
        let _ = join.join();
        transition(&self.state, &self.events, ConnectionState::Connected)?;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        self.stop()?;
        transition(&self.state, &self.events, ConnectionState::Disconnecting)?;
        self.slot.clear();
        transition(&self.state, &self.events, ConnectionState::Disconnected)?;
        Ok(())
    }

    pub fn pause(&self) {
        self.ctrl.inner.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut st = self.ctrl.inner.lock();
        st.paused = false;
        drop(st);
        self.ctrl.cond.notify_all();
    }

    pub fn seek(&self, index: u64) {
        self.request(Request::Seek(index));
    }

    pub fn step_next(&self) {
        self.request(Request::StepNext);
    }

    pub fn step_prev(&self) {
        self.request(Request::StepPrev);
    }

    /// Re-deliver the current frame (meaningful while paused).
    pub fn refresh(&self) {
        self.request(Request::Refresh);
    }

    /// Rewind to frame zero and resume playing.
    pub fn restart(&self) {
        let mut st = self.ctrl.inner.lock();
        st.request = Some(Request::Seek(0));
        st.paused = false;
        st.finished = false;
        drop(st);
        self.ctrl.cond.notify_all();
    }

    fn request(&self, req: Request) {
        let mut st = self.ctrl.inner.lock();
        st.request = Some(req);
        drop(st);
        self.ctrl.cond.notify_all();
    }
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

struct PlaybackCtx {
    reader: Arc<Mutex<RawMovieReader>>,
    ctrl: Arc<PlayCtrl>,
    slot: Arc<FrameSlot>,
    events: Sender<SourceEvent>,
    interval: Duration,
    n_frames: u64,
}

fn playback_worker(flag: thread_control::Flag, ctx: PlaybackCtx) {
    info!("playback worker started");
    let last = ctx.n_frames.saturating_sub(1);
    while flag.is_alive() {
        // Decide under the control lock, read and sleep outside it.
        let action: Option<(u64, bool)> = {
            let mut st = ctx.ctrl.inner.lock();
            if let Some(req) = st.request.take() {
                let pos = match req {
                    Request::Seek(i) => i.min(last),
                    Request::StepNext => (st.pos + 1).min(last),
                    Request::StepPrev => st.pos.saturating_sub(1),
                    Request::Refresh => st.pos,
                };
                st.pos = pos;
                st.finished = false;
                if st.paused {
                    Some((pos, false))
                } else {
                    None // the play path below delivers it
                }
            } else if st.paused || st.finished {
                let _ = ctx.ctrl.cond.wait_for(&mut st, IDLE_POLL);
                None
            } else if st.pos >= ctx.n_frames {
                st.finished = true;
                let _ = ctx.events.send(SourceEvent::PlaybackFinished);
                None
            } else {
                let pos = st.pos;
                st.pos += 1;
                Some((pos, true))
            }
        };

        if let Some((pos, advance)) = action {
            let res = ctx.reader.lock().frame(pos);
            match res {
                Ok(frame) => {
                    ctx.slot.publish(frame);
                }
                Err(e) => {
                    warn!("read of frame {pos} failed: {e}");
                    let _ = ctx.events.send(SourceEvent::GrabError {
                        fatal: true,
                        msg: e.to_string(),
                    });
                    break;
                }
            }
            if advance {
                std::thread::sleep(ctx.interval);
            }
        }
    }
    info!("playback worker exited");
}
