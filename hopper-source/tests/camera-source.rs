use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;

use hopper_frame::Frame;
use hopper_source::{
    event_channel, CameraSource, ConnectionState, DeviceInfo, Error, FrameSlot, GrabSettings,
    Receiver, SourceDriver, SourceEvent,
};

fn init() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Scripted stand-in for a vendor SDK.
struct MockDriver {
    devices: Vec<DeviceInfo>,
    opened: bool,
    acquiring: bool,
    /// Per-retrieve artificial latency.
    retrieve_delay: Duration,
    /// Upcoming failure injections, consumed one per retrieve.
    failures: Arc<Mutex<VecDeque<Error>>>,
    n: u64,
}

impl MockDriver {
    fn new() -> Self {
        Self {
            devices: vec![DeviceInfo {
                index: 0,
                model: "mock-cam".to_string(),
                serial: "0001".to_string(),
                name: "mock camera 0".to_string(),
            }],
            opened: false,
            acquiring: false,
            retrieve_delay: Duration::from_millis(1),
            failures: Arc::new(Mutex::new(VecDeque::new())),
            n: 0,
        }
    }
}

impl SourceDriver for MockDriver {
    fn enumerate(&mut self) -> hopper_source::Result<Vec<DeviceInfo>> {
        Ok(self.devices.clone())
    }

    fn open(&mut self, index: usize) -> hopper_source::Result<DeviceInfo> {
        match self.devices.get(index) {
            Some(info) => {
                self.opened = true;
                Ok(info.clone())
            }
            None => Err(Error::DeviceNotFound(index)),
        }
    }

    fn configure(&mut self, _settings: &GrabSettings) -> hopper_source::Result<()> {
        assert!(self.opened);
        Ok(())
    }

    fn start_acquisition(&mut self) -> hopper_source::Result<()> {
        self.acquiring = true;
        Ok(())
    }

    fn retrieve(&mut self, timeout: Duration) -> hopper_source::Result<Frame> {
        let wait = self.retrieve_delay.min(timeout);
        std::thread::sleep(wait);
        if self.retrieve_delay >= timeout {
            return Err(Error::Timeout);
        }
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }
        self.n += 1;
        let frame = Frame::mono8(4, 4, vec![0; 16], Utc::now(), self.n * 3_571_428).unwrap();
        Ok(frame)
    }

    fn stop_acquisition(&mut self) -> hopper_source::Result<()> {
        self.acquiring = false;
        Ok(())
    }

    fn close(&mut self) -> hopper_source::Result<()> {
        self.opened = false;
        Ok(())
    }
}

fn wait_for_state(rx: &Receiver<SourceEvent>, wanted: ConnectionState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if let Ok(SourceEvent::StateChanged(s)) = rx.recv_timeout(Duration::from_millis(100)) {
            if s == wanted {
                return;
            }
        }
    }
    panic!("never saw state {wanted:?}");
}

fn opened_source(
    driver: MockDriver,
) -> (
    CameraSource<MockDriver>,
    Arc<FrameSlot>,
    Receiver<SourceEvent>,
) {
    let slot = Arc::new(FrameSlot::new());
    let (tx, rx) = event_channel();
    let mut source = CameraSource::new(driver, slot.clone(), tx);
    source.open(0).unwrap();
    wait_for_state(&rx, ConnectionState::Connected);
    (source, slot, rx)
}

#[test]
fn open_missing_device_reverts_to_disconnected() {
    init();
    let slot = Arc::new(FrameSlot::new());
    let (tx, rx) = event_channel();
    let mut source = CameraSource::new(MockDriver::new(), slot, tx);
    source.open(7).unwrap();
    wait_for_state(&rx, ConnectionState::Disconnected);
    assert_eq!(source.state(), ConnectionState::Disconnected);
}

#[test]
fn frames_flow_and_stop_is_idempotent() {
    init();
    let (mut source, slot, rx) = opened_source(MockDriver::new());
    source.configure(&GrabSettings::default()).unwrap();
    source.start().unwrap();
    assert_eq!(source.state(), ConnectionState::Grabbing);

    let frame = slot.take_timeout(Duration::from_secs(5)).expect("a frame");
    assert_eq!(frame.width(), 4);

    source.stop().unwrap();
    assert_eq!(source.state(), ConnectionState::Connected);

    // Second stop returns immediately and changes nothing.
    let start = Instant::now();
    source.stop().unwrap();
    assert!(start.elapsed() < Duration::from_millis(50));
    assert_eq!(source.state(), ConnectionState::Connected);

    // Grab can be restarted after a clean stop.
    source.start().unwrap();
    assert!(slot.take_timeout(Duration::from_secs(5)).is_some());
    source.stop().unwrap();
    drop(rx);
}

#[test]
fn configure_requires_connected() {
    init();
    let slot = Arc::new(FrameSlot::new());
    let (tx, _rx) = event_channel();
    let source = CameraSource::new(MockDriver::new(), slot, tx);
    assert!(matches!(
        source.configure(&GrabSettings::default()),
        Err(Error::WrongState { .. })
    ));
}

#[test]
fn transient_failures_are_retried() {
    init();
    let driver = MockDriver::new();
    let failures = driver.failures.clone();
    failures.lock().push_back(Error::GrabTransient("hiccup 1".into()));
    failures.lock().push_back(Error::GrabTransient("hiccup 2".into()));

    let (mut source, slot, rx) = opened_source(driver);
    source.start().unwrap();

    // Both hiccups are absorbed and frames still arrive.
    assert!(slot.take_timeout(Duration::from_secs(5)).is_some());
    assert_eq!(source.state(), ConnectionState::Grabbing);

    // Non-fatal errors were surfaced on the event channel.
    let mut n_transient = 0;
    while let Ok(ev) = rx.try_recv() {
        if let SourceEvent::GrabError { fatal, .. } = ev {
            assert!(!fatal);
            n_transient += 1;
        }
    }
    assert_eq!(n_transient, 2);
    source.stop().unwrap();
}

#[test]
fn third_consecutive_failure_is_fatal() {
    init();
    let driver = MockDriver::new();
    let failures = driver.failures.clone();
    for i in 0..3 {
        failures
            .lock()
            .push_back(Error::GrabTransient(format!("hiccup {i}")));
    }

    let (mut source, _slot, rx) = opened_source(driver);
    source.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut saw_fatal = false;
    while Instant::now() < deadline && !saw_fatal {
        if let Ok(SourceEvent::GrabError { fatal: true, .. }) =
            rx.recv_timeout(Duration::from_millis(100))
        {
            saw_fatal = true;
        }
    }
    assert!(saw_fatal);
    // Worker parks the source in Error; stop() reaps it back to Connected.
    let deadline = Instant::now() + Duration::from_secs(1);
    while source.state() != ConnectionState::Error && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(source.state(), ConnectionState::Error);
    source.stop().unwrap();
    assert_eq!(source.state(), ConnectionState::Connected);
    source.start().unwrap();
    source.stop().unwrap();
}

#[test]
fn stop_returns_within_ceiling_against_slow_retrieval() {
    init();
    let mut driver = MockDriver::new();
    // Retrieval always runs into the 500 ms timeout.
    driver.retrieve_delay = Duration::from_secs(10);

    let (mut source, slot, _rx) = opened_source(driver);
    source.start().unwrap();
    // Give the worker time to enter a retrieval.
    std::thread::sleep(Duration::from_millis(50));

    let start = Instant::now();
    source.stop().unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert!(slot.try_take().is_none());
}

#[test]
fn close_while_grabbing_stops_first() {
    init();
    let (mut source, _slot, rx) = opened_source(MockDriver::new());
    source.start().unwrap();
    source.close().unwrap();
    assert_eq!(source.state(), ConnectionState::Disconnected);
    drop(rx);
}
