use hopper_config::PackagingConfig;
use hopper_pack::{PackagingController, PackagingEvent, PackagingPhase};
use hopper_vib::{SimVibrator, SpeedLevel, VibratorPair};

fn cfg(target: u32, advance: u32) -> PackagingConfig {
    PackagingConfig {
        target_count: target,
        advance_stop_count: advance,
        ..PackagingConfig::default()
    }
}

fn speed_events(events: &[PackagingEvent]) -> Vec<(SpeedLevel, u8)> {
    events
        .iter()
        .filter_map(|e| match e {
            PackagingEvent::SpeedChanged { level, percent } => Some((*level, *percent)),
            _ => None,
        })
        .collect()
}

/// Target 100, thresholds (0.85, 0.93, 0.97), advance stop 2: the full
/// schedule plays out as FULL, MEDIUM at 85, SLOW at 93, CREEP at 97 and
/// STOP plus completion at 98.
#[test]
fn full_schedule_plays_out() {
    let mut pair = VibratorPair::simulated();
    let mut ctl = PackagingController::new(cfg(100, 2));

    let start_events = ctl.start(&mut pair);
    assert_eq!(
        speed_events(&start_events),
        vec![(SpeedLevel::Full, 100)]
    );
    assert!(pair.is_running());

    let mut all: Vec<(u64, SpeedLevel, u8)> = Vec::new();
    let mut completions = 0;
    for n in 1..=98u64 {
        for ev in ctl.on_count(n, &mut pair) {
            match ev {
                PackagingEvent::SpeedChanged { level, percent } => all.push((n, level, percent)),
                PackagingEvent::Completed => completions += 1,
                PackagingEvent::ActuatorError(msg) => panic!("unexpected error: {msg}"),
            }
        }
    }

    assert_eq!(
        all,
        vec![
            (85, SpeedLevel::Medium, 60),
            (93, SpeedLevel::Slow, 30),
            (97, SpeedLevel::Creep, 10),
            (98, SpeedLevel::Stop, 0),
        ]
    );
    assert_eq!(completions, 1);
    assert_eq!(ctl.phase(), PackagingPhase::Completed);
    assert!(!pair.is_running());

    // Further counts are ignored until reset.
    assert!(ctl.on_count(99, &mut pair).is_empty());
    assert!(ctl.on_count(100, &mut pair).is_empty());

    ctl.reset(&mut pair);
    assert_eq!(ctl.phase(), PackagingPhase::Idle);
    assert_eq!(ctl.state().current, 0);
}

/// A single count jumping past several thresholds lands directly on the
/// right speed; the sequence is still monotone non-increasing.
#[test]
fn threshold_skipping_is_allowed() {
    let mut pair = VibratorPair::simulated();
    let mut ctl = PackagingController::new(cfg(100, 2));
    ctl.start(&mut pair);
    let events = ctl.on_count(96, &mut pair);
    assert_eq!(speed_events(&events), vec![(SpeedLevel::Creep, 10)]);
}

/// Speed levels never move back up within a batch.
#[test]
fn schedule_is_monotone() {
    let mut pair = VibratorPair::simulated();
    let mut ctl = PackagingController::new(cfg(150, 2));
    let mut levels: Vec<SpeedLevel> = speed_events(&ctl.start(&mut pair))
        .into_iter()
        .map(|(l, _)| l)
        .collect();
    for n in 1..=148u64 {
        levels.extend(
            speed_events(&ctl.on_count(n, &mut pair))
                .into_iter()
                .map(|(l, _)| l),
        );
    }
    // SpeedLevel orders fastest-first, so monotone means non-decreasing.
    assert!(levels.windows(2).all(|w| w[0] <= w[1]), "{levels:?}");
    assert_eq!(*levels.last().unwrap(), SpeedLevel::Stop);
}

/// A refused command keeps the intended state and is retried on the next
/// count event, with the error surfaced in between.
#[test]
fn refused_speed_is_retried_on_next_count() {
    let mut left = SimVibrator::new();
    // Three refusals: the batch-start Start and SetSpeed commands plus the
    // MEDIUM command under test.
    left.refuse_next(3);
    let mut pair = VibratorPair::new(Box::new(left), Box::new(SimVibrator::new()));
    let mut ctl = PackagingController::new(cfg(100, 2));
    ctl.start(&mut pair);

    // Count 85 wants MEDIUM; the primary channel refuses.
    let events = ctl.on_count(85, &mut pair);
    assert!(events
        .iter()
        .any(|e| matches!(e, PackagingEvent::ActuatorError(_))));
    assert!(speed_events(&events).is_empty());

    // Next count: still in the MEDIUM band, retried and applied.
    let events = ctl.on_count(86, &mut pair);
    assert_eq!(speed_events(&events), vec![(SpeedLevel::Medium, 60)]);
}

/// A refused STOP does not complete the batch; completion follows the
/// first delivered STOP.
#[test]
fn completion_waits_for_a_delivered_stop() {
    let mut left = SimVibrator::new();
    // Swallow the batch-start commands too; the third refusal hits STOP.
    left.refuse_next(3);
    let mut pair = VibratorPair::new(Box::new(left), Box::new(SimVibrator::new()));
    let mut ctl = PackagingController::new(cfg(10, 2));
    ctl.start(&mut pair);

    let events = ctl.on_count(8, &mut pair);
    assert!(events
        .iter()
        .any(|e| matches!(e, PackagingEvent::ActuatorError(_))));
    assert!(!events.contains(&PackagingEvent::Completed));
    assert_eq!(ctl.phase(), PackagingPhase::Running);

    let events = ctl.on_count(9, &mut pair);
    let speeds = speed_events(&events);
    assert_eq!(speeds, vec![(SpeedLevel::Stop, 0)]);
    // Completed comes after the STOP speed change.
    assert_eq!(events.last(), Some(&PackagingEvent::Completed));
    assert_eq!(ctl.phase(), PackagingPhase::Completed);
}

/// Pause halts the actuators but preserves count and speed; resume
/// restores both.
#[test]
fn pause_and_resume_preserve_the_batch() {
    let mut pair = VibratorPair::simulated();
    let mut ctl = PackagingController::new(cfg(100, 2));
    ctl.start(&mut pair);
    ctl.on_count(90, &mut pair); // MEDIUM band
    assert!(pair.is_running());

    ctl.pause(&mut pair);
    assert!(ctl.is_paused());
    assert!(!pair.is_running());
    // Counts arriving while paused are recorded but not acted on.
    assert!(ctl.on_count(91, &mut pair).is_empty());
    assert_eq!(ctl.state().current, 91);

    ctl.resume(&mut pair);
    assert!(!ctl.is_paused());
    assert!(pair.is_running());
    assert_eq!(ctl.state().speed, Some(SpeedLevel::Medium));
}

/// Advance stop: with target 150 and advance 2, the batch terminates at
/// 148.
#[test]
fn advance_stop_fires_early() {
    let mut pair = VibratorPair::simulated();
    let mut ctl = PackagingController::new(cfg(150, 2));
    ctl.start(&mut pair);
    for n in 1..148u64 {
        let events = ctl.on_count(n, &mut pair);
        assert!(!events.contains(&PackagingEvent::Completed), "early at {n}");
    }
    let events = ctl.on_count(148, &mut pair);
    assert!(events.contains(&PackagingEvent::Completed));
}

/// Zero advance stop completes exactly at the target.
#[test]
fn zero_advance_stop_completes_at_target() {
    let mut pair = VibratorPair::simulated();
    let mut ctl = PackagingController::new(cfg(5, 0));
    ctl.start(&mut pair);
    for n in 1..5u64 {
        assert!(!ctl.on_count(n, &mut pair).contains(&PackagingEvent::Completed));
    }
    assert!(ctl.on_count(5, &mut pair).contains(&PackagingEvent::Completed));
}
