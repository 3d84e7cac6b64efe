// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end scenarios against the simulated hardware: servo lock-in
//! from cold, command-driven synchronisation, open-loop diagnostics,
//! compensation convergence and the observer handshake.

use bpmd::dsc::protocol::{Request, RequestKind, DSC_AUTO};
use bpmd::dsc::{AcqGeometry, DscEngine, EngineConfig};
use bpmd::events::interlock::{Interlock, MachineTimestamp, TriggerSink};
use bpmd::hw::sim::{MemBus, SimAdc, SimClock, SimTbt};
use bpmd::pll::{
    machine_clock_config, machine_clock_stages, parse_status_line, StatusLine, StatusWriter,
};
use bpmd::sync::OnceSignal;
use bpmd::{Controller, Shutdown, SyncState};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

/// Status sink capturing every line for later inspection.
#[derive(Clone, Default)]
struct CaptureSink {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CaptureSink {
    fn lines(&self) -> Vec<String> {
        String::from_utf8(self.bytes.lock().clone())
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct Servo {
    clock: Arc<SimClock>,
    controller: Arc<Controller<Arc<SimClock>>>,
    shutdown: Arc<Shutdown>,
    handle: std::thread::JoinHandle<()>,
    sink: CaptureSink,
}

const MC_PRESCALE: i64 = 84663 * 129; // 10921527

fn start_machine_servo(clock: Arc<SimClock>) -> Servo {
    clock.set_tick_pause(Duration::from_micros(200));
    let sink = CaptureSink::default();
    let status = Arc::new(StatusWriter::new(Box::new(sink.clone())));
    let shutdown = Arc::new(Shutdown::new());
    let controller = Controller::new(
        machine_clock_config(MC_PRESCALE),
        machine_clock_stages(),
        Arc::clone(&clock),
        status,
        Arc::clone(&shutdown),
    );
    let handle = controller.spawn().unwrap();
    Servo {
        clock,
        controller,
        shutdown,
        handle,
        sink,
    }
}

fn wait_for(servo: &Servo, timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn wait_for_narrow_lock(servo: &Servo) -> u64 {
    let mut ticks_at_lock = 0;
    let locked = wait_for(servo, Duration::from_secs(30), || {
        let s = servo.controller.snapshot();
        if s.stage == 3 && s.phase_error.abs() <= 2 {
            ticks_at_lock = servo.clock.ticks();
            true
        } else {
            false
        }
    });
    assert!(
        locked,
        "no narrow lock: {:?} after {} ticks",
        servo.controller.snapshot(),
        servo.clock.ticks()
    );
    ticks_at_lock
}

// ============================================================================
// S1: lock-in from cold
// ============================================================================

#[test]
fn lock_in_from_cold() {
    // Frequency drift ramping from +200 to -200 clocks per tick over
    // 4000 ticks, a VCXO gain in the regime the stages are designed for.
    let clock = SimClock::with_linear_drift(MC_PRESCALE, 0.03, 200.0, -200.0, 4000);
    let servo = start_machine_servo(clock);

    let ticks = wait_for_narrow_lock(&servo);
    assert!(ticks <= 3000, "lock took {} ticks", ticks);

    servo.shutdown.request();
    servo.handle.join().unwrap();

    // The status stream walks the stage sequence 0 -> 1 -> 2 -> 3 and
    // never reports a synchronisation transition.
    let mut stages_seen = Vec::new();
    for line in servo.sink.lines() {
        match parse_status_line(&line) {
            Some(StatusLine::Stage { stage, sync, .. }) => {
                if stages_seen.last() != Some(&stage) {
                    stages_seen.push(stage);
                }
                assert_eq!(sync, SyncState::None, "unexpected sync transition");
            }
            Some(_) | None => {}
        }
    }
    // The servo first reaches stages 1, 2, 3 in that order (transient
    // regressions between them are fine; stage 0 itself goes unreported
    // on a clean start because the clock is found before the first
    // periodic report falls due).
    let first_index = |stage: u32| stages_seen.iter().position(|&s| s == stage);
    let (s1, s2, s3) = (first_index(1), first_index(2), first_index(3));
    assert!(
        s1.is_some() && s1 < s2 && s2 < s3 && s3.is_some(),
        "stage walk {:?}",
        stages_seen
    );
}

// ============================================================================
// S2: command-driven synchronisation
// ============================================================================

#[test]
fn command_driven_sync() {
    let clock = SimClock::new(MC_PRESCALE, 0.03, |_| 50.0);
    let servo = start_machine_servo(clock);
    wait_for_narrow_lock(&servo);

    servo.controller.command("s1");
    let s = servo.controller.snapshot();
    assert_eq!(s.sync, SyncState::Tracking);
    assert!(s.slewing, "slewing opens between the two commands");

    servo.controller.command("s2");
    assert_eq!(servo.controller.snapshot().sync, SyncState::Synchronised);

    // Narrow lock restores the tight limit once synchronised.
    assert!(wait_for(&servo, Duration::from_secs(5), || {
        !servo.controller.snapshot().slewing
    }));

    servo.shutdown.request();
    servo.handle.join().unwrap();
}

// ============================================================================
// S3: phase-error override
// ============================================================================

#[test]
fn phase_glitch_bounces_filter_without_losing_sync() {
    let clock = SimClock::new(MC_PRESCALE, 0.03, |_| 0.0);
    let servo = start_machine_servo(clock);
    wait_for_narrow_lock(&servo);
    servo.controller.command("s1");
    servo.controller.command("s2");
    assert_eq!(servo.controller.snapshot().sync, SyncState::Synchronised);

    servo.clock.inject_phase_error(5);

    // The narrow filter bails out to the coarse stage...
    assert!(
        wait_for(&servo, Duration::from_secs(10), || {
            servo.controller.snapshot().stage == 2
        }),
        "filter never bailed out: {:?}",
        servo.controller.snapshot()
    );
    // ...and recovers, with synchronisation held throughout.
    assert!(wait_for(&servo, Duration::from_secs(20), || {
        let s = servo.controller.snapshot();
        s.stage == 3 && s.phase_error.abs() <= 2
    }));
    assert_eq!(servo.controller.snapshot().sync, SyncState::Synchronised);

    servo.shutdown.request();
    servo.handle.join().unwrap();
}

// ============================================================================
// S4: open loop
// ============================================================================

#[test]
fn open_loop_pins_stage_and_frees_dac() {
    let clock = SimClock::new(MC_PRESCALE, 0.03, |_| 20.0);
    let servo = start_machine_servo(clock);
    wait_for_narrow_lock(&servo);

    servo.controller.command("c1");
    assert!(wait_for(&servo, Duration::from_secs(5), || {
        servo.controller.snapshot().stage == 4
    }));
    servo.controller.command("d32768");
    assert_eq!(servo.controller.snapshot().dac, 32768);
    assert_eq!(servo.clock.dac(), 32768);

    // The servo keeps monitoring but never writes the DAC again.
    let writes = servo.clock.dac_writes();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(servo.clock.dac_writes(), writes);

    // Closing the loop drops back to a regular stage.
    servo.controller.command("c0");
    assert!(wait_for(&servo, Duration::from_secs(5), || {
        (1..=3).contains(&servo.controller.snapshot().stage)
    }));

    servo.shutdown.request();
    servo.handle.join().unwrap();
}

// ============================================================================
// S5: compensation round trip
// ============================================================================

#[test]
fn amplitude_compensation_converges() {
    let dir = tempfile::tempdir().unwrap();
    let geometry = AcqGeometry {
        n_tbt: 20,
        ph_avg: 4,
        ..AcqGeometry::default()
    };
    let angle_step = 2.0 * std::f64::consts::PI * geometry.f_if() / geometry.f_samp();
    let mut tbt = SimTbt::new(20);
    // Channel B uniformly 10% low across all positions.
    tbt.channel_scale[1] = 0.9;

    let mut schedule = String::new();
    for level in -60..=0 {
        schedule.push_str(&format!("{} 15 14 0.25 2\n", level));
    }
    let mut engine = DscEngine::new(
        EngineConfig {
            geometry,
            volatile_store: dir.path().join("volatile.dat"),
            lastgood_store: dir.path().join("lastgood.dat"),
            lastgood_remount: None,
        },
        bpmd::dsc::AttenuatorSchedule::parse(&schedule).unwrap(),
        MemBus::new(),
        Box::new(tbt),
        Box::new(SimAdc::new(angle_step, [800.0; 4])),
    )
    .unwrap();

    let mut auto = Request::new(RequestKind::SetDsc, DSC_AUTO);
    engine.handle_request(&mut auto);
    assert_eq!(auto.status, 0);

    // First rotation: gain (manual AGC, no-op) then amplitude.
    engine.tick().unwrap();
    engine.tick().unwrap();
    let level = engine.level();
    let first = *engine.table().record(level);
    // A channel-uniform dip carries no switch dependence: after the
    // geometric renormalisation the coefficients sit at unity.
    for row in &first.amplitude {
        for &c in row {
            assert!((c - 1.0).abs() < 0.02, "coefficient {}", c);
        }
    }

    // Same injection once more: the additional change stays within 1%.
    engine.tick().unwrap(); // phase
    engine.tick().unwrap(); // crosstalk
    engine.tick().unwrap(); // gain
    engine.tick().unwrap(); // amplitude again
    let second = engine.table().record(level);
    for position in 0..8 {
        for channel in 0..4 {
            let delta =
                (second.amplitude[position][channel] - first.amplitude[position][channel]).abs();
            assert!(delta <= 0.01, "({}, {}): {}", position, channel, delta);
        }
    }

    // Geometric unity per channel after every commit.
    for channel in 0..4 {
        let product: f64 = (0..8)
            .map(|p| second.amplitude[p][channel] as f64)
            .product();
        let geo = (product.ln() / 8.0).exp();
        assert!((geo - 1.0).abs() < 1e-6, "channel {}: {}", channel, geo);
    }
}

// ============================================================================
// S6: interlock missed handshake
// ============================================================================

#[derive(Default)]
struct CountingSink {
    raised: AtomicUsize,
}

impl TriggerSink for CountingSink {
    fn raise(&self, _timestamp: SystemTime) {
        self.raised.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn missed_handshake_recovers_after_two_seconds() {
    let ready = Arc::new(OnceSignal::new());
    ready.set();
    let sink = Arc::new(CountingSink::default());
    let interlock = Interlock::new("PM", ready, Arc::clone(&sink) as _);

    interlock.wait();
    interlock.ready(Some(MachineTimestamp {
        system: SystemTime::now(),
        machine: 123,
    }));
    // The observer omits its acknowledgement for this cycle.
    let start = Instant::now();
    interlock.wait();
    let waited = start.elapsed();
    assert!(
        waited >= Duration::from_millis(1900) && waited < Duration::from_secs(10),
        "waited {:?}",
        waited
    );

    // The subsequent cycle proceeds normally.
    interlock.ready(None);
    interlock.report_done();
    let start = Instant::now();
    interlock.wait();
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(sink.raised.load(Ordering::SeqCst), 2);
}
