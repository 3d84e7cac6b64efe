// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The controller proper: clock-update contract, stage sequencer, command
//! interpreter.
//!
//! Locking follows a deliberately simple rule: the servo thread holds the
//! controller lock at all times except while it is blocked reading the
//! clock, and every command is interpreted under the same lock. Commands
//! therefore take effect between two clock samples and the servo never
//! observes half-updated state.

use super::stages::{Stage, StageKind};
use super::status::StatusWriter;
use super::{ClockConfig, SyncState};
use crate::hw::ClockSource;
use crate::runtime::Shutdown;
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Length of the DAC history ring used to settle the hand-off value at the
/// end of coarse phase lock-in.
const DAC_HISTORY: usize = 16;

/// Phase-lock depth requested by the running stage. The depth controls
/// both the `phase_locked` flag and how readily the slew limit is
/// restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PhaseGate {
    /// Not phase locked, don't try to track phase.
    Unlocked,
    /// Phase locked, wide slew acceptance.
    Wide,
    /// Narrow phase lock, restore the tight phase-error limit.
    Narrow,
}

/// Runtime-tunable values, mutated only through the command interpreter.
#[derive(Debug, Default)]
struct Tuning {
    frequency_offset: i32,
    phase_offset: i32,
    verbose: bool,
    report_interval: i32,
}

/// Servo state. All fields live under the controller lock.
#[derive(Debug, Default)]
struct ClockState {
    clock: i64,
    nominal_clock: i64,
    phase_error: i32,
    frequency_error: i32,
    phase_locked: bool,
    clock_ok: bool,
    open_loop: bool,
    dac: u16,
    stage: usize,
    slewing: bool,
    sync: SyncState,
    // Histories for transition detection in state reporting.
    was_phase_locked: bool,
    previous_stage: usize,
    was_sync: SyncState,
    report_age: i32,
}

struct Shared {
    stages: Vec<Stage>,
    tune: Tuning,
    st: ClockState,
}

/// Point-in-time view of one controller, taken under its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockSnapshot {
    pub stage: usize,
    pub sync: SyncState,
    pub phase_error: i32,
    pub frequency_error: i32,
    pub dac: u16,
    pub phase_locked: bool,
    pub clock_ok: bool,
    pub open_loop: bool,
    pub slewing: bool,
}

/// One managed VCXO servo.
pub struct Controller<C: ClockSource> {
    cfg: ClockConfig,
    io: C,
    status: Arc<StatusWriter>,
    shutdown: Arc<Shutdown>,
    shared: Mutex<Shared>,
}

impl<C: ClockSource + 'static> Controller<C> {
    pub fn new(
        cfg: ClockConfig,
        stages: Vec<Stage>,
        io: C,
        status: Arc<StatusWriter>,
        shutdown: Arc<Shutdown>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            io,
            status,
            shutdown,
            shared: Mutex::new(Shared {
                stages,
                tune: Tuning {
                    report_interval: 10,
                    ..Tuning::default()
                },
                st: ClockState {
                    // Start the DAC in the middle of its range.
                    dac: 0x8000,
                    ..ClockState::default()
                },
            }),
        })
    }

    /// Start the servo thread. Fails only if the thread cannot be spawned.
    pub fn spawn(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let this = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("{}-servo", self.cfg.name.to_lowercase()))
            .spawn(move || this.run())
    }

    pub fn config(&self) -> &ClockConfig {
        &self.cfg
    }

    pub fn snapshot(&self) -> ClockSnapshot {
        let g = self.shared.lock();
        ClockSnapshot {
            stage: g.st.stage,
            sync: g.st.sync,
            phase_error: g.st.phase_error,
            frequency_error: g.st.frequency_error,
            dac: g.st.dac,
            phase_locked: g.st.phase_locked,
            clock_ok: g.st.clock_ok,
            open_loop: g.st.open_loop,
            slewing: g.st.slewing,
        }
    }

    fn running(&self) -> bool {
        !self.shutdown.is_set()
    }

    // ========================================================================
    // Clock update contract
    // ========================================================================

    /// Capture the next clock trigger. The controller lock is released for
    /// the duration of the (possibly blocking) hardware read; this is the
    /// only suspension point of the servo loop.
    fn get_clock(&self, g: &mut MutexGuard<'_, Shared>) -> bool {
        let reading = MutexGuard::unlocked(g, || self.io.read());
        match reading {
            Ok(Some(clock)) => {
                g.st.clock = clock;
                g.st.clock_ok = true;
            }
            Ok(None) => g.st.clock_ok = false,
            Err(e) => {
                log::warn!("{}: clock read failed: {}", self.cfg.name, e);
                g.st.clock_ok = false;
            }
        }
        g.st.clock_ok
    }

    fn drop_sync(&self, g: &mut Shared, reason: &str) {
        if g.st.sync == SyncState::Synchronised {
            log::info!(
                "{}: Synchronisation lost, {} ({})",
                self.cfg.name,
                reason,
                g.st.phase_error
            );
        }
        g.st.sync = SyncState::None;
    }

    fn nominal_advance(&self, g: &Shared) -> i64 {
        self.cfg.prescale + g.tune.frequency_offset as i64
    }

    /// Update the error terms from a fresh clock reading.
    fn update_clock_state(&self, g: &mut Shared, phase_locked: bool, old_clock: i64) {
        g.st.phase_locked = phase_locked;
        if !phase_locked {
            self.drop_sync(g, "phase lock lost");
        }

        let clock_frequency = g.st.clock - old_clock;
        let nominal_advance = self.nominal_advance(g);

        // Phase locked: the nominal clock advances by the nominal amount.
        // Otherwise it simply tracks the actual clock.
        if phase_locked {
            g.st.nominal_clock += nominal_advance;
        } else {
            g.st.nominal_clock = g.st.clock;
        }

        // The phase offset reported to the driver is the raw difference;
        // the controlled phase error also takes the programmed offset into
        // account.
        let phase_offset = g.st.nominal_clock - g.st.clock;
        g.st.phase_error = clip_to_i32(phase_offset + g.tune.phase_offset as i64);
        g.st.frequency_error = clip_to_i32(nominal_advance - clock_frequency);

        let limit = if g.st.slewing {
            self.cfg.slew_phase_error
        } else {
            self.cfg.normal_phase_error
        };
        if g.st.phase_error.abs() > limit {
            self.drop_sync(g, "excessive phase error");
        }

        self.io.notify(clock_frequency, phase_offset, g.st.phase_locked);
    }

    /// Read the clock and recompute the error terms. Returns `false` when
    /// the open-loop flag does not match the caller's expectation or when
    /// the clock is lost; the state is left untouched in either case.
    fn update_clock(&self, g: &mut MutexGuard<'_, Shared>, open_loop: bool, gate: PhaseGate) -> bool {
        if open_loop != g.st.open_loop {
            return false;
        }
        if gate == PhaseGate::Narrow && g.st.sync == SyncState::Synchronised {
            // Once synchronised and narrowly locked, restore the tight
            // phase-error limit.
            g.st.slewing = false;
        }
        let old_clock = g.st.clock;
        if self.get_clock(g) {
            self.update_clock_state(g, gate != PhaseGate::Unlocked, old_clock);
        }
        g.st.clock_ok
    }

    fn set_dac(&self, g: &mut Shared, dac: i64) {
        let dac = dac.clamp(0, 0xFFFF) as u16;
        g.st.dac = dac;
        self.io.set_dac(dac);
    }

    // ========================================================================
    // State reporting
    // ========================================================================

    /// Called after every clock update to report the controller state.
    fn report_state(&self, g: &mut Shared) {
        // Log gain or loss of clock or phase lock, and nothing else.
        let message = if g.st.stage == 0 && g.st.previous_stage != 0 {
            Some("Clock lost")
        } else if g.st.stage != 0 && g.st.previous_stage == 0 {
            Some("Clock found")
        } else if g.st.phase_locked && !g.st.was_phase_locked {
            Some("Phase locked")
        } else if !g.st.phase_locked && g.st.was_phase_locked {
            Some("Phase lock lost")
        } else {
            None
        };
        if let Some(message) = message {
            log::info!("{}: {}", self.cfg.name, message);
        }

        g.st.report_age += 1;
        if g.st.stage != g.st.previous_stage
            || g.st.was_sync != g.st.sync
            || g.st.report_age > g.tune.report_interval
        {
            self.status.write_line(&format!(
                "{}s{} {}\n",
                self.cfg.status_prefix,
                g.st.stage,
                g.st.sync.as_int()
            ));
            g.st.report_age = 0;
        }

        if g.tune.verbose {
            self.status.write_line(&format!(
                "{}v{} {} {}\n",
                self.cfg.status_prefix, g.st.frequency_error, g.st.phase_error, g.st.dac
            ));
        }

        g.st.was_phase_locked = g.st.phase_locked;
        g.st.previous_stage = g.st.stage;
        g.st.was_sync = g.st.sync;
    }

    // ========================================================================
    // Stage controllers
    // ========================================================================

    /// Frequency seek: offset the DAC in proportion to the frequency
    /// error. A pure integration controller on frequency error, or
    /// equivalently a pure proportional controller on phase error.
    fn run_freq_seek(&self, g: &mut MutexGuard<'_, Shared>) -> i32 {
        while self.running() {
            if !self.update_clock(g, false, PhaseGate::Unlocked) {
                // Open loop engaging is an invalid stage, not a lost clock.
                return if g.st.open_loop { -1 } else { 0 };
            }
            let gain = match &g.stages[g.st.stage - 1] {
                Stage::FreqSeek(p) => p.gain as i64,
                _ => return -1,
            };
            let target = g.st.dac as i64 + gain * g.st.frequency_error as i64;
            self.set_dac(g, target);
            self.report_state(g);

            if g.st.frequency_error.abs() <= 1 {
                return 1;
            }
        }
        0
    }

    /// Coarse phase lock: seek the target phase as quickly as possible
    /// without worrying too much about long term stability.
    fn run_phase_lock(&self, g: &mut MutexGuard<'_, Shared>) -> i32 {
        // Integrated error for the PI loop.
        let mut ti: i64 = 0;
        // Smoothed squared error for lock detection.
        let mut var_err: f64 = 1e2;
        // All DAC computations are offsets from the DAC value on entry.
        let nominal_dac = g.st.dac as i64;
        // At the end of lock-in we oscillate around the target DAC
        // setting; the exit value is the mean of the recent history.
        let mut history = [nominal_dac; DAC_HISTORY];

        while self.running() {
            if !self.update_clock(g, false, PhaseGate::Wide) {
                return 0;
            }
            let (kp, ki, smoothing, max_phase_error) = match &g.stages[g.st.stage - 1] {
                Stage::PhaseLock(p) => (p.kp as i64, p.ki as i64, p.smoothing, p.max_phase_error),
                _ => return -1,
            };
            let error = g.st.phase_error as i64;
            ti += error;
            let target = nominal_dac + kp * error + ki * ti;
            history.copy_within(0..DAC_HISTORY - 1, 1);
            history[0] = target;

            // Anti-windup: when the DAC hits a limit, integrating further
            // would overcompensate and oscillate, while resetting the
            // integrator can bounce off the limits forever. Simply skip
            // this tick's contribution instead.
            if target <= 0 || target >= 0xFFFF {
                ti -= error;
            }

            self.set_dac(g, target);
            self.report_state(g);

            if error.abs() > max_phase_error as i64 {
                // Phase error too large: hand control back to the
                // frequency seeking stage.
                return -1;
            }

            var_err = smoothing * (error * error) as f64 + (1.0 - smoothing) * var_err;
            if var_err < 2.0 {
                let mean: i64 = history.iter().sum::<i64>() / DAC_HISTORY as i64;
                g.st.dac = mean.clamp(0, 0xFFFF) as u16;
                return 1;
            }
        }
        0
    }

    /// Narrow lock: general IIR filter on phase error, abandoned if the
    /// error grows beyond +-2 sample clocks.
    fn run_filter(&self, g: &mut MutexGuard<'_, Shared>) -> i32 {
        let order = match &g.stages[g.st.stage - 1] {
            Stage::Filter(p) => p.order(),
            _ => return -1,
        };
        let mut last_error = vec![0.0f64; order];
        let mut last_out = vec![0.0f64; order];
        let nominal_dac = g.st.dac as i64;

        while self.running() {
            if !self.update_clock(g, false, PhaseGate::Narrow) {
                return 0;
            }
            let (x, y) = match &g.stages[g.st.stage - 1] {
                Stage::Filter(p) => {
                    let x = g.st.phase_error as f64 + p.dither;
                    let mut y = p.coeff.first().map_or(0.0, |c| c.b * x);
                    for k in 0..order.min(p.order()) {
                        y += p.coeff[k + 1].b * last_error[k] - p.coeff[k + 1].a * last_out[k];
                    }
                    (x, y)
                }
                _ => return -1,
            };
            if order > 0 {
                last_error.pop();
                last_error.insert(0, x);
                last_out.pop();
                last_out.insert(0, y);
            }

            self.set_dac(g, nominal_dac + y.round() as i64);
            self.report_state(g);

            if g.st.phase_error.abs() > 2 {
                // Drop back to the faster filter.
                return -1;
            }
        }
        0
    }

    // ========================================================================
    // Supervisor
    // ========================================================================

    /// Capture the clock from cold: stage 0, not phase locked, notify the
    /// driver with nominal values until a reading succeeds.
    fn run_get_clock(&self, g: &mut MutexGuard<'_, Shared>) {
        self.drop_sync(g, "clock lost");
        g.st.phase_locked = false;
        g.st.stage = 0;
        loop {
            // While the clock is lost, fake the frequency to the nominal
            // value so the driver keeps a sane setting.
            let advance = self.nominal_advance(g);
            self.io.notify(advance, 0, false);
            self.report_state(g);
            if self.get_clock(g) || !self.running() {
                break;
            }
        }
        g.st.nominal_clock = g.st.clock;
    }

    /// Open-loop monitor: error terms are calculated and reported, but the
    /// DAC is never written by the servo.
    fn run_open_loop(&self, g: &mut MutexGuard<'_, Shared>) {
        let previous_stage = g.st.stage;
        g.st.stage = g.stages.len() + 1;
        while g.st.open_loop && self.running() {
            let gate = if g.st.phase_locked {
                PhaseGate::Wide
            } else {
                PhaseGate::Unlocked
            };
            if !self.update_clock(g, true, gate) {
                break;
            }
            self.report_state(g);
        }
        g.st.stage = previous_stage;
    }

    /// Run the regular stage cascade until open loop is selected or the
    /// clock is lost.
    fn run_stages(&self, g: &mut MutexGuard<'_, Shared>) {
        while g.st.clock_ok && !g.st.open_loop && self.running() {
            let kind = g.stages[g.st.stage - 1].kind();
            let verdict = match kind {
                StageKind::FreqSeek => self.run_freq_seek(g),
                StageKind::PhaseLock => self.run_phase_lock(g),
                StageKind::Filter => self.run_filter(g),
            };
            let stage_count = g.stages.len() as i32;
            g.st.stage = (g.st.stage as i32 + verdict).clamp(1, stage_count) as usize;
        }
    }

    fn run(self: &Arc<Self>) {
        let mut g = self.shared.lock();
        while self.running() {
            self.run_get_clock(&mut g);
            if !self.running() {
                break;
            }
            g.st.stage = 1;
            while g.st.clock_ok && self.running() {
                if g.st.open_loop {
                    self.run_open_loop(&mut g);
                } else {
                    self.run_stages(&mut g);
                }
            }
        }
    }

    // ========================================================================
    // Command interpreter
    // ========================================================================

    /// Dispatch one single-character command (with its ASCII integer
    /// argument) under the controller lock.
    ///
    /// Normal operation: `o` frequency offset, `p` phase offset, `s`
    /// synchronisation control, `v` verbosity. Diagnostic use: `c` open
    /// loop, `d` direct DAC write, `i` report interval, `W` stage
    /// parameter access.
    pub fn command(&self, command: &str) {
        let mut g = self.shared.lock();
        let Some(op) = command.chars().next() else {
            log::error!("{}: empty command", self.cfg.name);
            return;
        };
        let arg = parse_int(&command[op.len_utf8()..]);
        match op {
            'o' => self.set_frequency_offset(&mut g, arg),
            'p' => self.set_phase_offset(&mut g, arg),
            's' => self.set_synchronisation(&mut g, arg),
            'c' => g.st.open_loop = arg != 0,
            'd' => {
                if g.st.open_loop {
                    self.set_dac(&mut g, arg as i64);
                }
            }
            'v' => g.tune.verbose = arg != 0,
            'i' => g.tune.report_interval = arg,
            'W' => self.stage_write(&mut g, command),
            _ => log::error!("{}: unknown command \"{}\"", self.cfg.name, command),
        }
    }

    /// Changing the detune drops the synchronisation flag.
    fn set_frequency_offset(&self, g: &mut Shared, offset: i32) {
        if offset != g.tune.frequency_offset {
            self.drop_sync(g, "frequency offset changed");
            g.tune.frequency_offset = offset;
        }
    }

    /// Move the phase relative to the synchronised trigger point.
    fn set_phase_offset(&self, g: &mut Shared, offset: i32) {
        // A new phase offset can introduce a massive (deliberate) phase
        // delta, so temporarily open the slewing interval rather than
        // dropping synchronisation. The +10 covers trivial overshoot.
        if (g.tune.phase_offset as i64 - offset as i64).abs() + 10
            > self.cfg.normal_phase_error as i64
        {
            g.st.slewing = true;
        }
        g.tune.phase_offset = offset;
    }

    /// `s1` starts tracking before a synchronisation trigger is generated,
    /// `s2` confirms successful synchronisation.
    fn set_synchronisation(&self, g: &mut Shared, arg: i32) {
        match SyncState::from_int(arg) {
            Some(SyncState::None) => self.drop_sync(g, "explicitly dropped"),
            Some(SyncState::Tracking) => {
                // Only allow tracking while phase locked.
                if g.st.phase_locked {
                    g.st.sync = SyncState::Tracking;
                    g.st.slewing = true;
                }
            }
            Some(SyncState::Synchronised) => {
                // A jump from no-sync to synchronised means the
                // synchronisation got lost somewhere; refuse it.
                if g.st.sync == SyncState::Tracking {
                    log::info!("{}: Synchronised to trigger", self.cfg.name);
                    g.st.sync = SyncState::Synchronised;
                }
            }
            None => {}
        }
    }

    /// Diagnostic stage parameter access, format `W<ch><stage> <idx> <val>`
    /// with `ch` one of `I`/`F` (write int/float) or `i`/`f` (read).
    fn stage_write(&self, g: &mut Shared, command: &str) {
        let mut chars = command.chars();
        chars.next(); // 'W'
        let Some(kind) = chars.next() else {
            log::error!("{}: invalid stage write \"{}\"", self.cfg.name, command);
            return;
        };
        let mut fields = chars.as_str().split_whitespace();
        let stage = fields.next().and_then(|f| f.parse::<usize>().ok());
        let index = fields.next().and_then(|f| f.parse::<usize>().ok());
        let (Some(stage), Some(index)) = (stage, index) else {
            log::error!("{}: invalid stage write \"{}\"", self.cfg.name, command);
            return;
        };
        let Some(slot) = g.stages.get_mut(stage) else {
            log::error!("{}: no stage {} in \"{}\"", self.cfg.name, stage, command);
            return;
        };
        match kind {
            'I' => {
                if let Some(value) = fields.next().and_then(|f| f.parse::<i32>().ok()) {
                    if slot.write_int(index, value) {
                        log::info!("WI {} {} {}", stage, index, value);
                        return;
                    }
                }
            }
            'F' => {
                if let Some(value) = fields.next().and_then(|f| f.parse::<f64>().ok()) {
                    if slot.write_float(index, value) {
                        log::info!("WF {} {} {}", stage, index, value);
                        return;
                    }
                }
            }
            'i' => {
                if let Some(value) = slot.read_int(index) {
                    log::info!("i {} {} = {}", stage, index, value);
                    return;
                }
            }
            'f' => {
                if let Some(value) = slot.read_float(index) {
                    log::info!("f {} {} = {}", stage, index, value);
                    return;
                }
            }
            _ => {}
        }
        log::error!("{}: invalid stage write \"{}\"", self.cfg.name, command);
    }
}

/// Truncate a clock offset to a 32-bit value.
fn clip_to_i32(value: i64) -> i32 {
    value.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// C `atoi` semantics: optional sign and leading digits, 0 otherwise.
fn parse_int(s: &str) -> i32 {
    let s = s.trim_start();
    let mut end = 0;
    for (i, c) in s.char_indices() {
        if (i == 0 && (c == '-' || c == '+')) || c.is_ascii_digit() {
            end = i + c.len_utf8();
        } else {
            break;
        }
    }
    s[..end].parse().unwrap_or(0)
}
