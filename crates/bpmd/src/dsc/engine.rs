// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The compensation engine: round-robin scheduler, operating modes,
//! client request handling and the coefficient stores.
//!
//! The engine owns the coefficient table, the register file and the
//! acquisition sources. A daemon drives it from a single thread: one
//! [`tick`](DscEngine::tick) roughly every three seconds, interleaved
//! with [`handle_request`](DscEngine::handle_request) calls for client
//! traffic. All mutation happens on that thread; concurrency lives at
//! the daemon layer.

use super::agc::{self, AgcState};
use super::protocol::{self, Request, RequestKind};
use super::registers::RegisterFile;
use super::schedule::AttenuatorSchedule;
use super::table::{CoefficientStore, CoefficientTable, LastGoodStore, StoreError, AMP_VALID};
use super::{
    amplitude, phase, AcqGeometry, DscError, CHANNELS, FIXED_PATTERN, MAX_SWITCH_POSITIONS,
    ROTATING_PATTERN, SWITCH_POSITIONS, SW_TABLE,
};
use crate::hw::{AdcSource, AdcTrigger, RegisterBus, TbtSource};
use std::path::PathBuf;

/// Scheduler period between compensation ticks.
pub const TICK_PERIOD: std::time::Duration = std::time::Duration::from_secs(3);

/// Reply status for a rate-limited last-good save.
pub const STATUS_TRY_AGAIN: i32 = -libc::EAGAIN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DscMode {
    Off,
    Unity,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgcMode {
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchSelect {
    Fixed(u8),
    Auto,
}

impl SwitchSelect {
    fn as_value(self) -> i32 {
        match self {
            SwitchSelect::Fixed(p) => p as i32,
            SwitchSelect::Auto => protocol::SWITCH_AUTO,
        }
    }
}

/// Fixed configuration of the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub geometry: AcqGeometry,
    /// RAM-backed snapshot, read at startup and written on shutdown.
    pub volatile_store: PathBuf,
    /// Flash-backed snapshot, read as fallback, written on request.
    pub lastgood_store: PathBuf,
    /// Mount point remounted read-write around last-good saves.
    pub lastgood_remount: Option<PathBuf>,
}

pub struct DscEngine<B: RegisterBus> {
    geometry: AcqGeometry,
    regs: RegisterFile<B>,
    tbt: Box<dyn TbtSource>,
    adc: Box<dyn AdcSource>,
    schedule: AttenuatorSchedule,
    table: CoefficientTable,
    volatile: CoefficientStore,
    lastgood: LastGoodStore,

    mode: DscMode,
    agc: AgcMode,
    switch: SwitchSelect,
    pattern: [u32; SWITCH_POSITIONS],
    level: i32,
    att_sum: i32,
    agc_state: AgcState,

    // Histories for change detection in apply_settings.
    old_mode: Option<DscMode>,
    old_switch: Option<SwitchSelect>,
    old_level: Option<i32>,

    rotation: usize,
}

impl<B: RegisterBus> DscEngine<B> {
    pub fn new(
        config: EngineConfig,
        schedule: AttenuatorSchedule,
        bus: B,
        tbt: Box<dyn TbtSource>,
        adc: Box<dyn AdcSource>,
    ) -> Result<Self, DscError> {
        let geometry = config.geometry;
        let mut regs = RegisterFile::new(bus, geometry.f_samp(), geometry.f_if());
        regs.set_a2d_delay(geometry.a2d_delay)?;

        let volatile = CoefficientStore::new(&config.volatile_store);
        let lastgood = LastGoodStore::new(&config.lastgood_store, config.lastgood_remount);
        let table = match volatile.load() {
            Ok(table) => table,
            Err(e) => {
                log::error!("[DSC] {}: {}", volatile.path().display(), e);
                match lastgood.load() {
                    Ok(table) => table,
                    Err(e) => {
                        log::error!("[DSC] {}: {}", lastgood.path().display(), e);
                        CoefficientTable::unity()
                    }
                }
            }
        };

        let agc_state = AgcState::new(&geometry);
        let level = schedule.highest();
        let mut engine = Self {
            geometry,
            regs,
            tbt,
            adc,
            schedule,
            table,
            volatile,
            lastgood,
            mode: DscMode::Off,
            agc: AgcMode::Manual,
            switch: SwitchSelect::Fixed(3),
            pattern: FIXED_PATTERN,
            level,
            att_sum: 0,
            agc_state,
            old_mode: None,
            old_switch: None,
            old_level: None,
            rotation: 0,
        };

        engine
            .regs
            .set_tbt_marker(engine.pattern[0], engine.geometry.marker_delay)?;
        engine.regs.set_switch_pattern(&engine.pattern)?;
        engine.adc.arm(
            engine.pattern[0],
            super::ADC_TRIGGER_DELAY,
            AdcTrigger::External,
            false,
        )?;
        engine.apply_settings()?;
        Ok(engine)
    }

    pub fn mode(&self) -> DscMode {
        self.mode
    }

    pub fn agc_mode(&self) -> AgcMode {
        self.agc
    }

    pub fn level(&self) -> i32 {
        self.level
    }

    pub fn table(&self) -> &CoefficientTable {
        &self.table
    }

    pub fn registers(&self) -> &RegisterFile<B> {
        &self.regs
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    /// One scheduler tick: run the next compensation method in the fixed
    /// rotation gain, amplitude, phase, crosstalk.
    pub fn tick(&mut self) -> Result<(), DscError> {
        let step = self.rotation % 4;
        self.rotation += 1;
        match step {
            0 => self.tick_gain(),
            1 => self.tick_amplitude(),
            2 => self.tick_phase(),
            _ => self.tick_crosstalk(),
        }
    }

    fn tick_gain(&mut self) -> Result<(), DscError> {
        if self.agc != AgcMode::Auto {
            return Ok(());
        }
        log::debug!("[DSC] compensating gain (AGC)");
        let new_level = agc::compensate(
            self.adc.as_ref(),
            &self.geometry,
            &self.schedule,
            &mut self.agc_state,
            &self.pattern,
            self.switch == SwitchSelect::Auto,
            self.level,
            self.att_sum,
        )?;
        if new_level != self.level {
            self.level = new_level;
            self.apply_settings()?;
        }
        Ok(())
    }

    fn tick_amplitude(&mut self) -> Result<(), DscError> {
        if self.mode != DscMode::Auto {
            return Ok(());
        }
        log::debug!("[DSC] compensating amplitudes");
        let record = self.table.record_mut(self.level);
        amplitude::compensate(
            self.tbt.as_ref(),
            &self.geometry,
            record,
            &mut self.regs,
            &self.pattern,
        )?;
        Ok(())
    }

    fn tick_phase(&mut self) -> Result<(), DscError> {
        if self.mode != DscMode::Auto {
            return Ok(());
        }
        // Phase refinement is meaningless until the amplitudes of this
        // power level have been calibrated at least once.
        if self.table.record(self.level).status & AMP_VALID == 0 {
            return Ok(());
        }
        log::debug!("[DSC] compensating phase");
        let record = self.table.record_mut(self.level);
        phase::compensate(
            self.tbt.as_ref(),
            &self.geometry,
            record,
            &mut self.regs,
            &self.pattern,
        )?;
        Ok(())
    }

    fn tick_crosstalk(&mut self) -> Result<(), DscError> {
        // Reserved: the de-switching matrices are static for now.
        log::debug!("[DSC] compensating crosstalk (reserved)");
        Ok(())
    }

    // ========================================================================
    // Client requests
    // ========================================================================

    /// Handle one validated-or-not client request, filling in the reply
    /// status (and value for the getters).
    pub fn handle_request(&mut self, request: &mut Request) {
        let kind = match request.validate() {
            Ok(kind) => kind,
            Err(e) => {
                log::error!("[DSC] bogus request: {}", e);
                request.status = -1;
                return;
            }
        };
        request.status = match kind {
            RequestKind::SetAgc => self.set_agc(request.value),
            RequestKind::GetAgc => {
                request.value = match self.agc {
                    AgcMode::Manual => protocol::AGC_MANUAL,
                    AgcMode::Auto => protocol::AGC_AUTO,
                };
                0
            }
            RequestKind::SetDsc => self.set_dsc(request.value),
            RequestKind::GetDsc => {
                request.value = match self.mode {
                    DscMode::Off => protocol::DSC_OFF,
                    DscMode::Unity => protocol::DSC_UNITY,
                    DscMode::Auto => protocol::DSC_AUTO,
                };
                0
            }
            RequestKind::SetGain => self.set_gain(request.value),
            RequestKind::GetGain => {
                request.value = self.level;
                0
            }
            RequestKind::SetSwitch => self.set_switch(request.value),
            RequestKind::GetSwitch => {
                request.value = self.switch.as_value();
                0
            }
        };
    }

    fn set_agc(&mut self, value: i32) -> i32 {
        let mode = match value {
            protocol::AGC_MANUAL => AgcMode::Manual,
            protocol::AGC_AUTO => AgcMode::Auto,
            _ => return -1,
        };
        self.agc = mode;
        self.checked_apply()
    }

    fn set_dsc(&mut self, value: i32) -> i32 {
        match value {
            protocol::DSC_OFF => {
                self.mode = DscMode::Off;
                self.checked_apply()
            }
            protocol::DSC_UNITY => {
                self.mode = DscMode::Unity;
                self.checked_apply()
            }
            protocol::DSC_AUTO => {
                self.mode = DscMode::Auto;
                // Automatic compensation needs the rotating sequence.
                self.set_switch(protocol::SWITCH_AUTO)
            }
            protocol::DSC_SAVE_LASTGOOD => match self.lastgood.save(&self.table) {
                Ok(()) => 0,
                Err(StoreError::TryAgain) => STATUS_TRY_AGAIN,
                Err(e) => {
                    log::error!("[DSC] last-good save failed: {}", e);
                    -1
                }
            },
            _ => -1,
        }
    }

    fn set_gain(&mut self, value: i32) -> i32 {
        let mut rc = 0;
        let mut level = value;
        if level > self.schedule.highest() || level < self.schedule.lowest() {
            // Outside the schedule: fall back to the highest known level.
            level = self.schedule.highest();
            rc = -1;
        }
        if self.agc == AgcMode::Manual {
            self.level = level;
            if self.checked_apply() != 0 {
                rc = -1;
            }
        } else {
            rc = -1;
        }
        rc
    }

    fn set_switch(&mut self, value: i32) -> i32 {
        if (0..MAX_SWITCH_POSITIONS as i32).contains(&value) {
            self.pattern = [value as u32; SWITCH_POSITIONS];
            self.switch = SwitchSelect::Fixed(value as u8);
            if self.mode == DscMode::Auto {
                // A pinned switch position ends automatic conditioning.
                self.mode = DscMode::Off;
            }
        } else {
            self.pattern = ROTATING_PATTERN;
            self.switch = SwitchSelect::Auto;
        }
        self.checked_apply()
    }

    fn checked_apply(&mut self) -> i32 {
        match self.apply_settings() {
            Ok(()) => 0,
            Err(e) => {
                log::error!("[DSC] applying settings failed: {}", e);
                -1
            }
        }
    }

    // ========================================================================
    // Settings application
    // ========================================================================

    /// Push the pattern, attenuators and coefficients for the current
    /// (mode, switch, level) to the hardware. Does nothing when none of
    /// the three changed since the last application.
    fn apply_settings(&mut self) -> Result<(), DscError> {
        self.level = self.schedule.clamp(self.level);

        let unchanged = self.old_level == Some(self.level)
            && self.old_mode == Some(self.mode)
            && self.old_switch == Some(self.switch);
        if !unchanged {
            self.regs.set_switch_pattern(&self.pattern)?;
            self.regs
                .set_tbt_marker(self.pattern[0], self.geometry.marker_delay)?;

            let entry = self.schedule.entry(self.level);
            let mut attenuators = [0u8; 8];
            for pair in 0..CHANNELS {
                attenuators[pair * 2] = entry.att1;
                attenuators[pair * 2 + 1] = entry.att2;
            }
            self.regs.set_attenuators(attenuators)?;
            self.att_sum = entry.att1 as i32 + entry.att2 as i32;

            match self.mode {
                DscMode::Unity => {
                    for position in 0..SWITCH_POSITIONS {
                        let absolute = self.pattern[position] as usize;
                        for channel in 0..CHANNELS {
                            let chain = SW_TABLE[absolute * CHANNELS + channel] as usize;
                            self.regs.set_gain(absolute, chain, 1.0)?;
                            self.regs.set_phase(absolute, chain, 0.0, 0.0)?;
                        }
                    }
                }
                _ => {
                    // Use whatever the table holds for this level,
                    // addressed through the rotating sequence whether or
                    // not the switches are currently rotating.
                    let record = *self.table.record(self.level);
                    for position in 0..SWITCH_POSITIONS {
                        let absolute = ROTATING_PATTERN[position] as usize;
                        for channel in 0..CHANNELS {
                            let chain = SW_TABLE[absolute * CHANNELS + channel] as usize;
                            self.regs.set_gain(
                                absolute,
                                chain,
                                record.amplitude[position][channel],
                            )?;
                            self.regs.set_phase(
                                absolute,
                                chain,
                                record.phase[position][channel],
                                0.0,
                            )?;
                        }
                    }
                }
            }
            self.regs.commit();
            log::debug!(
                "[DSC] applied settings: level {} dBm, mode {:?}, switch {:?}",
                self.level,
                self.mode,
                self.switch
            );
        }

        self.old_level = Some(self.level);
        self.old_mode = Some(self.mode);
        self.old_switch = Some(self.switch);
        Ok(())
    }

    /// Clean shutdown: snapshot the table to the volatile store and park
    /// the hardware on the pass-through position.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.volatile.save(&self.table) {
            log::error!("[DSC] volatile snapshot failed: {}", e);
        }
        self.set_switch(3);
        let _ = self
            .regs
            .set_tbt_marker(self.pattern[0], self.geometry.marker_delay);
        let _ = self.adc.arm(
            self.pattern[0],
            super::ADC_TRIGGER_DELAY,
            AdcTrigger::External,
            false,
        );
        self.regs.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::{MemBus, SimAdc, SimTbt};

    fn schedule() -> AttenuatorSchedule {
        let mut text = String::new();
        for level in -60..=0 {
            text.push_str(&format!("{} 15 14 0.25 2\n", level));
        }
        AttenuatorSchedule::parse(&text).unwrap()
    }

    fn engine_with(dir: &std::path::Path) -> DscEngine<MemBus> {
        let geometry = AcqGeometry {
            n_tbt: 20,
            ph_avg: 4,
            ..AcqGeometry::default()
        };
        let angle_step = 2.0 * std::f64::consts::PI * geometry.f_if() / geometry.f_samp();
        let config = EngineConfig {
            geometry,
            volatile_store: dir.join("volatile.dat"),
            lastgood_store: dir.join("lastgood.dat"),
            lastgood_remount: None,
        };
        DscEngine::new(
            config,
            schedule(),
            MemBus::new(),
            Box::new(SimTbt::new(20)),
            Box::new(SimAdc::new(angle_step, [800.0; 4])),
        )
        .unwrap()
    }

    fn request(kind: RequestKind, value: i32) -> Request {
        Request::new(kind, value)
    }

    #[test]
    fn starts_with_unity_table_when_stores_missing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with(dir.path());
        assert_eq!(engine.mode(), DscMode::Off);
        assert_eq!(engine.level(), 0);
        assert_eq!(engine.table().record(0).status, 0);
        // Highest schedule entry applied to the attenuators.
        assert_eq!(
            engine.registers().read_back_attenuators(),
            [15, 14, 15, 14, 15, 14, 15, 14]
        );
    }

    #[test]
    fn mode_and_switch_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(dir.path());

        let mut set = request(RequestKind::SetDsc, protocol::DSC_AUTO);
        engine.handle_request(&mut set);
        assert_eq!(set.status, 0);
        assert_eq!(engine.mode(), DscMode::Auto);
        // Auto conditioning forces the rotating sequence.
        let mut get = request(RequestKind::GetSwitch, 0);
        engine.handle_request(&mut get);
        assert_eq!(get.value, protocol::SWITCH_AUTO);

        // Pinning a switch position ends auto conditioning.
        let mut pin = request(RequestKind::SetSwitch, 5);
        engine.handle_request(&mut pin);
        assert_eq!(pin.status, 0);
        assert_eq!(engine.mode(), DscMode::Off);
        let mut get = request(RequestKind::GetSwitch, 0);
        engine.handle_request(&mut get);
        assert_eq!(get.value, 5);
    }

    #[test]
    fn manual_gain_respects_schedule_and_agc_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(dir.path());

        let mut set = request(RequestKind::SetGain, -20);
        engine.handle_request(&mut set);
        assert_eq!(set.status, 0);
        assert_eq!(engine.level(), -20);

        // Outside the schedule: highest level, error status.
        let mut set = request(RequestKind::SetGain, 20);
        engine.handle_request(&mut set);
        assert_eq!(set.status, -1);
        assert_eq!(engine.level(), 0);

        // In AGC auto the manual setter is refused.
        let mut agc = request(RequestKind::SetAgc, protocol::AGC_AUTO);
        engine.handle_request(&mut agc);
        let mut set = request(RequestKind::SetGain, -10);
        engine.handle_request(&mut set);
        assert_eq!(set.status, -1);
    }

    #[test]
    fn save_lastgood_is_rate_limited() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(dir.path());
        let mut save = request(RequestKind::SetDsc, protocol::DSC_SAVE_LASTGOOD);
        engine.handle_request(&mut save);
        assert_eq!(save.status, 0);
        let mut again = request(RequestKind::SetDsc, protocol::DSC_SAVE_LASTGOOD);
        engine.handle_request(&mut again);
        assert_eq!(again.status, STATUS_TRY_AGAIN);
    }

    #[test]
    fn auto_mode_ticks_calibrate_amplitude_then_phase() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(dir.path());
        let mut auto = request(RequestKind::SetDsc, protocol::DSC_AUTO);
        engine.handle_request(&mut auto);

        // gain (AGC manual: no-op), amplitude, phase, crosstalk.
        engine.tick().unwrap();
        engine.tick().unwrap();
        let after_amplitude = engine.table().record(engine.level()).status;
        assert_ne!(after_amplitude & AMP_VALID, 0);
        engine.tick().unwrap();
        let after_phase = engine.table().record(engine.level()).status;
        assert_ne!(after_phase & crate::dsc::table::PHASE_VALID, 0);
        engine.tick().unwrap();
    }

    #[test]
    fn off_mode_ticks_do_not_touch_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine_with(dir.path());
        for _ in 0..8 {
            engine.tick().unwrap();
        }
        assert_eq!(engine.table().record(engine.level()).status, 0);
    }

    #[test]
    fn shutdown_snapshots_volatile_store() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut engine = engine_with(dir.path());
            let mut auto = request(RequestKind::SetDsc, protocol::DSC_AUTO);
            engine.handle_request(&mut auto);
            engine.tick().unwrap(); // gain
            engine.tick().unwrap(); // amplitude
            engine.shutdown();
        }
        // A fresh engine picks the snapshot up from the volatile store.
        let engine = engine_with(dir.path());
        assert_ne!(engine.table().record(0).status & AMP_VALID, 0);
    }
}
