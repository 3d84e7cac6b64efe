// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Double-buffered signal-conditioning register file.
//!
//! The hardware holds two copies of every conditioning block (switch
//! pattern, phase/gain multipliers, crosstalk matrices, attenuators);
//! a single select-register write flips which copy the datapath reads, so
//! a commit is atomic from the hardware's perspective. Writes here mutate
//! a staging image; [`commit`](RegisterFile::commit) pushes dirty blocks
//! to the inactive half and flips. Each block carries a dirty counter
//! initialised to 2 so that a change reaches both halves over the next
//! two commits.

use super::{CHANNELS, DE_SW_TABLE, MAX_SWITCH_POSITIONS};
use crate::hw::{AdcTrigger, RegisterBus};
use std::f64::consts::PI;
use std::time::Duration;
use thiserror::Error;

// Register block addresses.
const ADC_SCOPE_CTRL: u32 = 0x8000;
const ATT_L: u32 = 0xC008;
const ATT_H: u32 = 0xC00C;
const ATT_BANK_SIZE: u32 = 0x8;
const DOUBLE_BUFF_CR: u32 = 0xC024;
const DELAY_CR: u32 = 0xC028;
const ADC_TRIGGER_CR: u32 = 0xC02C;
const HIST_MARK_CR: u32 = 0xC030;
const PATTERN_BASE: u32 = 0xC800;
const PATTERN_HALF: u32 = 0x400;
const PHASE_GAIN_BASE: u32 = 0xE800;
const PHASE_GAIN_HALF: u32 = 0x200;
const XTALK_BASE: u32 = 0xF000;
const XTALK_HALF: u32 = 0x400;

/// Switch positions packed per 32-bit pattern word.
const POSITIONS_PER_WORD: usize = 8;
/// Phase & gain unity multiplier before the sine normalisation.
const PHGN_UNITY: f64 = 65536.0;
/// Largest representable phase/gain multiplier.
const MAX_K: i64 = 0x1FFFF;
/// Crosstalk unity gain, halved to keep the DDC out of overflow.
const XTALK_UNITY: f64 = 32768.0;
/// Largest representable crosstalk coefficient.
const MAX_XTALK: i64 = 0x1FFFF;
const MAX_DELAY: u32 = 1023;
const MAX_TRIGGER_DELAY: u32 = 0xFFFF;
const MIN_TRIGGER_DELAY: u32 = 0x0001;
const MAX_MARKER_DELAY: u32 = 0xFFFF;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegisterError {
    #[error("switch sequence length {0} is not a power of two in 1..=16")]
    BadPatternLength(usize),
    #[error("switch position {0} out of range")]
    BadPosition(u32),
    #[error("attenuator value {0} out of range")]
    BadAttenuator(u8),
    #[error("phase/gain multiplier out of range at ({0}, {1})")]
    CoefficientOutOfRange(usize, usize),
    #[error("crosstalk coefficient out of range")]
    XtalkOutOfRange,
    #[error("delay {0} too long")]
    DelayTooLong(u32),
    #[error("trigger delay {0} out of range")]
    TriggerDelayOutOfRange(u32),
    #[error("marker delay {0} out of range")]
    MarkerDelayOutOfRange(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Block {
    Pattern,
    PhaseGain,
    Xtalk,
    Attenuators,
    Delays,
}

const BLOCKS: usize = 5;

/// Staging image of everything the double-buffered half carries.
#[derive(Debug, Clone)]
struct Image {
    positions: Vec<u32>,
    a2d_delay: u32,
    gain: [[f32; CHANNELS]; MAX_SWITCH_POSITIONS],
    phase: [[f32; CHANNELS]; MAX_SWITCH_POSITIONS],
    xtalk: [[[f32; CHANNELS]; CHANNELS]; MAX_SWITCH_POSITIONS],
    attenuators: [u8; 8],
    detune: f64,
}

/// The double-buffered register file over a raw register bus.
pub struct RegisterFile<B: RegisterBus> {
    bus: B,
    image: Image,
    f_samp: f64,
    f_if: f64,
    /// Unity multiplier normalised by the IF rotation per sample.
    unity_norm: f64,
    /// Half currently read by the datapath; writes go to the other one.
    active: u32,
    dirty: [u8; BLOCKS],
}

impl<B: RegisterBus> RegisterFile<B> {
    /// Initial image: single pass-through position, unity gain, zero
    /// phase, de-switching crosstalk matrices, attenuators flat out.
    pub fn new(bus: B, f_samp: f64, f_if: f64) -> Self {
        let mut xtalk = [[[0.0; CHANNELS]; CHANNELS]; MAX_SWITCH_POSITIONS];
        for pos in 0..MAX_SWITCH_POSITIONS {
            for ch in 0..CHANNELS {
                // De-switching only: channel `ch` observes the button the
                // routing table says it does at this position.
                xtalk[pos][DE_SW_TABLE[pos * CHANNELS + ch] as usize][ch] = 1.0;
            }
        }
        Self {
            bus,
            image: Image {
                positions: vec![3],
                a2d_delay: 0,
                gain: [[1.0; CHANNELS]; MAX_SWITCH_POSITIONS],
                phase: [[0.0; CHANNELS]; MAX_SWITCH_POSITIONS],
                xtalk,
                attenuators: [super::MAX_ATTENUATOR; 8],
                detune: 0.0,
            },
            f_samp,
            f_if,
            unity_norm: PHGN_UNITY * (2.0 * PI * f_if / f_samp).sin(),
            // The hardware comes up reading the higher half.
            active: 1,
            dirty: [2; BLOCKS],
        }
    }

    fn mark(&mut self, block: Block) {
        self.dirty[block as usize] = 2;
    }

    fn inactive(&self) -> u32 {
        (self.active + 1) % 2
    }

    // ========================================================================
    // Staged writes
    // ========================================================================

    /// Switch sequence for the pattern generator. The length must be a
    /// power of two in `{1, 2, 4, 8, 16}`.
    pub fn set_switch_pattern(&mut self, positions: &[u32]) -> Result<(), RegisterError> {
        if !matches!(positions.len(), 1 | 2 | 4 | 8 | 16) {
            return Err(RegisterError::BadPatternLength(positions.len()));
        }
        if let Some(&bad) = positions
            .iter()
            .find(|&&p| p >= MAX_SWITCH_POSITIONS as u32)
        {
            return Err(RegisterError::BadPosition(bad));
        }
        self.image.positions = positions.to_vec();
        self.mark(Block::Pattern);
        Ok(())
    }

    pub fn set_gain(
        &mut self,
        position: usize,
        channel: usize,
        gain: f32,
    ) -> Result<(), RegisterError> {
        self.image.gain[position][channel] = gain;
        self.mark(Block::PhaseGain);
        self.check_phase_gain(position, channel)
    }

    /// Phase correction for one (position, channel) pair, together with
    /// the freshly measured IF detune shared by the whole block.
    pub fn set_phase(
        &mut self,
        position: usize,
        channel: usize,
        phase: f32,
        detune: f64,
    ) -> Result<(), RegisterError> {
        self.image.phase[position][channel] = phase;
        self.image.detune = detune;
        self.mark(Block::PhaseGain);
        self.check_phase_gain(position, channel)
    }

    pub fn set_xtalk(
        &mut self,
        position: usize,
        from: usize,
        to: usize,
        value: f32,
    ) -> Result<(), RegisterError> {
        self.image.xtalk[position][from][to] = value;
        self.mark(Block::Xtalk);
        if (value as f64 * XTALK_UNITY).abs() as i64 > MAX_XTALK {
            Err(RegisterError::XtalkOutOfRange)
        } else {
            Ok(())
        }
    }

    /// Attenuator values in the order A1, A2, B1, B2, C1, C2, D1, D2.
    pub fn set_attenuators(&mut self, attenuators: [u8; 8]) -> Result<(), RegisterError> {
        if let Some(&bad) = attenuators.iter().find(|&&a| a > super::MAX_ATTENUATOR) {
            return Err(RegisterError::BadAttenuator(bad));
        }
        self.image.attenuators = attenuators;
        self.mark(Block::Attenuators);
        Ok(())
    }

    pub fn set_a2d_delay(&mut self, delay: u32) -> Result<(), RegisterError> {
        if delay > MAX_DELAY {
            return Err(RegisterError::DelayTooLong(delay));
        }
        self.image.a2d_delay = delay;
        self.mark(Block::Delays);
        Ok(())
    }

    // ========================================================================
    // Immediate writes (not double-buffered)
    // ========================================================================

    /// Place the turn-by-turn marker on one switch position.
    pub fn set_tbt_marker(&self, position: u32, delay: u32) -> Result<(), RegisterError> {
        if position >= MAX_SWITCH_POSITIONS as u32 {
            return Err(RegisterError::BadPosition(position));
        }
        if delay > MAX_MARKER_DELAY {
            return Err(RegisterError::MarkerDelayOutOfRange(delay));
        }
        self.bus.write(HIST_MARK_CR, (position & 0xF) << 16 | delay);
        Ok(())
    }

    // ========================================================================
    // Commit
    // ========================================================================

    fn check_phase_gain(&self, position: usize, channel: usize) -> Result<(), RegisterError> {
        let (k1, k2) = self.multipliers(position, channel);
        if k1.abs() > MAX_K || k2.abs() > MAX_K {
            Err(RegisterError::CoefficientOutOfRange(position, channel))
        } else {
            Ok(())
        }
    }

    fn rotation(&self) -> f64 {
        2.0 * PI * (self.f_if + self.image.detune) / self.f_samp
    }

    /// Direct and delayed-path multipliers realising the gain and phase
    /// correction of one (position, channel) pair.
    fn multipliers(&self, position: usize, channel: usize) -> (i64, i64) {
        let phase = self.image.phase[position][channel] as f64;
        let gain = self.image.gain[position][channel] as f64;
        let theta = self.rotation();
        let k1 = (-phase.sin() / theta.tan() + phase.cos()) * gain * self.unity_norm;
        let k2 = phase.sin() / theta.sin() * gain * self.unity_norm;
        (k1.round() as i64, k2.round() as i64)
    }

    fn write_pattern(&self, half: u32) {
        let words = (PATTERN_HALF / 4) as usize;
        let len = self.image.positions.len();
        for word in 0..words {
            let mut value = 0u32;
            for slot in 0..POSITIONS_PER_WORD {
                let position = self.image.positions[(word * POSITIONS_PER_WORD + slot) % len];
                value |= position << (slot * 4);
            }
            self.bus
                .write(PATTERN_BASE + half * PATTERN_HALF + word as u32 * 4, value);
        }
    }

    fn write_phase_gain(&self, half: u32) {
        for channel in 0..CHANNELS {
            for position in 0..MAX_SWITCH_POSITIONS {
                let (k1, k2) = self.multipliers(position, channel);
                let offset = (128 * channel + position * 8) as u32;
                let base = PHASE_GAIN_BASE + half * PHASE_GAIN_HALF + offset;
                self.bus.write(base, k1 as u32);
                self.bus.write(base + 4, k2 as u32);
            }
        }
    }

    fn write_xtalk(&self, half: u32) {
        for position in 0..MAX_SWITCH_POSITIONS {
            for from in 0..CHANNELS {
                for to in 0..CHANNELS {
                    let word = to * 64 + (from / 2) * 32 + position * 2 + from % 2;
                    let value =
                        (self.image.xtalk[position][from][to] as f64 * XTALK_UNITY) as i64;
                    self.bus.write(
                        XTALK_BASE + half * XTALK_HALF + word as u32 * 4,
                        value as u32,
                    );
                }
            }
        }
    }

    fn write_attenuators(&self, half: u32) {
        let att = &self.image.attenuators;
        let low = (att[7] as u32 & 0x1F) << 24
            | (att[6] as u32 & 0x1F) << 16
            | (att[5] as u32 & 0x1F) << 8
            | (att[4] as u32 & 0x1F);
        self.bus.write(ATT_L + half * ATT_BANK_SIZE, low);
        let high = (att[3] as u32 & 0x1F) << 24
            | (att[2] as u32 & 0x1F) << 16
            | (att[1] as u32 & 0x1F) << 8
            | (att[0] as u32 & 0x1F);
        self.bus.write(ATT_H + half * ATT_BANK_SIZE, high);
    }

    fn write_delays(&self) {
        self.bus.write(DELAY_CR, self.image.a2d_delay << 16);
    }

    /// Push every dirty block to the inactive half and flip the select
    /// register. No-op when nothing has changed since the last flip.
    /// Returns whether a flip happened.
    pub fn commit(&mut self) -> bool {
        if self.dirty.iter().all(|&d| d == 0) {
            return false;
        }
        let half = self.inactive();
        for block in [
            Block::Pattern,
            Block::PhaseGain,
            Block::Xtalk,
            Block::Attenuators,
            Block::Delays,
        ] {
            if self.dirty[block as usize] == 0 {
                continue;
            }
            match block {
                Block::Pattern => self.write_pattern(half),
                Block::PhaseGain => self.write_phase_gain(half),
                Block::Xtalk => self.write_xtalk(half),
                Block::Attenuators => self.write_attenuators(half),
                Block::Delays => self.write_delays(),
            }
            self.dirty[block as usize] -= 1;
        }
        self.active = half;
        self.bus.write(DOUBLE_BUFF_CR, self.active);
        log::debug!("[DSC] register commit, active half {}", self.active);
        true
    }

    // ========================================================================
    // Read-back (from the half the datapath currently reads)
    // ========================================================================

    pub fn read_back_attenuators(&self) -> [u8; 8] {
        let low = self.bus.read(ATT_L + self.active * ATT_BANK_SIZE);
        let high = self.bus.read(ATT_H + self.active * ATT_BANK_SIZE);
        [
            (high & 0x1F) as u8,
            (high >> 8 & 0x1F) as u8,
            (high >> 16 & 0x1F) as u8,
            (high >> 24 & 0x1F) as u8,
            (low & 0x1F) as u8,
            (low >> 8 & 0x1F) as u8,
            (low >> 16 & 0x1F) as u8,
            (low >> 24 & 0x1F) as u8,
        ]
    }

    pub fn read_back_pattern(&self, length: usize) -> Vec<u32> {
        let word = self.bus.read(PATTERN_BASE + self.active * PATTERN_HALF);
        (0..length.min(POSITIONS_PER_WORD))
            .map(|slot| word >> (slot * 4) & 0xF)
            .collect()
    }

    /// Invert the committed multiplier pair back into (gain, phase).
    pub fn read_back_gain_phase(&self, position: usize, channel: usize) -> (f64, f64) {
        let offset = (128 * channel + position * 8) as u32;
        let base = PHASE_GAIN_BASE + self.active * PHASE_GAIN_HALF + offset;
        let k1 = self.bus.read(base) as i32 as f64;
        let k2 = self.bus.read(base + 4) as i32 as f64;
        let theta = self.rotation();
        let re = k1 + k2 * theta.cos();
        let im = k2 * theta.sin();
        let gain = re.hypot(im) / self.unity_norm;
        let phase = im.atan2(re);
        (gain, phase)
    }
}

/// Arm the ADC snapshot trigger. A forced trigger re-writes the arm bit
/// until the hardware reports it fired. Used by device-backed
/// [`AdcSource`](crate::hw::AdcSource) implementations; the simulated
/// source models the same contract in memory.
pub fn arm_snapshot_trigger(
    bus: &impl RegisterBus,
    position: u32,
    delay: u32,
    trigger: AdcTrigger,
    forced: bool,
) -> Result<(), RegisterError> {
    if position >= MAX_SWITCH_POSITIONS as u32 {
        return Err(RegisterError::BadPosition(position));
    }
    if delay > MAX_TRIGGER_DELAY {
        return Err(RegisterError::TriggerDelayOutOfRange(delay));
    }
    let delay = delay.max(MIN_TRIGGER_DELAY);
    // External triggering cannot be forced.
    let forced = forced && trigger == AdcTrigger::Conditioning;
    let internal = trigger == AdcTrigger::Conditioning;

    bus.write(ADC_SCOPE_CTRL, internal as u32);
    let mut value = (position & 0xF) << 16 | delay;
    if internal {
        value |= 0x8000_0000;
    }
    bus.write(ADC_TRIGGER_CR, value);
    if forced {
        bus.write(ADC_TRIGGER_CR, value);
        if bus.read(ADC_TRIGGER_CR) & 0x8000_0000 != 0 {
            // Accidentally still armed: one more write forces it.
            bus.write(ADC_TRIGGER_CR, value);
        }
    }
    Ok(())
}

/// Poll the trigger-armed bit until it clears or `timeout` expires.
pub fn poll_snapshot_trigger(bus: &impl RegisterBus, timeout: Duration) -> bool {
    let step = Duration::from_millis(10);
    let mut remaining = timeout;
    while bus.read(ADC_TRIGGER_CR) & 0x8000_0000 != 0 {
        if remaining < step {
            return false;
        }
        std::thread::sleep(step);
        remaining -= step;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::MemBus;

    fn file() -> RegisterFile<MemBus> {
        RegisterFile::new(MemBus::new(), 117_440_042.735, 29_893_829.0598)
    }

    #[test]
    fn pattern_length_must_be_power_of_two() {
        let mut regs = file();
        for len in [1usize, 2, 4, 8, 16] {
            let pattern: Vec<u32> = (0..len as u32).collect();
            regs.set_switch_pattern(&pattern).unwrap();
        }
        for len in [0usize, 3, 5, 6, 7, 9, 32] {
            let pattern: Vec<u32> = vec![0; len];
            assert_eq!(
                regs.set_switch_pattern(&pattern),
                Err(RegisterError::BadPatternLength(len))
            );
        }
        assert_eq!(
            regs.set_switch_pattern(&[16]),
            Err(RegisterError::BadPosition(16))
        );
    }

    #[test]
    fn attenuator_range_enforced() {
        let mut regs = file();
        assert_eq!(
            regs.set_attenuators([32, 0, 0, 0, 0, 0, 0, 0]),
            Err(RegisterError::BadAttenuator(32))
        );
        regs.set_attenuators([31, 0, 1, 2, 3, 4, 5, 6]).unwrap();
    }

    #[test]
    fn commit_round_trips_attenuators_and_pattern() {
        let mut regs = file();
        let pattern = crate::dsc::ROTATING_PATTERN;
        regs.set_switch_pattern(&pattern).unwrap();
        regs.set_attenuators([1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        assert!(regs.commit());
        assert_eq!(regs.read_back_attenuators(), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(regs.read_back_pattern(8), pattern.to_vec());
    }

    #[test]
    fn commit_round_trips_gain_and_phase() {
        let mut regs = file();
        regs.set_gain(5, 2, 1.25).unwrap();
        regs.set_phase(5, 2, 0.4, 120.0).unwrap();
        regs.commit();
        let (gain, phase) = regs.read_back_gain_phase(5, 2);
        assert!((gain - 1.25).abs() < 1e-3, "gain {}", gain);
        assert!((phase - 0.4).abs() < 1e-3, "phase {}", phase);
    }

    #[test]
    fn dirty_counters_refresh_both_halves() {
        let mut regs = file();
        regs.set_attenuators([9; 8]).unwrap();
        assert!(regs.commit());
        let first_half = regs.active;
        // Second commit refreshes the other half even with no new writes.
        assert!(regs.commit());
        assert_ne!(regs.active, first_half);
        assert_eq!(regs.read_back_attenuators(), [9; 8]);
        // Everything refreshed on both halves: nothing left to do.
        assert!(!regs.commit());
    }

    #[test]
    fn snapshot_trigger_validation() {
        let bus = MemBus::new();
        arm_snapshot_trigger(&bus, 3, 0x400, AdcTrigger::Conditioning, true).unwrap();
        assert_eq!(
            arm_snapshot_trigger(&bus, 16, 0x400, AdcTrigger::External, false),
            Err(RegisterError::BadPosition(16))
        );
        assert_eq!(
            arm_snapshot_trigger(&bus, 3, 0x1_0000, AdcTrigger::External, false),
            Err(RegisterError::TriggerDelayOutOfRange(0x1_0000))
        );
        // The external trigger path leaves the arm bit clear, so a poll
        // returns immediately.
        arm_snapshot_trigger(&bus, 3, 0x400, AdcTrigger::External, false).unwrap();
        assert!(poll_snapshot_trigger(&bus, Duration::from_millis(20)));
    }
}
