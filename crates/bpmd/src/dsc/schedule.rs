// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Attenuator schedule.
//!
//! Text configuration mapping input power in dBm to the attenuator pair,
//! the AGC hysteresis width and the settling time, loaded once at daemon
//! startup. One `<power> <att1> <att2> <hysteresis> <time>` record per
//! line, `#` comments allowed; the covered power range must be
//! contiguous.

use super::table::{MAX_POWER_DBM, MIN_POWER_DBM, POWER_LEVELS};
use super::MAX_ATTENUATOR;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Maximum reasonable hysteresis width in dB.
pub const MAX_HYSTERESIS: f32 = 1.0;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("line {line}: malformed schedule entry")]
    Malformed { line: usize },
    #[error("line {line}: attenuator value outside limits")]
    BadAttenuator { line: usize },
    #[error("line {line}: input level outside limits")]
    BadLevel { line: usize },
    #[error("line {line}: hysteresis outside limits")]
    BadHysteresis { line: usize },
    #[error("missing entry for power level {level} dBm")]
    MissingLevel { level: i32 },
    #[error("schedule is empty")]
    Empty,
}

/// One schedule entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttEntry {
    pub att1: u8,
    pub att2: u8,
    /// Extra dB beyond the half-level boundary before the AGC steps.
    pub hysteresis: f32,
    /// Settling time after applying this entry.
    pub settle: u32,
}

/// The loaded schedule with its covered (contiguous) power range.
#[derive(Debug, Clone)]
pub struct AttenuatorSchedule {
    entries: Vec<Option<AttEntry>>,
    lowest: i32,
    highest: i32,
}

impl AttenuatorSchedule {
    pub fn load(path: &Path) -> Result<Self, ScheduleError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, ScheduleError> {
        let mut entries: Vec<Option<AttEntry>> = vec![None; POWER_LEVELS];
        let mut lowest = MAX_POWER_DBM;
        let mut highest = MIN_POWER_DBM;
        let mut seen = false;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut fields = trimmed.split_whitespace();
            let mut next_int = || fields.next().and_then(|f| f.parse::<i64>().ok());
            let level = next_int().ok_or(ScheduleError::Malformed { line })?;
            let att1 = next_int().ok_or(ScheduleError::Malformed { line })?;
            let att2 = next_int().ok_or(ScheduleError::Malformed { line })?;
            let hysteresis = fields
                .next()
                .and_then(|f| f.parse::<f32>().ok())
                .ok_or(ScheduleError::Malformed { line })?;
            let settle = fields
                .next()
                .and_then(|f| f.parse::<u32>().ok())
                .ok_or(ScheduleError::Malformed { line })?;

            if !(0..=MAX_ATTENUATOR as i64).contains(&att1)
                || !(0..=MAX_ATTENUATOR as i64).contains(&att2)
            {
                return Err(ScheduleError::BadAttenuator { line });
            }
            if !(MIN_POWER_DBM as i64..=MAX_POWER_DBM as i64).contains(&level) {
                return Err(ScheduleError::BadLevel { line });
            }
            if !(0.0..=MAX_HYSTERESIS).contains(&hysteresis) {
                return Err(ScheduleError::BadHysteresis { line });
            }

            let level = level as i32;
            entries[(level - MIN_POWER_DBM) as usize] = Some(AttEntry {
                att1: att1 as u8,
                att2: att2 as u8,
                hysteresis,
                settle,
            });
            lowest = lowest.min(level);
            highest = highest.max(level);
            seen = true;
        }

        if !seen {
            return Err(ScheduleError::Empty);
        }
        for level in lowest..=highest {
            if entries[(level - MIN_POWER_DBM) as usize].is_none() {
                return Err(ScheduleError::MissingLevel { level });
            }
        }

        Ok(Self {
            entries,
            lowest,
            highest,
        })
    }

    /// Lowest covered power level, dBm.
    pub fn lowest(&self) -> i32 {
        self.lowest
    }

    /// Highest covered power level, dBm.
    pub fn highest(&self) -> i32 {
        self.highest
    }

    /// Clamp a requested level into the covered range.
    pub fn clamp(&self, level_dbm: i32) -> i32 {
        level_dbm.clamp(self.lowest, self.highest)
    }

    /// Entry for the given level, clamped into the covered range.
    pub fn entry(&self, level_dbm: i32) -> AttEntry {
        let level = self.clamp(level_dbm);
        self.entries[(level - MIN_POWER_DBM) as usize]
            .expect("covered range is contiguous by construction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "\
# power att1 att2 hysteresis time
-20 10 12 0.25 2
-19 10 11 0.25 2
-18 9 11 0.25 2
";

    #[test]
    fn parses_contiguous_schedule() {
        let schedule = AttenuatorSchedule::parse(GOOD).unwrap();
        assert_eq!(schedule.lowest(), -20);
        assert_eq!(schedule.highest(), -18);
        assert_eq!(
            schedule.entry(-19),
            AttEntry {
                att1: 10,
                att2: 11,
                hysteresis: 0.25,
                settle: 2
            }
        );
        // Out-of-range requests clamp to the nearest covered level.
        assert_eq!(schedule.entry(5).att1, 9);
        assert_eq!(schedule.clamp(-90), -20);
    }

    #[test]
    fn rejects_gap_in_coverage() {
        let text = "-20 10 12 0.25 2\n-18 9 11 0.25 2\n";
        assert!(matches!(
            AttenuatorSchedule::parse(text),
            Err(ScheduleError::MissingLevel { level: -19 })
        ));
    }

    #[test]
    fn rejects_out_of_range_fields() {
        assert!(matches!(
            AttenuatorSchedule::parse("-20 40 12 0.25 2\n"),
            Err(ScheduleError::BadAttenuator { line: 1 })
        ));
        assert!(matches!(
            AttenuatorSchedule::parse("-200 10 12 0.25 2\n"),
            Err(ScheduleError::BadLevel { line: 1 })
        ));
        assert!(matches!(
            AttenuatorSchedule::parse("-20 10 12 1.5 2\n"),
            Err(ScheduleError::BadHysteresis { line: 1 })
        ));
        assert!(matches!(
            AttenuatorSchedule::parse("-20 10\n"),
            Err(ScheduleError::Malformed { line: 1 })
        ));
        assert!(matches!(
            AttenuatorSchedule::parse("# only a comment\n"),
            Err(ScheduleError::Empty)
        ));
    }
}
