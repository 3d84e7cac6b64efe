// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-input-power compensation coefficient table and its two binary
//! stores.
//!
//! One [`CompensationRecord`] exists for every integer input power in
//! `[-100, +30]` dBm. The volatile store (RAM-backed) is read at startup
//! and written on clean shutdown; the last-good store (flash-backed) is
//! read only as a fallback and written on explicit request, rate-limited
//! to one write per minute of wall-clock time.

use super::{CHANNELS, MAX_SWITCH_POSITIONS};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Lowest input power covered by the table, dBm.
pub const MIN_POWER_DBM: i32 = -100;
/// Highest input power covered by the table, dBm.
pub const MAX_POWER_DBM: i32 = 30;
/// Number of table entries.
pub const POWER_LEVELS: usize = (MAX_POWER_DBM - MIN_POWER_DBM + 1) as usize;

/// Record status bit: amplitude coefficients calibrated.
pub const AMP_VALID: u32 = 0x01;
/// Record status bit: phase coefficients calibrated.
pub const PHASE_VALID: u32 = 0x02;

/// Minimum wall-clock interval between last-good writes.
pub const LASTGOOD_MIN_INTERVAL: Duration = Duration::from_secs(60);

const RECORD_BYTES: usize = MAX_SWITCH_POSITIONS * CHANNELS * 4 * 2 + 4;
const IMAGE_BYTES: usize = RECORD_BYTES * POWER_LEVELS;

#[derive(Debug, Error)]
pub enum StoreError {
    /// A last-good save was requested inside the minimum interval.
    #[error("last-good save rate limited, try again later")]
    TryAgain,
    #[error("bad coefficient image: {0} bytes, expected {IMAGE_BYTES}")]
    BadImage(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Compensation coefficients for one input power level: an amplitude
/// scalar (≈ 1.0) and a phase angle in `(-π, π]` for every
/// (switch position, channel) pair, plus the calibration status mask.
///
/// Rows are indexed by switching-sequence position, not by absolute
/// switch position; the translation to RF chains happens at register
/// commit through the routing tables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompensationRecord {
    pub amplitude: [[f32; CHANNELS]; MAX_SWITCH_POSITIONS],
    pub phase: [[f32; CHANNELS]; MAX_SWITCH_POSITIONS],
    pub status: u32,
}

impl Default for CompensationRecord {
    fn default() -> Self {
        Self {
            amplitude: [[1.0; CHANNELS]; MAX_SWITCH_POSITIONS],
            phase: [[0.0; CHANNELS]; MAX_SWITCH_POSITIONS],
            status: 0,
        }
    }
}

/// The full coefficient table, one record per dBm of input power.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientTable {
    records: Vec<CompensationRecord>,
}

impl Default for CoefficientTable {
    fn default() -> Self {
        Self::unity()
    }
}

impl CoefficientTable {
    /// Fresh table: unity amplitude, zero phase, nothing calibrated.
    pub fn unity() -> Self {
        Self {
            records: vec![CompensationRecord::default(); POWER_LEVELS],
        }
    }

    fn index(level_dbm: i32) -> usize {
        let clamped = level_dbm.clamp(MIN_POWER_DBM, MAX_POWER_DBM);
        (clamped - MIN_POWER_DBM) as usize
    }

    pub fn record(&self, level_dbm: i32) -> &CompensationRecord {
        &self.records[Self::index(level_dbm)]
    }

    pub fn record_mut(&mut self, level_dbm: i32) -> &mut CompensationRecord {
        &mut self.records[Self::index(level_dbm)]
    }

    /// Serialise the whole table as the fixed little-endian image.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(IMAGE_BYTES);
        for record in &self.records {
            for row in &record.amplitude {
                for value in row {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            for row in &record.phase {
                for value in row {
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            out.extend_from_slice(&record.status.to_le_bytes());
        }
        out
    }

    /// Parse an image produced by [`encode`](Self::encode). The size
    /// guard rejects truncated or oversized files outright.
    pub fn decode(image: &[u8]) -> Result<Self, StoreError> {
        if image.len() != IMAGE_BYTES {
            return Err(StoreError::BadImage(image.len()));
        }
        let mut records = Vec::with_capacity(POWER_LEVELS);
        let mut at = 0;
        let mut f32_at = |buf: &[u8], at: &mut usize| {
            let v = f32::from_le_bytes(buf[*at..*at + 4].try_into().unwrap());
            *at += 4;
            v
        };
        for _ in 0..POWER_LEVELS {
            let mut record = CompensationRecord::default();
            for row in record.amplitude.iter_mut() {
                for value in row.iter_mut() {
                    *value = f32_at(image, &mut at);
                }
            }
            for row in record.phase.iter_mut() {
                for value in row.iter_mut() {
                    *value = f32_at(image, &mut at);
                }
            }
            record.status = u32::from_le_bytes(image[at..at + 4].try_into().unwrap());
            at += 4;
            records.push(record);
        }
        Ok(Self { records })
    }
}

/// Write `bytes` through a temporary sibling and rename into place, so a
/// reader only ever observes a complete image.
fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".backup");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// One binary coefficient store (volatile or last-good flavour).
#[derive(Debug, Clone)]
pub struct CoefficientStore {
    path: PathBuf,
}

impl CoefficientStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<CoefficientTable, StoreError> {
        let image = fs::read(&self.path)?;
        let table = CoefficientTable::decode(&image)?;
        log::debug!("[DSC] {} successfully read", self.path.display());
        Ok(table)
    }

    pub fn save(&self, table: &CoefficientTable) -> Result<(), StoreError> {
        write_atomically(&self.path, &table.encode())?;
        log::info!("[DSC] {} successfully written", self.path.display());
        Ok(())
    }
}

/// The flash-backed last-good store: rate-limited, with the filesystem
/// remounted read-write around each write.
#[derive(Debug)]
pub struct LastGoodStore {
    store: CoefficientStore,
    /// Mount point to remount around writes, if any.
    remount: Option<PathBuf>,
    last_attempt: Option<SystemTime>,
}

impl LastGoodStore {
    pub fn new(path: impl Into<PathBuf>, remount: Option<PathBuf>) -> Self {
        Self {
            store: CoefficientStore::new(path),
            remount,
            last_attempt: None,
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn load(&self) -> Result<CoefficientTable, StoreError> {
        self.store.load()
    }

    /// Save on explicit request. Returns [`StoreError::TryAgain`] inside
    /// the minimum interval. The attempt time is recorded whether or not
    /// the write succeeds, as the interval deliberately follows the
    /// wall clock.
    pub fn save(&mut self, table: &CoefficientTable) -> Result<(), StoreError> {
        let now = SystemTime::now();
        if let Some(last) = self.last_attempt {
            match now.duration_since(last) {
                Ok(elapsed) if elapsed > LASTGOOD_MIN_INTERVAL => {}
                // Inside the window, or the wall clock stepped backwards.
                _ => return Err(StoreError::TryAgain),
            }
        }
        self.last_attempt = Some(now);

        self.remount(true);
        let result = self.store.save(table);
        self.remount(false);
        result
    }

    fn remount(&self, writable: bool) {
        let Some(mount) = &self.remount else {
            return;
        };
        let option = if writable { "remount,rw" } else { "remount,ro" };
        match Command::new("mount").arg("-o").arg(option).arg(mount).status() {
            Ok(status) if status.success() => {}
            Ok(status) => log::error!("mount -o {} {} failed: {}", option, mount.display(), status),
            Err(e) => log::error!("mount -o {} {} failed: {}", option, mount.display(), e),
        }
    }
}
