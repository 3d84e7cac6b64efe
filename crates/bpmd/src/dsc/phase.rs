// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Phase compensation.
//!
//! Measures the switch-dependent phase offsets between channel A and each
//! of B, C, D, plus channel A's own dwell-to-dwell phase discontinuity
//! (obtained by comparing a linear extrapolation of A's unwrapped phase
//! against the actual phase one dwell later). The per-sample angular
//! advance of channel A doubles as a fresh measurement of the residual
//! intermediate-frequency detune, which is committed alongside the phase
//! coefficients.

use super::cordic;
use super::registers::RegisterFile;
use super::table::{CompensationRecord, PHASE_VALID};
use super::{AcqGeometry, DscError, CHANNELS, SWITCH_POSITIONS, SW_TABLE};
use crate::hw::{RegisterBus, TbtAtom, TbtSource};
use std::f64::consts::PI;

const TWO_PI: f64 = 2.0 * PI;
const THREE_HALF_PI: f64 = 1.5 * PI;

/// Window of each dwell used for the channel difference means.
const INDEX_LOW_PART: f64 = 0.2;
const INDEX_HIGH_PART: f64 = 0.8;
/// Fraction of a dwell used for the extrapolation comparison.
const AVERAGE_PART: f64 = 0.5;

/// Both CORDIC inputs were zero somewhere in the burst; the whole tick is
/// abandoned without committing.
struct CordicZero;

/// Phases of one channel over an inclusive atom range.
fn phase_series(
    atoms: &[TbtAtom],
    start: usize,
    end_inclusive: usize,
    channel: usize,
) -> Result<Vec<f64>, CordicZero> {
    let mut out = Vec::with_capacity(end_inclusive - start + 1);
    for atom in &atoms[start..=end_inclusive] {
        let angle = cordic::phase(atom.cos[channel], atom.sin[channel]).ok_or(CordicZero)?;
        out.push(angle);
    }
    Ok(out)
}

/// Unwrap a phase series in place: whenever two successive samples differ
/// by more than 3π/2, fold subsequent samples by ±2π.
fn unwrap(series: &mut [f64]) {
    let mut correction = 0.0;
    for i in 1..series.len() {
        series[i] += correction;
        if (series[i] - series[i - 1]).abs() > THREE_HALF_PI {
            if series[i] > series[i - 1] {
                correction -= TWO_PI;
                series[i] -= TWO_PI;
            } else {
                correction += TWO_PI;
                series[i] += TWO_PI;
            }
        }
    }
}

fn mean(series: &[f64]) -> f64 {
    series.iter().sum::<f64>() / series.len() as f64
}

/// Reduce into `(-2π, 2π)`.
fn wrap_two_pi(mut angle: f64) -> f64 {
    while angle > TWO_PI {
        angle -= TWO_PI;
    }
    while angle < -TWO_PI {
        angle += TWO_PI;
    }
    angle
}

/// Reduce into `(-π, π]`.
fn wrap_pi(mut angle: f64) -> f64 {
    while angle > PI {
        angle -= TWO_PI;
    }
    while angle < -PI {
        angle += TWO_PI;
    }
    angle
}

/// Mean unwrapped phase difference between channel A and `channel` over
/// an inclusive window.
fn channel_difference(
    atoms: &[TbtAtom],
    start: usize,
    end_inclusive: usize,
    channel: usize,
) -> Result<f64, CordicZero> {
    let mut reference = phase_series(atoms, start, end_inclusive, 0)?;
    let mut other = phase_series(atoms, start, end_inclusive, channel)?;
    unwrap(&mut reference);
    unwrap(&mut other);
    for (r, o) in reference.iter_mut().zip(&other) {
        *r -= o;
    }
    Ok(mean(&reference))
}

struct BurstAngles {
    matrix: [[f64; CHANNELS]; SWITCH_POSITIONS],
    /// Per-sample angular advance of channel A.
    avg_angle: f64,
}

fn analyse(atoms: &[TbtAtom], geometry: &AcqGeometry) -> Result<Option<BurstAngles>, CordicZero> {
    let n_tbt = geometry.n_tbt;

    // Search for the marker, rejecting hits too close to the start to
    // leave history for the reference phase. The 9 is safely below the
    // smallest dwell length in use.
    let scan = (n_tbt * SWITCH_POSITIONS * 4).min(atoms.len());
    let mut consecutive = 0;
    let mut marker = None;
    for sample in 0..scan {
        if atoms[sample].marker() {
            consecutive += 1;
        } else {
            consecutive = 0;
        }
        if consecutive == n_tbt {
            let candidate = sample + 1 - n_tbt;
            if candidate < n_tbt + 9 {
                consecutive = 0;
            } else {
                marker = Some(candidate);
                break;
            }
        }
    }
    let Some(marker) = marker else {
        return Ok(None);
    };

    let array_start = marker - (0.75 * n_tbt as f64).floor() as usize;
    let array_finish = marker + (0.25 * n_tbt as f64).ceil() as usize
        + geometry.ph_avg * n_tbt * SWITCH_POSITIONS
        - 1
        - n_tbt;
    if array_finish >= atoms.len() {
        log::debug!("[DSC] phase: burst too short for analysis span");
        return Ok(None);
    }

    // The slope of channel A's unwrapped phase over the whole span is the
    // observed per-sample angular advance.
    let mut reference = phase_series(atoms, array_start, array_finish, 0)?;
    unwrap(&mut reference);
    let span = (array_finish - array_start) as f64;
    let avg_angle = (reference[reference.len() - 1] - reference[0]) / span;

    let anchor = &atoms[array_start];
    let full_angle = cordic::phase(anchor.cos[0], anchor.sin[0]).ok_or(CordicZero)?;

    let index_low = (INDEX_LOW_PART * n_tbt as f64).round() as usize;
    let index_high = (INDEX_HIGH_PART * n_tbt as f64).round() as usize;
    let average_len = (AVERAGE_PART * n_tbt as f64).round() as usize;

    let mut matrix = [[0.0; CHANNELS]; SWITCH_POSITIONS];
    let mut window_start = marker + index_low;
    let mut window_end = marker + index_high;

    for (position, row) in matrix.iter_mut().enumerate() {
        let diff_b = channel_difference(atoms, window_start, window_end, 1)?;
        let diff_c = channel_difference(atoms, window_start, window_end, 2)?;
        let diff_d = channel_difference(atoms, window_start, window_end, 3)?;

        // Compare the linear extrapolation of channel A's phase against
        // the actual phase one dwell past the marker.
        let index_start = n_tbt * (position + 1);
        let old_start = array_start + index_start - 1;
        let mut actual = phase_series(atoms, old_start, old_start + average_len - 1, 0)?;
        unwrap(&mut actual);
        let mut extrapolated = Vec::with_capacity(average_len);
        let mut angle = full_angle + avg_angle * (index_start - 1) as f64;
        for _ in 0..average_len {
            extrapolated.push(angle);
            angle += avg_angle;
        }
        unwrap(&mut extrapolated);
        for (e, a) in extrapolated.iter_mut().zip(&actual) {
            *e -= a;
        }
        let mut diff_a = wrap_two_pi(mean(&extrapolated));

        // The last position closes the sequence; its discontinuity is
        // zero by definition.
        if position == SWITCH_POSITIONS - 1 {
            diff_a = 0.0;
        }

        row[0] = wrap_pi(diff_a);
        row[1] = wrap_pi(diff_a + diff_b);
        row[2] = wrap_pi(diff_a + diff_c);
        row[3] = wrap_pi(diff_a + diff_d);

        window_start += n_tbt;
        window_end += n_tbt;
    }

    Ok(Some(BurstAngles { matrix, avg_angle }))
}

/// One phase-compensation pass. Returns `Ok(true)` when a new set of
/// phase coefficients was committed.
pub fn compensate<B: RegisterBus>(
    tbt: &dyn TbtSource,
    geometry: &AcqGeometry,
    record: &mut CompensationRecord,
    regs: &mut RegisterFile<B>,
    pattern: &[u32; SWITCH_POSITIONS],
) -> Result<bool, DscError> {
    let want = geometry.tbt_read_size_phase();
    let mut atoms = Vec::new();
    match tbt.acquire(want, &mut atoms) {
        Ok(n) if n == want => {}
        Ok(n) => {
            log::error!("[DSC] phase: short read, {} of {} atoms", n, want);
            return Ok(false);
        }
        Err(e) => {
            log::error!("[DSC] phase acquisition failed: {}", e);
            return Ok(false);
        }
    }

    let angles = match analyse(&atoms, geometry) {
        Ok(Some(angles)) => angles,
        Ok(None) => return Ok(false),
        Err(CordicZero) => {
            log::error!("[DSC] phase: atan2 with both arguments zero, tick abandoned");
            return Ok(false);
        }
    };

    let detune = angles.avg_angle * geometry.f_tbt / TWO_PI;
    for position in 0..SWITCH_POSITIONS {
        for channel in 0..CHANNELS {
            let updated =
                record.phase[position][channel] as f64 - angles.matrix[position][channel];
            record.phase[position][channel] = wrap_pi(updated) as f32;
            let absolute = pattern[position] as usize;
            let chain = SW_TABLE[absolute * CHANNELS + channel] as usize;
            regs.set_phase(absolute, chain, record.phase[position][channel], detune)?;
        }
    }
    record.status |= PHASE_VALID;
    regs.commit();
    Ok(true)
}
