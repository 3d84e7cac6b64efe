// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Amplitude compensation.
//!
//! Flattens the switch-position dependence of each channel's amplitude:
//! for a fixed beam position every dwell of the switching sequence should
//! produce the same button magnitude on a given channel. The estimator
//! averages trimmed dwell means over several acquisitions, updates the
//! per-(position, channel) coefficients towards the channel's geometric
//! mean, renormalises each channel to unity geometric mean, and commits
//! the result to the gain registers through the routing table.

use super::cordic;
use super::registers::RegisterFile;
use super::table::{CompensationRecord, AMP_VALID};
use super::{
    AcqGeometry, DscError, ACQ_AVERAGES, AMPLITUDE_CLAMP, CHANNELS, MIN_TOTAL_AMPLITUDE,
    SWITCH_POSITIONS, SW_TABLE, TRIM_HEAD, TRIM_TAIL,
};
use crate::hw::{RegisterBus, TbtAtom, TbtSource};

/// Smoothed CORDIC magnitudes of one acquisition, per channel. The raw
/// words are scaled down by 4 to stay inside the primitive's range, and a
/// first-order box-car (k = 0.5) knocks the top off the demodulation
/// ripple.
fn magnitudes(atoms: &[TbtAtom]) -> [Vec<i32>; CHANNELS] {
    let mut out: [Vec<i32>; CHANNELS] = Default::default();
    for (ch, series) in out.iter_mut().enumerate() {
        series.reserve(atoms.len());
        let mut previous = 0i32;
        for (i, atom) in atoms.iter().enumerate() {
            let raw = cordic::magnitude(atom.cos[ch] >> 2, atom.sin[ch] >> 2);
            // Applied in place, so each step smooths against the already
            // smoothed predecessor.
            let smoothed = if i > 0 { raw / 2 + previous / 2 } else { raw };
            series.push(smoothed);
            previous = smoothed;
        }
    }
    out
}

/// Locate the switch marker: the first run of `n_tbt` consecutive samples
/// with the marker bit set, scanning at most `scan_limit` samples.
/// Returns the index of the start of the run.
pub fn find_marker(atoms: &[TbtAtom], n_tbt: usize, scan_limit: usize) -> Option<usize> {
    let mut consecutive = 0;
    for (sample, atom) in atoms.iter().enumerate().take(scan_limit) {
        if atom.marker() {
            consecutive += 1;
        } else {
            consecutive = 0;
        }
        if consecutive >= n_tbt {
            return Some(sample + 1 - n_tbt);
        }
    }
    None
}

/// Trimmed dwell means of one acquisition: for every switch position and
/// channel, the mean amplitude over the dwell with the first
/// [`TRIM_HEAD`] and last [`TRIM_TAIL`] samples dropped.
fn dwell_means(atoms: &[TbtAtom], n_tbt: usize) -> Option<[[i64; CHANNELS]; SWITCH_POSITIONS]> {
    let marker = find_marker(atoms, n_tbt, atoms.len() / 2 + n_tbt)?;
    if marker + SWITCH_POSITIONS * n_tbt > atoms.len() {
        return None;
    }
    let mags = magnitudes(atoms);
    let mut means = [[0i64; CHANNELS]; SWITCH_POSITIONS];
    let samples = (n_tbt - TRIM_HEAD - TRIM_TAIL) as i64;
    for (position, row) in means.iter_mut().enumerate() {
        let from = marker + position * n_tbt + TRIM_HEAD;
        let to = marker + (position + 1) * n_tbt - TRIM_TAIL;
        for (channel, slot) in row.iter_mut().enumerate() {
            let sum: i64 = mags[channel][from..to].iter().map(|&m| m as i64).sum();
            *slot = sum / samples;
        }
    }
    Some(means)
}

/// One amplitude-compensation pass. Returns `Ok(true)` when a new
/// coefficient set was committed, `Ok(false)` when the tick was skipped
/// (no marker, too little signal).
pub fn compensate<B: RegisterBus>(
    tbt: &dyn TbtSource,
    geometry: &AcqGeometry,
    record: &mut CompensationRecord,
    regs: &mut RegisterFile<B>,
    pattern: &[u32; SWITCH_POSITIONS],
) -> Result<bool, DscError> {
    let want = geometry.tbt_read_size();
    let mut atoms = Vec::new();
    let mut accumulated = [[0i64; CHANNELS]; SWITCH_POSITIONS];
    let mut successful = 0usize;

    for _ in 0..ACQ_AVERAGES {
        match tbt.acquire(want, &mut atoms) {
            Ok(n) if n == want => {}
            Ok(n) => {
                log::debug!("[DSC] amplitude: short read, {} of {} atoms", n, want);
                continue;
            }
            Err(e) => {
                log::error!("[DSC] amplitude acquisition failed: {}", e);
                continue;
            }
        }
        if let Some(means) = dwell_means(&atoms, geometry.n_tbt) {
            for position in 0..SWITCH_POSITIONS {
                for channel in 0..CHANNELS {
                    accumulated[position][channel] += means[position][channel];
                }
            }
            successful += 1;
        }
    }

    let total: i64 = accumulated.iter().flatten().sum();
    if total < MIN_TOTAL_AMPLITUDE {
        // Too little power: don't do compensation after all.
        log::debug!("[DSC] amplitude: total {} below threshold", total);
        return Ok(false);
    }
    if successful == 0 {
        return Ok(false);
    }

    // Per-channel geometric mean of the accumulated dwell amplitudes.
    let mut channel_geo = [1.0f64; CHANNELS];
    for channel in 0..CHANNELS {
        let mut product = 1.0f64;
        for row in &accumulated {
            product *= row[channel] as f64;
        }
        if product > 0.0 {
            channel_geo[channel] = (product.ln() / SWITCH_POSITIONS as f64).exp();
        }
    }

    // Pull each coefficient towards equalising its dwell against the
    // channel mean, clamped against runaway.
    for position in 0..SWITCH_POSITIONS {
        for channel in 0..CHANNELS {
            let ratio = channel_geo[channel] / accumulated[position][channel] as f64;
            let updated = record.amplitude[position][channel] * ratio as f32;
            record.amplitude[position][channel] = updated.min(AMPLITUDE_CLAMP);
        }
    }

    // Renormalise every channel to unity geometric mean, then push the
    // coefficients to the gain registers of the (absolute position,
    // RF chain) pairs the sequence touches.
    for channel in 0..CHANNELS {
        let mut product = 1.0f64;
        for position in 0..SWITCH_POSITIONS {
            product *= record.amplitude[position][channel] as f64;
        }
        let geo = if product > 0.0 {
            (product.ln() / SWITCH_POSITIONS as f64).exp()
        } else {
            1.0
        };
        for position in 0..SWITCH_POSITIONS {
            record.amplitude[position][channel] /= geo as f32;
            let absolute = pattern[position] as usize;
            let chain = SW_TABLE[absolute * CHANNELS + channel] as usize;
            regs.set_gain(absolute, chain, record.amplitude[position][channel])?;
        }
    }

    record.status |= AMP_VALID;
    regs.commit();
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsc::ROTATING_PATTERN;
    use crate::hw::sim::{MemBus, SimTbt};

    fn geometry() -> AcqGeometry {
        AcqGeometry {
            n_tbt: 20,
            ..AcqGeometry::default()
        }
    }

    fn regs() -> RegisterFile<MemBus> {
        let g = geometry();
        RegisterFile::new(MemBus::new(), g.f_samp(), g.f_if())
    }

    #[test]
    fn marker_found_at_dwell_start() {
        let tbt = SimTbt::new(20);
        let mut atoms = Vec::new();
        tbt.acquire(320, &mut atoms).unwrap();
        assert_eq!(find_marker(&atoms, 20, 180), Some(40));
        // Too short a scan window: not found.
        assert_eq!(find_marker(&atoms, 20, 30), None);
    }

    #[test]
    fn no_marker_skips_tick() {
        let geometry = geometry();
        let mut tbt = SimTbt::new(20);
        // Push the marker past the scan limit.
        tbt.marker = geometry.tbt_read_size() + 1;
        let mut record = CompensationRecord::default();
        let mut regs = regs();
        let done = compensate(&tbt, &geometry, &mut record, &mut regs, &ROTATING_PATTERN).unwrap();
        assert!(!done);
        assert_eq!(record.status, 0);
    }

    #[test]
    fn weak_signal_skips_tick() {
        let geometry = geometry();
        let mut tbt = SimTbt::new(20);
        tbt.amplitude = 100.0;
        let mut record = CompensationRecord::default();
        let mut regs = regs();
        let done = compensate(&tbt, &geometry, &mut record, &mut regs, &ROTATING_PATTERN).unwrap();
        assert!(!done);
    }

    #[test]
    fn position_dip_is_equalised_and_geometrically_normalised() {
        let geometry = geometry();
        let mut tbt = SimTbt::new(20);
        // Channel 1 dips 20% at sequence position 2 only.
        tbt.position_scale[2][1] = 0.8;
        let mut record = CompensationRecord::default();
        let mut regs = regs();
        let done = compensate(&tbt, &geometry, &mut record, &mut regs, &ROTATING_PATTERN).unwrap();
        assert!(done);
        assert_ne!(record.status & AMP_VALID, 0);

        // The dipped dwell gets boosted relative to its channel peers.
        let boosted = record.amplitude[2][1];
        for position in 0..SWITCH_POSITIONS {
            if position != 2 {
                assert!(boosted > record.amplitude[position][1]);
            }
        }
        // Roughly the inverse of the dip once renormalised.
        assert!((boosted / record.amplitude[0][1] - 1.25).abs() < 0.05);

        // Geometric unity per channel.
        for channel in 0..CHANNELS {
            let product: f64 = (0..SWITCH_POSITIONS)
                .map(|p| record.amplitude[p][channel] as f64)
                .product();
            let geo = (product.ln() / SWITCH_POSITIONS as f64).exp();
            assert!((geo - 1.0).abs() < 1e-6, "channel {}: {}", channel, geo);
        }

        // Coefficients stay inside the escape clamp.
        for row in &record.amplitude {
            for &c in row {
                assert!(c > 0.0 && c <= AMPLITUDE_CLAMP);
            }
        }
    }

    #[test]
    fn uniform_channel_dip_cancels_in_renormalisation() {
        // A channel that is uniformly low across every position carries
        // no switch dependence; the per-channel renormalisation absorbs
        // the whole correction and the stored coefficients stay at unity.
        let geometry = geometry();
        let mut tbt = SimTbt::new(20);
        tbt.channel_scale[1] = 0.9;
        let mut record = CompensationRecord::default();
        let mut regs = regs();
        let done = compensate(&tbt, &geometry, &mut record, &mut regs, &ROTATING_PATTERN).unwrap();
        assert!(done);
        let first = record.amplitude;
        for row in &first {
            for &c in row {
                assert!((c - 1.0).abs() < 0.02, "coefficient {}", c);
            }
        }
        // Same injection again: additional change stays within 1%.
        compensate(&tbt, &geometry, &mut record, &mut regs, &ROTATING_PATTERN).unwrap();
        for position in 0..SWITCH_POSITIONS {
            for channel in 0..CHANNELS {
                let delta =
                    (record.amplitude[position][channel] - first[position][channel]).abs();
                assert!(delta <= 0.01, "({}, {}): {}", position, channel, delta);
            }
        }
    }
}
