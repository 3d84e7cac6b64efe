// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stage descriptors for the cascaded servo.
//!
//! A controller owns an ordered list of stages of increasing depth:
//! frequency seek, coarse phase lock, narrow filter lock. Each stage
//! carries its own parameter record; the servo dispatches on the variant.
//! Parameters are mutable at runtime through the diagnostic stage-write
//! command, addressed by typed integer/float slot indices.

/// Frequency-seek stage: a pure integrator on frequency error.
#[derive(Debug, Clone)]
pub struct FreqSeekParams {
    /// Scaled DAC gain per unit of frequency error.
    pub gain: i32,
}

/// Coarse phase-lock stage: PI controller with variance-based lock
/// detection.
#[derive(Debug, Clone)]
pub struct PhaseLockParams {
    pub kp: i32,
    pub ki: i32,
    /// First-order smoothing factor for the error-variance estimate,
    /// in `(0, 1]`.
    pub smoothing: f64,
    /// Bail-out threshold: retreat to frequency seek beyond this error.
    pub max_phase_error: i32,
}

/// One coefficient pair of the narrow-lock filter. `a` of the first pair
/// is unused.
#[derive(Debug, Clone, Copy)]
pub struct FilterCoeff {
    pub b: f64,
    pub a: f64,
}

/// Narrow phase-lock stage: an N-pole IIR filter on phase error.
///
/// Realises `y[n] = Σ B_k·x[n−k] − Σ_{k≥1} A_k·y[n−k]` with
/// `order = coeff.len() − 1`. An order of 0 reduces to a scalar gain.
#[derive(Debug, Clone)]
pub struct FilterParams {
    /// Offset added to the reported phase error, typically 0 or 0.5 to
    /// operate on the metastable threshold.
    pub dither: f64,
    pub coeff: Vec<FilterCoeff>,
}

impl FilterParams {
    pub fn order(&self) -> usize {
        self.coeff.len().saturating_sub(1)
    }
}

/// Discriminant of a [`Stage`], used by the sequencer to dispatch without
/// borrowing the parameter record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    FreqSeek,
    PhaseLock,
    Filter,
}

/// One stage of the cascaded controller.
#[derive(Debug, Clone)]
pub enum Stage {
    FreqSeek(FreqSeekParams),
    PhaseLock(PhaseLockParams),
    Filter(FilterParams),
}

impl Stage {
    pub fn kind(&self) -> StageKind {
        match self {
            Stage::FreqSeek(_) => StageKind::FreqSeek,
            Stage::PhaseLock(_) => StageKind::PhaseLock,
            Stage::Filter(_) => StageKind::Filter,
        }
    }

    /// Integer parameter slots, per variant:
    /// frequency seek `{0: gain}`; phase lock `{0: kp, 1: ki,
    /// 2: max_phase_error}`; filter has none.
    pub fn write_int(&mut self, idx: usize, value: i32) -> bool {
        match (self, idx) {
            (Stage::FreqSeek(p), 0) => p.gain = value,
            (Stage::PhaseLock(p), 0) => p.kp = value,
            (Stage::PhaseLock(p), 1) => p.ki = value,
            (Stage::PhaseLock(p), 2) => p.max_phase_error = value,
            _ => return false,
        }
        true
    }

    pub fn read_int(&self, idx: usize) -> Option<i32> {
        match (self, idx) {
            (Stage::FreqSeek(p), 0) => Some(p.gain),
            (Stage::PhaseLock(p), 0) => Some(p.kp),
            (Stage::PhaseLock(p), 1) => Some(p.ki),
            (Stage::PhaseLock(p), 2) => Some(p.max_phase_error),
            _ => None,
        }
    }

    /// Float parameter slots, per variant: phase lock `{0: smoothing}`;
    /// filter `{0: dither, 1+2k: B_k, 2+2k: A_k}`.
    pub fn write_float(&mut self, idx: usize, value: f64) -> bool {
        match self {
            Stage::PhaseLock(p) if idx == 0 => {
                p.smoothing = value;
                true
            }
            Stage::Filter(p) => {
                if idx == 0 {
                    p.dither = value;
                    return true;
                }
                let k = (idx - 1) / 2;
                match p.coeff.get_mut(k) {
                    Some(c) if idx % 2 == 1 => {
                        c.b = value;
                        true
                    }
                    Some(c) => {
                        c.a = value;
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        }
    }

    pub fn read_float(&self, idx: usize) -> Option<f64> {
        match self {
            Stage::PhaseLock(p) if idx == 0 => Some(p.smoothing),
            Stage::Filter(p) => {
                if idx == 0 {
                    return Some(p.dither);
                }
                let k = (idx - 1) / 2;
                p.coeff
                    .get(k)
                    .map(|c| if idx % 2 == 1 { c.b } else { c.a })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_slots_cover_pi_parameters() {
        let mut stage = Stage::PhaseLock(PhaseLockParams {
            kp: 20,
            ki: 9,
            smoothing: 0.15,
            max_phase_error: 30000,
        });
        assert!(stage.write_int(1, 11));
        assert_eq!(stage.read_int(1), Some(11));
        assert_eq!(stage.read_int(3), None);
        assert!(!stage.write_int(3, 0));
    }

    #[test]
    fn float_slots_address_filter_coefficients() {
        let mut stage = Stage::Filter(FilterParams {
            dither: 0.0,
            coeff: vec![
                FilterCoeff { b: 0.3, a: 0.0 },
                FilterCoeff { b: 0.14, a: -1.8 },
                FilterCoeff { b: -0.41, a: 0.8 },
            ],
        });
        assert_eq!(stage.read_float(1), Some(0.3));
        assert_eq!(stage.read_float(4), Some(-1.8));
        assert!(stage.write_float(0, 0.5));
        assert_eq!(stage.read_float(0), Some(0.5));
        assert_eq!(stage.read_float(7), None);
    }

    #[test]
    fn filter_order_counts_poles() {
        let p = FilterParams {
            dither: 0.0,
            coeff: vec![FilterCoeff { b: 1.0, a: 0.0 }],
        };
        assert_eq!(p.order(), 0);
    }
}
