// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Integer CORDIC primitives.
//!
//! Vectoring-mode CORDIC is used throughout the compensation engine both
//! as a magnitude primitive `|(x, y)|` and as a phase primitive
//! `atan2(y, x)`. The magnitude result carries the usual CORDIC gain of
//! about 1.6468 ([`crate::dsc::CORDIC_GAIN`]); callers that need the true
//! amplitude divide it out.

use std::sync::OnceLock;

const ITERATIONS: usize = 24;

fn atan_table() -> &'static [f64; ITERATIONS] {
    static TABLE: OnceLock<[f64; ITERATIONS]> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table = [0.0; ITERATIONS];
        for (i, entry) in table.iter_mut().enumerate() {
            *entry = (2.0f64).powi(-(i as i32)).atan();
        }
        table
    })
}

/// Core vectoring rotation. Returns the rotated-out x (gain-scaled
/// magnitude, at the internal scale) and the accumulated angle.
fn vector(mut x: i64, mut y: i64, mut angle: f64) -> (i64, f64) {
    let table = atan_table();
    for (i, atan) in table.iter().enumerate() {
        if y > 0 {
            let xn = x + (y >> i);
            y -= x >> i;
            x = xn;
            angle += atan;
        } else {
            let xn = x - (y >> i);
            y += x >> i;
            x = xn;
            angle -= atan;
        }
    }
    (x, angle)
}

/// Scale the operands up so the iteration works on a well-conditioned
/// mantissa, returning the shift applied.
fn normalise(x: i64, y: i64) -> (i64, i64, u32) {
    let lead = (x.abs() | y.abs()).leading_zeros();
    let up = lead.saturating_sub(18);
    (x << up, y << up, up)
}

/// Gain-scaled magnitude `≈ 1.6468 · |(x, y)|`.
pub fn magnitude(x: i32, y: i32) -> i32 {
    if x == 0 && y == 0 {
        return 0;
    }
    let (mut x, y, up) = normalise(x as i64, y as i64);
    if x < 0 {
        x = -x;
    }
    let (mag, _) = vector(x, y, 0.0);
    let scaled = if up > 0 {
        (mag + (1i64 << (up - 1))) >> up
    } else {
        mag
    };
    scaled.clamp(0, i32::MAX as i64) as i32
}

/// Phase `atan2(y, x)` in `(-π, π]`. Both inputs zero is the one
/// degenerate case and yields `None`; compensation passes abort the tick
/// when they hit it.
pub fn phase(x: i32, y: i32) -> Option<f64> {
    if x == 0 && y == 0 {
        return None;
    }
    let (x, y, _) = normalise(x as i64, y as i64);
    // Pre-rotate into the right half-plane so the iteration converges.
    let (x, y, base) = if x < 0 {
        if y >= 0 {
            (y, -x, std::f64::consts::FRAC_PI_2)
        } else {
            (-y, x, -std::f64::consts::FRAC_PI_2)
        }
    } else {
        (x, y, 0.0)
    };
    let (_, angle) = vector(x, y, base);
    Some(angle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsc::CORDIC_GAIN;

    #[test]
    fn magnitude_carries_cordic_gain() {
        for &(x, y) in &[(3000, 4000), (-3000, 4000), (120_000, -5), (1, 1)] {
            let expect = ((x as f64).hypot(y as f64) * CORDIC_GAIN).round();
            let got = magnitude(x, y) as f64;
            let err = (got - expect).abs() / expect.max(1.0);
            assert!(err < 1e-3, "({}, {}): got {} expect {}", x, y, got, err);
        }
    }

    #[test]
    fn magnitude_of_zero_is_zero() {
        assert_eq!(magnitude(0, 0), 0);
    }

    #[test]
    fn phase_matches_atan2_in_all_quadrants() {
        let cases = [
            (1000, 0),
            (1000, 1000),
            (0, 1000),
            (-1000, 1000),
            (-1000, 0),
            (-1000, -1000),
            (0, -1000),
            (1000, -1000),
            (7, -3),
        ];
        for &(x, y) in &cases {
            let expect = (y as f64).atan2(x as f64);
            let got = phase(x, y).unwrap();
            assert!(
                (got - expect).abs() < 1e-5,
                "({}, {}): got {} expect {}",
                x,
                y,
                got,
                expect
            );
        }
    }

    #[test]
    fn phase_rejects_zero_vector() {
        assert_eq!(phase(0, 0), None);
    }

    #[test]
    fn randomised_vectors_match_reference() {
        fastrand::seed(0x5eed);
        for _ in 0..500 {
            let x = fastrand::i32(-1_000_000..=1_000_000);
            let y = fastrand::i32(-1_000_000..=1_000_000);
            // The interesting regime is a real signal, not the bottom
            // few counts where quantisation dominates.
            if (x as i64) * (x as i64) + (y as i64) * (y as i64) < 1_000_000 {
                continue;
            }
            let magnitude_ref = (x as f64).hypot(y as f64) * CORDIC_GAIN;
            let magnitude_err = (magnitude(x, y) as f64 - magnitude_ref).abs();
            assert!(
                magnitude_err / magnitude_ref.max(1.0) < 2e-3,
                "({}, {}): magnitude off by {}",
                x,
                y,
                magnitude_err
            );
            let phase_ref = (y as f64).atan2(x as f64);
            let phase_err = (phase(x, y).unwrap() - phase_ref).abs();
            assert!(
                phase_err < 1e-4 || (2.0 * std::f64::consts::PI - phase_err).abs() < 1e-4,
                "({}, {}): phase off by {}",
                x,
                y,
                phase_err
            );
        }
    }
}
