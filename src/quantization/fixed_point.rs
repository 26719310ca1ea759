//! Power-of-two fixed-point arithmetic.
//!
//! These functions define the integer semantics the downstream runtime
//! executes. Every rounding and clipping rule here is part of the artifact
//! contract and must not change between releases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of the integer accumulator used by arithmetic operators.
pub const ACCUMULATOR_BITS: u32 = 32;

/// Fractional bits of the softmax exponential table.
pub const SOFTMAX_TABLE_BITS: u32 = 16;

/// A scale `2^k`, stored as its exponent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScaleExp(pub i32);

impl ScaleExp {
    pub const IDENTITY: ScaleExp = ScaleExp(0);

    pub fn value(self) -> f64 {
        2f64.powi(self.0)
    }
}

impl fmt::Display for ScaleExp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "2^{}", self.0)
    }
}

/// Largest magnitude representable under the symmetric clip, `2^(p-1) - 1`.
pub fn max_int(precision: u32) -> i64 {
    (1i64 << (precision - 1)) - 1
}

/// The largest power-of-two scale that keeps `bound` representable in
/// `precision` bits without saturating.
///
/// A zero bound carries no information about the range; it gets the
/// finest scale that still represents 1.0.
pub fn scale_for(bound: f64, precision: u32) -> ScaleExp {
    let alpha = max_int(precision) as f64;
    if bound <= 0.0 {
        return ScaleExp(precision as i32 - 1);
    }
    let mut k = (alpha / bound).log2().floor() as i32;
    // log2 is not exact near powers of two; settle on the exact boundary.
    while bound * 2f64.powi(k + 1) <= alpha {
        k += 1;
    }
    while bound * 2f64.powi(k) > alpha {
        k -= 1;
    }
    ScaleExp(k)
}

/// Real to integer: round half away from zero, then clamp to the signed
/// `precision`-bit range `[-2^(p-1), 2^(p-1) - 1]`.
pub fn encode(value: f64, scale: ScaleExp, precision: u32) -> i64 {
    let hi = max_int(precision);
    let q = (value * scale.value()).round();
    if q >= hi as f64 {
        hi
    } else if q <= (-hi - 1) as f64 {
        -hi - 1
    } else {
        q as i64
    }
}

/// Integer to real.
pub fn decode(value: i64, scale: ScaleExp) -> f64 {
    value as f64 / scale.value()
}

/// Symmetric clip to `±(2^(p-1) - 1)`.
pub fn clip(value: i64, precision: u32) -> i64 {
    let alpha = max_int(precision);
    value.clamp(-alpha, alpha)
}

/// Requantizing right shift: `((x >> (s-1)) + 1) >> 1` (round half up on
/// arithmetic shifts), then the symmetric clip. A zero shift only clips.
pub fn right_shift(value: i64, shift_bit: u32, precision: u32) -> i64 {
    if shift_bit == 0 {
        return clip(value, precision);
    }
    let t = ((value >> (shift_bit - 1)) + 1) >> 1;
    clip(t, precision)
}

/// `x << s`, then the symmetric clip.
pub fn left_shift(value: i64, shift_bit: u32, precision: u32) -> i64 {
    clip(value << shift_bit, precision)
}

/// Number of bits needed for the magnitude `m` (0 for 0).
pub fn magnitude_bits(m: u64) -> u32 {
    u64::BITS - m.leading_zeros()
}

/// Signed precision needed to hold every integer in `±max_abs`.
pub fn precision_of(max_abs: i64) -> u32 {
    magnitude_bits(max_abs.unsigned_abs()) + 1
}

/// `ceil(log2(n))`, with `n <= 1` mapping to 0.
pub fn ceil_log2(n: usize) -> u32 {
    if n <= 1 {
        0
    } else {
        usize::BITS - (n - 1).leading_zeros()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_for_keeps_bound_representable() {
        // 127 / 4.0 = 31.75 -> 2^4
        assert_eq!(scale_for(4.0, 8), ScaleExp(4));
        // 127 / 2.0 = 63.5 -> 2^5, so 2.0 encodes to 64
        assert_eq!(scale_for(2.0, 8), ScaleExp(5));
        assert_eq!(encode(2.0, scale_for(2.0, 8), 8), 64);
        // fractional bounds get positive exponents, huge bounds negative ones
        assert_eq!(scale_for(0.5, 8), ScaleExp(7));
        assert_eq!(scale_for(1000.0, 8), ScaleExp(-3));
        assert_eq!(scale_for(0.0, 8), ScaleExp(7));
    }

    #[test]
    fn test_scale_for_exact_boundary() {
        // 127 * 2^-3 maps exactly onto 127 at k = 3
        let bound = 127.0 / 8.0;
        assert_eq!(scale_for(bound, 8), ScaleExp(3));
        assert_eq!(encode(bound, ScaleExp(3), 8), 127);
    }

    #[test]
    fn test_encode_clamps_asymmetric_range() {
        assert_eq!(encode(10.0, ScaleExp(4), 8), 127);
        assert_eq!(encode(-10.0, ScaleExp(4), 8), -128);
        assert_eq!(encode(0.03125, ScaleExp(4), 8), 1); // 0.5 rounds away from zero
        assert_eq!(encode(-0.03125, ScaleExp(4), 8), -1);
    }

    #[test]
    fn test_right_shift_rounds_half_up() {
        assert_eq!(right_shift(5, 1, 8), 3); // 2.5 -> 3
        assert_eq!(right_shift(-5, 1, 8), -2); // -2.5 -> -2
        assert_eq!(right_shift(6, 2, 8), 2); // 1.5 -> 2
        assert_eq!(right_shift(7, 2, 8), 2); // 1.75 -> 2
        assert_eq!(right_shift(-7, 2, 8), -2); // -1.75 -> -2
        assert_eq!(right_shift(-6, 2, 8), -1); // -1.5 -> -1
        assert_eq!(right_shift(100_000, 4, 8), 127);
        assert_eq!(right_shift(-100_000, 4, 8), -127);
        assert_eq!(right_shift(200, 0, 8), 127);
    }

    #[test]
    fn test_left_shift_clips() {
        assert_eq!(left_shift(3, 2, 8), 12);
        assert_eq!(left_shift(-100, 2, 8), -127);
    }

    #[test]
    fn test_bit_helpers() {
        assert_eq!(precision_of(0), 1);
        assert_eq!(precision_of(1), 2);
        assert_eq!(precision_of(127), 8);
        assert_eq!(precision_of(-128), 9);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(9), 4);
        assert_eq!(ceil_log2(16), 4);
    }
}
