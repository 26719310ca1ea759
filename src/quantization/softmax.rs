//! Lookup-table softmax.
//!
//! The integer softmax subtracts the lane maximum, so every table index is a
//! non-positive difference clamped to `[-alpha, 0]`, where `alpha` is the
//! exponent cutoff `lambd` expressed at the input scale.

use super::fixed_point::{precision_of, ScaleExp, SOFTMAX_TABLE_BITS};
use crate::graph::Tensor;
use ndarray::Array1;

/// Largest `alpha` accepted before the input is shifted to a coarser scale.
pub const MAX_ALPHA: i64 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftmaxPlan {
    /// Right shift applied to the input before the lookup.
    pub pre_shift: u32,
    /// Input scale after the shift.
    pub scale: ScaleExp,
    pub alpha: i64,
}

pub fn plan(lambd: f64, input_scale: ScaleExp) -> SoftmaxPlan {
    let alpha = lambd * input_scale.value();
    let pre_shift = if alpha > MAX_ALPHA as f64 {
        (alpha / MAX_ALPHA as f64).log2().ceil() as u32
    } else {
        0
    };
    let scale = ScaleExp(input_scale.0 - pre_shift as i32);
    let alpha = ((lambd * scale.value()).round() as i64).clamp(1, MAX_ALPHA);
    SoftmaxPlan { pre_shift, scale, alpha }
}

/// `T[i] = round(exp((i - alpha) / 2^k) * 2^16)` for `i` in `0..=alpha`.
pub fn exp_table(alpha: i64, scale: ScaleExp) -> Tensor {
    let one = (1i64 << SOFTMAX_TABLE_BITS) as f64;
    let s = scale.value();
    Array1::from_iter((0..=alpha).map(|i| (((i - alpha) as f64 / s).exp() * one).round())).into_dyn()
}

/// Worst-case bits of the normalisation `(T * 2^(p-1) + sum / 2) / sum`
/// over a lane of `lane` entries, each at most `2^16`.
pub fn accumulator_bits(lane: usize, precision: u32) -> u32 {
    let one = 1i64 << SOFTMAX_TABLE_BITS;
    let sum = one.saturating_mul(lane.max(1) as i64);
    let numerator = one.saturating_mul(1i64 << precision.saturating_sub(1).min(62)).saturating_add(sum / 2);
    precision_of(numerator).max(precision_of(sum))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_without_shift() {
        let p = plan(10.0, ScaleExp(4));
        assert_eq!(p, SoftmaxPlan { pre_shift: 0, scale: ScaleExp(4), alpha: 160 });
    }

    #[test]
    fn test_plan_shifts_large_alpha() {
        // 10 * 2^14 = 163840 > 65536, needs two bits off
        let p = plan(10.0, ScaleExp(14));
        assert_eq!(p.pre_shift, 2);
        assert_eq!(p.scale, ScaleExp(12));
        assert!(p.alpha <= MAX_ALPHA);
    }

    #[test]
    fn test_accumulator_bits() {
        // 2^16 * 2^7 + 4 * 2^15 needs 24 magnitude bits
        assert_eq!(accumulator_bits(4, 8), 25);
        // 2^16 * 2^15 alone is 2^31
        assert_eq!(accumulator_bits(4, 16), 33);
        // the sum dominates for long lanes
        assert_eq!(accumulator_bits(1 << 20, 2), 38);
    }

    #[test]
    fn test_table_ends() {
        let t: Vec<f64> = exp_table(160, ScaleExp(4)).iter().copied().collect();
        assert_eq!(t.len(), 161);
        assert_eq!(t[160], 65536.0);
        assert_eq!(t[0], (65536.0 * (-10f64).exp()).round());
        assert!(t.windows(2).all(|w| w[0] <= w[1]));
    }
}
