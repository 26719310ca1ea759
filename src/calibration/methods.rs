// src/calibration/methods.rs
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a batch of observed values is reduced to a single symmetric bound.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RangeMethod {
    /// `max |x|` over the batch.
    #[default]
    MaxAbs,

    /// `min(max |x|, lambd * std(x))`; trims long tails.
    StdClip(f64),

    /// The given percentile (0..=100) of `|x|`.
    Percentile(f64),
}

impl RangeMethod {
    /// Reduce one batch of values to a non-negative bound.
    ///
    /// Non-finite values are ignored; an empty batch yields 0.
    pub fn bound(&self, data: &[f64]) -> f64 {
        let abs: Vec<f64> = data.iter().filter(|v| v.is_finite()).map(|v| v.abs()).collect();
        if abs.is_empty() {
            return 0.0;
        }
        let max_abs = abs.iter().copied().fold(0.0, f64::max);

        match *self {
            RangeMethod::MaxAbs => max_abs,

            RangeMethod::StdClip(lambd) => {
                let n = abs.len() as f64;
                let finite = data.iter().filter(|v| v.is_finite());
                let mean = finite.clone().sum::<f64>() / n;
                let var = finite.map(|v| (v - mean).powi(2)).sum::<f64>() / n;
                let std = var.sqrt();
                if std > 0.0 {
                    max_abs.min(lambd * std)
                } else {
                    max_abs
                }
            }

            RangeMethod::Percentile(p) => {
                let mut sorted = abs;
                sorted.sort_by(f64::total_cmp);
                // ceil, not truncation: for 5 elements at p=50 the target rank is 3
                let rank = (sorted.len() as f64 * p.clamp(0.0, 100.0) / 100.0).ceil() as usize;
                sorted[rank.clamp(1, sorted.len()) - 1]
            }
        }
    }
}

impl fmt::Display for RangeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeMethod::MaxAbs => write!(f, "max_abs"),
            RangeMethod::StdClip(lambd) => write!(f, "std_clip({lambd})"),
            RangeMethod::Percentile(p) => write!(f, "percentile({p})"),
        }
    }
}

impl FromStr for RangeMethod {
    type Err = String;

    /// Accepts `max_abs`, `std_clip` / `std_clip:<lambd>` and
    /// `percentile` / `percentile:<p>`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let (name, arg) = match lower.split_once(':') {
            Some((n, a)) => (n, Some(a)),
            None => (lower.as_str(), None),
        };
        let number = |default: f64| -> Result<f64, String> {
            arg.map_or(Ok(default), |a| {
                a.trim().parse::<f64>().map_err(|_| format!("invalid argument '{a}' for '{name}'"))
            })
        };
        match name {
            "max_abs" | "maxabs" | "minmax" => Ok(RangeMethod::MaxAbs),
            "std_clip" => Ok(RangeMethod::StdClip(number(10.0)?)),
            "percentile" => Ok(RangeMethod::Percentile(number(99.99)?)),
            _ => Err(format!(
                "Unknown calibration method: '{s}'. Valid methods: max_abs, std_clip[:lambd], percentile[:p]"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_abs_is_symmetric() {
        assert_eq!(RangeMethod::MaxAbs.bound(&[-3.0, 1.0, 2.0]), 3.0);
        assert_eq!(RangeMethod::MaxAbs.bound(&[]), 0.0);
    }

    #[test]
    fn test_std_clip_trims_outlier() {
        let mut data = vec![0.0; 99];
        data.push(100.0);
        let bound = RangeMethod::StdClip(2.0).bound(&data);
        assert!(bound < 100.0 && bound > 0.0);
        // a large lambda falls back to max |x|
        assert_eq!(RangeMethod::StdClip(1e6).bound(&data), 100.0);
    }

    #[test]
    fn test_percentile_rank() {
        let data = [1.0, -2.0, 3.0, -4.0, 5.0];
        assert_eq!(RangeMethod::Percentile(50.0).bound(&data), 3.0);
        assert_eq!(RangeMethod::Percentile(100.0).bound(&data), 5.0);
    }

    #[test]
    fn test_parse() {
        assert_eq!("max_abs".parse::<RangeMethod>().unwrap(), RangeMethod::MaxAbs);
        assert_eq!("std_clip:4".parse::<RangeMethod>().unwrap(), RangeMethod::StdClip(4.0));
        assert_eq!("Percentile".parse::<RangeMethod>().unwrap(), RangeMethod::Percentile(99.99));
        assert!("entropy".parse::<RangeMethod>().is_err());
    }
}
