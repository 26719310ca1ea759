use serde::{Deserialize, Serialize};

/// Running summary of one tensor's observed values across batches.
///
/// Only first and second moments are kept, so merging batches is O(1) and
/// the summary serializes into the quantization context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
    pub count: usize,

    sum: f64,
    sum_sq: f64,
}

impl TensorStats {
    pub fn from_data(data: &[f64]) -> Self {
        let mut stats = Self::default();
        stats.update(data);
        stats
    }

    pub fn update(&mut self, data: &[f64]) {
        let finite: Vec<f64> = data.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return;
        }

        let data_min = finite.iter().copied().fold(f64::INFINITY, f64::min);
        let data_max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if self.count == 0 {
            self.min = data_min;
            self.max = data_max;
        } else {
            self.min = self.min.min(data_min);
            self.max = self.max.max(data_max);
        }

        self.sum += finite.iter().sum::<f64>();
        self.sum_sq += finite.iter().map(|v| v * v).sum::<f64>();
        self.count += finite.len();

        let n = self.count as f64;
        self.mean = self.sum / n;
        self.std = (self.sum_sq / n - self.mean * self.mean).max(0.0).sqrt();
    }

    /// Combine two summaries as if their batches had been observed together.
    pub fn merge(&mut self, other: &TensorStats) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = other.clone();
            return;
        }
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.sum += other.sum;
        self.sum_sq += other.sum_sq;
        self.count += other.count;

        let n = self.count as f64;
        self.mean = self.sum / n;
        self.std = (self.sum_sq / n - self.mean * self.mean).max(0.0).sqrt();
    }

    pub fn max_abs(&self) -> f64 {
        self.min.abs().max(self.max.abs())
    }
}

impl Default for TensorStats {
    fn default() -> Self {
        Self { min: 0.0, max: 0.0, mean: 0.0, std: 0.0, count: 0, sum: 0.0, sum_sq: 0.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_stats() {
        let data = vec![-1.0, -0.5, 0.0, 0.5, 1.0];
        let stats = TensorStats::from_data(&data);

        assert_eq!(stats.min, -1.0);
        assert_eq!(stats.max, 1.0);
        assert!(stats.mean.abs() < 1e-12);
        assert!((stats.std - 0.5f64.sqrt()).abs() < 1e-12);
        assert_eq!(stats.max_abs(), 1.0);
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let a = [1.0, 2.0, 3.0];
        let b = [10.0, -4.0];
        let mut merged = TensorStats::from_data(&a);
        merged.merge(&TensorStats::from_data(&b));

        let whole = TensorStats::from_data(&[1.0, 2.0, 3.0, 10.0, -4.0]);
        assert_eq!(merged.count, whole.count);
        assert_eq!(merged.min, -4.0);
        assert_eq!(merged.max, 10.0);
        assert!((merged.mean - whole.mean).abs() < 1e-12);
        assert!((merged.std - whole.std).abs() < 1e-12);
    }

    #[test]
    fn test_ignores_non_finite() {
        let stats = TensorStats::from_data(&[f64::NAN, 2.0, f64::INFINITY]);
        assert_eq!(stats.count, 1);
        assert_eq!(stats.max, 2.0);
    }
}
