//! Fixed-bound histogram data.

use crate::SketchError;

/// A bucketed histogram.
///
/// Tracks how many samples fall at or below each pre-defined bound. Bucket
/// counts are cumulative, matching the "less than or equal" semantics of
/// Prometheus histogram buckets. Samples above the highest bound still count
/// toward `count` and `sum`.
///
/// Two histograms with identical bounds merge by summing bucket counts.
#[derive(Debug, Clone)]
pub struct Histogram {
    count: u64,
    bounds: Vec<f64>,
    buckets: Vec<u64>,
    sum: f64,
}

impl Histogram {
    /// Creates a new `Histogram`.
    ///
    /// If `bounds` is empty, returns `None`.
    pub fn new(bounds: &[f64]) -> Option<Histogram> {
        if bounds.is_empty() {
            return None;
        }

        let buckets = vec![0u64; bounds.len()];

        Some(Histogram {
            count: 0,
            bounds: Vec::from(bounds),
            buckets,
            sum: 0.0,
        })
    }

    /// Gets the sum of all samples.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Gets the sample count.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Gets the buckets as `(bound, cumulative count)` pairs.
    pub fn buckets(&self) -> Vec<(f64, u64)> {
        self.bounds
            .iter()
            .cloned()
            .zip(self.buckets.iter().cloned())
            .collect()
    }

    /// Records a single sample.
    pub fn record(&mut self, sample: f64) {
        self.sum += sample;
        self.count += 1;

        for (idx, bound) in self.bounds.iter().enumerate() {
            if sample <= *bound {
                self.buckets[idx] += 1;
            }
        }
    }

    /// Estimates the value at quantile `q` from the bucket bounds.
    ///
    /// The estimate is the smallest bound whose cumulative count reaches the
    /// target rank; samples past the highest bound clamp to that bound.
    /// Returns `None` for an empty histogram or `q` outside `[0.0, 1.0]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if self.count == 0 || !(0.0..=1.0).contains(&q) {
            return None;
        }

        let rank = (q * self.count as f64).ceil() as u64;
        for (idx, cumulative) in self.buckets.iter().enumerate() {
            if *cumulative >= rank {
                return Some(self.bounds[idx]);
            }
        }
        self.bounds.last().copied()
    }

    /// Merges another histogram into this one.
    ///
    /// Fails unless both histograms share the same bounds.
    pub fn merge(&mut self, other: &Histogram) -> Result<(), SketchError> {
        if self.bounds != other.bounds {
            return Err(SketchError::BoundsMismatch);
        }

        for (mine, theirs) in self.buckets.iter_mut().zip(other.buckets.iter()) {
            *mine += theirs;
        }
        self.count += other.count;
        self.sum += other.sum;
        Ok(())
    }

    /// Whether this histogram has seen any samples.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::Histogram;

    #[test]
    fn rejects_empty_bounds() {
        assert!(Histogram::new(&[]).is_none());
    }

    #[test]
    fn cumulative_buckets() {
        let bounds = &[10.0, 25.0, 100.0];
        let values = [3.0, 2.0, 6.0, 12.0, 56.0, 82.0, 202.0, 100.0, 29.0];

        let mut histogram = Histogram::new(bounds).expect("bounds are non-empty");
        for v in values {
            histogram.record(v);
        }
        histogram.record(89.0);

        let result = histogram.buckets();
        assert_eq!(result.len(), 3);

        let (_, first) = result[0];
        assert_eq!(first, 3);
        let (_, second) = result[1];
        assert_eq!(second, 4);
        let (_, third) = result[2];
        assert_eq!(third, 9);

        assert_eq!(histogram.count(), values.len() as u64 + 1);
        assert_eq!(histogram.sum(), 581.0);
    }

    #[test]
    fn quantile_from_bounds() {
        let mut histogram = Histogram::new(&[64.0, 512.0, 1500.0]).unwrap();
        for _ in 0..90 {
            histogram.record(60.0);
        }
        for _ in 0..10 {
            histogram.record(1400.0);
        }

        assert_eq!(histogram.quantile(0.5), Some(64.0));
        assert_eq!(histogram.quantile(0.9), Some(64.0));
        assert_eq!(histogram.quantile(0.95), Some(1500.0));
        // Above the highest bound clamps.
        histogram.record(9000.0);
        assert_eq!(histogram.quantile(1.0), Some(1500.0));
    }

    #[test]
    fn merge_requires_matching_bounds() {
        let mut a = Histogram::new(&[1.0, 2.0]).unwrap();
        let b = Histogram::new(&[1.0, 3.0]).unwrap();
        assert!(a.merge(&b).is_err());
    }

    #[test]
    fn merge_sums_counts() {
        let bounds = &[10.0, 100.0];
        let mut a = Histogram::new(bounds).unwrap();
        let mut b = Histogram::new(bounds).unwrap();
        a.record(5.0);
        a.record(50.0);
        b.record(7.0);

        a.merge(&b).unwrap();
        assert_eq!(a.count(), 3);
        assert_eq!(a.sum(), 62.0);
        assert_eq!(a.buckets(), vec![(10.0, 2), (100.0, 3)]);
    }
}
