use sketches_ddsketch::{Config, DDSketch};

use crate::SketchError;

/// A quantile sketch with relative-error guarantees.
///
/// Based on [DDSketch](https://arxiv.org/abs/1908.10693), `Summary` provides
/// quantiles over a distribution of non-negative floating-point numbers using
/// a space-efficient sketch whose error is relative to the true value,
/// regardless of the absolute range between the smallest and largest values.
///
/// Values whose magnitude is at or below `min_value` (including any stray
/// negative inputs) are collapsed into a zero band and still participate in
/// rank calculations, so a stream of mostly-zero samples reports its
/// quantiles correctly.
///
/// Unlike a plain DDSketch, two summaries can be merged as long as they were
/// created with the same parameters, which holds for every summary the
/// pipeline creates via [`Summary::with_defaults`].
#[derive(Clone)]
pub struct Summary {
    sketch: DDSketch,
    min_value: f64,
    zeroes: usize,
    min: Option<f64>,
    max: Option<f64>,
    sum: f64,
}

impl Summary {
    /// Creates a new [`Summary`].
    ///
    /// `alpha` is the desired relative error. `max_bins` bounds memory: each
    /// bin costs eight bytes, and bins are allocated on demand as the value
    /// range grows. `min_value` is the smallest value distinguished from
    /// zero.
    pub fn new(alpha: f64, max_bins: u32, min_value: f64) -> Summary {
        let config = Config::new(alpha, max_bins, min_value.abs());

        Summary {
            sketch: DDSketch::new(config),
            min_value: min_value.abs(),
            zeroes: 0,
            min: None,
            max: None,
            sum: 0.0,
        }
    }

    /// Creates a new [`Summary`] with default values.
    ///
    /// `alpha` is 0.0001, `max_bins` is 32,768, and `min_value` is 1.0e-9.
    pub fn with_defaults() -> Summary {
        Summary::new(0.0001, 32_768, 1.0e-9)
    }

    /// Adds a sample to the summary.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }

        match self.min {
            None => self.min = Some(value),
            Some(ref mut min) => {
                if value < *min {
                    *min = value;
                }
            }
        }

        match self.max {
            None => self.max = Some(value),
            Some(ref mut max) => {
                if value > *max {
                    *max = value;
                }
            }
        }

        self.sum += value;

        if value > self.min_value {
            self.sketch.add(value);
        } else {
            self.zeroes += 1;
        }
    }

    /// Gets the estimated value at the given quantile.
    ///
    /// Returns `None` if the sketch is empty or `q` lies outside `[0.0, 1.0]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if !(0.0..=1.0).contains(&q) {
            return None;
        }

        let pcount = self.sketch.count();
        let total = pcount + self.zeroes;
        if total == 0 {
            return None;
        }

        let rank = ((q * total as f64).ceil() as usize).max(1);
        if rank <= self.zeroes || pcount == 0 {
            return Some(0.0);
        }

        let pq = (rank - self.zeroes) as f64 / pcount as f64;
        // The argument is in range by construction, so the only failure mode
        // left is an empty positive sketch, handled above.
        self.sketch.quantile(pq).ok().flatten()
    }

    /// Merges another summary into this one.
    ///
    /// Fails if the two summaries were created with different parameters.
    pub fn merge(&mut self, other: &Summary) -> Result<(), SketchError> {
        self.sketch.merge(&other.sketch)?;
        self.zeroes += other.zeroes;
        self.sum += other.sum;
        self.min = match (self.min, other.min) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max = match (self.max, other.max) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        Ok(())
    }

    /// Gets the minimum value this summary has seen so far.
    pub fn min(&self) -> Option<f64> {
        self.min
    }

    /// Gets the maximum value this summary has seen so far.
    pub fn max(&self) -> Option<f64> {
        self.max
    }

    /// Gets the sum of all samples.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Gets the number of samples in this summary.
    pub fn count(&self) -> usize {
        self.sketch.count() + self.zeroes
    }

    /// Whether this summary has seen any samples.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use quickcheck_macros::quickcheck;

    use super::Summary;

    #[test]
    fn empty() {
        let summary = Summary::with_defaults();
        assert!(summary.is_empty());
        assert_eq!(summary.count(), 0);
        assert_eq!(summary.quantile(0.5), None);
        assert_eq!(summary.min(), None);
        assert_eq!(summary.max(), None);
    }

    #[test]
    fn single_value() {
        let mut summary = Summary::with_defaults();
        summary.add(1518.0);

        assert_eq!(summary.count(), 1);
        assert_eq!(summary.min(), Some(1518.0));
        assert_eq!(summary.max(), Some(1518.0));
        for q in [0.5, 0.9, 0.95, 0.99] {
            assert_relative_eq!(summary.quantile(q).unwrap(), 1518.0, max_relative = 0.001);
        }
    }

    #[test]
    fn quantile_bounds() {
        let mut summary = Summary::with_defaults();
        summary.add(1.0);
        assert_eq!(summary.quantile(-0.1), None);
        assert_eq!(summary.quantile(1.1), None);
    }

    #[test]
    fn zero_band() {
        let mut summary = Summary::with_defaults();
        for _ in 0..99 {
            summary.add(0.0);
        }
        summary.add(100.0);

        assert_eq!(summary.count(), 100);
        assert_eq!(summary.quantile(0.5), Some(0.0));
        assert_relative_eq!(summary.quantile(1.0).unwrap(), 100.0, max_relative = 0.001);
    }

    #[test]
    fn uniform_ramp() {
        let mut summary = Summary::with_defaults();
        for i in 1..=1000 {
            summary.add(i as f64);
        }

        assert_relative_eq!(summary.quantile(0.5).unwrap(), 500.0, max_relative = 0.01);
        assert_relative_eq!(summary.quantile(0.99).unwrap(), 990.0, max_relative = 0.01);
        assert_eq!(summary.min(), Some(1.0));
        assert_eq!(summary.max(), Some(1000.0));
    }

    #[test]
    fn merge_matches_single_stream() {
        let mut left = Summary::with_defaults();
        let mut right = Summary::with_defaults();
        let mut whole = Summary::with_defaults();

        for i in 1..=500 {
            left.add(i as f64);
            whole.add(i as f64);
        }
        for i in 501..=1000 {
            right.add(i as f64);
            whole.add(i as f64);
        }

        left.merge(&right).unwrap();
        assert_eq!(left.count(), whole.count());
        assert_eq!(left.min(), whole.min());
        assert_eq!(left.max(), whole.max());
        for q in [0.5, 0.9, 0.95, 0.99] {
            assert_relative_eq!(
                left.quantile(q).unwrap(),
                whole.quantile(q).unwrap(),
                max_relative = 0.01
            );
        }
    }

    #[quickcheck]
    fn merge_commutes(xs: Vec<u32>, ys: Vec<u32>) -> bool {
        let mut a = Summary::with_defaults();
        let mut b = Summary::with_defaults();
        for x in &xs {
            a.add(*x as f64);
        }
        for y in &ys {
            b.add(*y as f64);
        }

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b;
        ba.merge(&a).unwrap();

        let close = |l: Option<f64>, r: Option<f64>| match (l, r) {
            (None, None) => true,
            (Some(l), Some(r)) => (l - r).abs() <= 0.001 * l.abs().max(r.abs()).max(1.0),
            _ => false,
        };

        ab.count() == ba.count()
            && close(ab.quantile(0.5), ba.quantile(0.5))
            && close(ab.quantile(0.99), ba.quantile(0.99))
    }
}
