/// A quantile paired with its human-friendly display label.
///
/// Monitoring systems usually show abbreviated percentiles: a quantile of
/// `0.99` renders as `p99`, `0.999` as `p999`. The special cases `0.0` and
/// `1.0` render as `min` and `max`.
#[derive(Debug, Clone, PartialEq)]
pub struct Quantile {
    value: f64,
    label: String,
}

impl Quantile {
    /// Creates a new [`Quantile`] from a floating-point value.
    ///
    /// Values are clamped between 0.0 and 1.0.
    pub fn new(value: f64) -> Quantile {
        let clamped = value.clamp(0.0, 1.0);
        let label = if clamped == 0.0 {
            "min".to_string()
        } else if clamped == 1.0 {
            "max".to_string()
        } else {
            format!("p{}", clamped * 100.0).replace('.', "")
        };

        Quantile { value: clamped, label }
    }

    /// Gets the human-friendly display label.
    pub fn label(&self) -> &str {
        self.label.as_str()
    }

    /// Gets the raw quantile value.
    pub fn value(&self) -> f64 {
        self.value
    }
}

/// The fixed quantile set every summary-style metric in the pipeline emits.
pub fn pipeline_quantiles() -> Vec<Quantile> {
    [0.5, 0.9, 0.95, 0.99].iter().map(|q| Quantile::new(*q)).collect()
}

#[cfg(test)]
mod tests {
    use super::{pipeline_quantiles, Quantile};

    #[test]
    fn labels() {
        assert_eq!(Quantile::new(0.0).label(), "min");
        assert_eq!(Quantile::new(1.0).label(), "max");
        assert_eq!(Quantile::new(0.5).label(), "p50");
        assert_eq!(Quantile::new(0.9).label(), "p90");
        assert_eq!(Quantile::new(0.95).label(), "p95");
        assert_eq!(Quantile::new(0.999).label(), "p999");
    }

    #[test]
    fn clamping() {
        assert_eq!(Quantile::new(-1.0).label(), "min");
        assert_eq!(Quantile::new(1.2).label(), "max");
        assert_eq!(Quantile::new(1.2).value(), 1.0);
    }

    #[test]
    fn pipeline_set() {
        let quantiles = pipeline_quantiles();
        let labels: Vec<&str> = quantiles.iter().map(|q| q.label()).collect();
        assert_eq!(labels, vec!["p50", "p90", "p95", "p99"]);
    }
}
