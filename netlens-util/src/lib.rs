//! Streaming sketches for the netlens metrics pipeline.
//!
//! Every sketch in this crate is bounded in memory and mergeable: two
//! sketches built over disjoint event streams can be combined into one that
//! summarizes the union, which is what lets the pipeline aggregate rotated
//! time windows without retaining raw events.

use thiserror::Error;

mod cardinality;
mod histogram;
mod quantile;
mod summary;
mod topk;

pub use cardinality::HyperLogLog;
pub use histogram::Histogram;
pub use quantile::{pipeline_quantiles, Quantile};
pub use summary::Summary;
pub use topk::TopK;

/// Errors signaled by the sketch layer.
///
/// Sketch failures never abort a render; callers log them and omit the
/// offending value.
#[derive(Debug, Error)]
pub enum SketchError {
    /// The two summaries were built with incompatible configurations.
    #[error("summary merge failed: {0}")]
    Summary(#[from] sketches_ddsketch::DDSketchError),

    /// The two histograms do not share the same bucket bounds.
    #[error("histogram bounds do not match")]
    BoundsMismatch,
}
