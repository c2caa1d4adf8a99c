use thiserror::Error;

/// Lifecycle states of a metrics manager.
///
/// The only legal transitions are `Created → Running → Stopped`; a stopped
/// manager cannot be restarted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed but not yet started; the ring holds one idle live bucket.
    Created,
    /// Accepting ingest; the rotation timer is armed.
    Running,
    /// Stopped; the final live bucket is frozen and ingest is rejected.
    Stopped,
}

/// Errors surfaced by the metrics pipeline.
///
/// Ingest-time problems (filtered events, unsupported samples) are absorbed
/// into per-bucket counters and never raised; readers always succeed,
/// possibly with partial data. Only configuration and lifecycle violations
/// reach the caller.
#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value failed validation.
    #[error("invalid configuration for `{field}`: {reason}")]
    Config {
        /// The offending configuration key.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The operation is not allowed in the manager's current state.
    #[error("{op} is not allowed while {state:?}")]
    Lifecycle {
        /// The rejected operation.
        op: &'static str,
        /// The state the manager was in.
        state: State,
    },

    /// The sketch layer signaled a failure.
    #[error(transparent)]
    Sketch(#[from] netlens_util::SketchError),
}
